//! The deputy reconciliation engine.
//!
//! Owns the side table of supervised commands and drives everything
//! from event-loop callbacks:
//! - discovery mode at startup, with identity-conflict detection
//! - orders reconciliation against observed state, including culling
//! - the per-command start/stop/respawn state machine with backoff
//! - output capture into coalesced `PM_OUTPUT` batches
//! - 1 Hz CPU/memory sampling published as `PM_INFO`
//! - shutdown sequencing (polite stop, then SIGKILL sweep)
//!
//! Everything runs on the event-loop thread. The engine lives in an
//! `Rc<RefCell<..>>`; callbacks hold a `Weak` and take one mutable
//! borrow for the duration of a dispatch. Command records are looked
//! up by id from callbacks, never pointed at.

pub mod output;

use posse_common::{
    CommandConfig, CommandId, CommandStatus, DeputyId, DeputyInfoMsg, DiscoverMsg, OrdersMsg,
    OutputMsg, Result, DISCOVER_CHANNEL, INFO_CHANNEL, ORDERS_CHANNEL, OUTPUT_CHANNEL,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use crate::bus::{Bus, BusEvent, BusUrl};
use crate::event_loop::{EventLoop, EventType, SocketHandle, TimerHandle, TimerType};
use crate::exit_codes::ExitCode;
use crate::procinfo::{self, ProcessInfo, SystemInfo};
use crate::procman::{CommandToken, Procman};
use crate::timestamp_now;
use output::OutputAccumulator;

const MIN_RESPAWN_DELAY_MS: i64 = 10;
const MAX_RESPAWN_DELAY_MS: i64 = 1000;
const RESPAWN_BACKOFF_RATE: i64 = 2;
const DISCOVERY_TIME_MS: i64 = 1500;
const DISCOVERY_BEACON_INTERVAL_MS: i64 = 200;
const STATUS_INTERVAL_MS: i64 = 1000;
const INTROSPECTION_INTERVAL_MS: i64 = 120_000;
const MAX_ORDERS_AGE_US: i64 = 60_000_000;
const OUTPUT_READ_CHUNK: usize = 1024;

/// Deputy startup options.
#[derive(Debug, Clone)]
pub struct DeputyOptions {
    /// Deputy id; defaults to the system hostname.
    pub deputy_id: Option<String>,
    pub bus_url: BusUrl,
    /// Echo captured command output to the local log.
    pub verbose: bool,
    /// Install the process-global POSIX signal handlers. Disable only
    /// when hosting several engines in one process (tests), and drive
    /// [`ProcmanDeputy::on_posix_signal`] by hand.
    pub wire_posix_signals: bool,
}

impl Default for DeputyOptions {
    fn default() -> Self {
        DeputyOptions {
            deputy_id: None,
            bus_url: BusUrl::default(),
            verbose: false,
            wire_posix_signals: true,
        }
    }
}

/// Per-command supervision state, keyed by command id in the engine's
/// side table. The process-level record lives in the process manager
/// and is reached through `token`.
struct DeputyCommand {
    token: CommandToken,
    group: String,
    auto_respawn: bool,
    stop_signal: i32,
    stop_time_allowed: f32,
    /// Runid of the most recent start; compared against orders to
    /// decide on restarts.
    actual_runid: i32,
    should_be_running: bool,
    /// Previous and current resource snapshots for usage differencing.
    cpu_time: [ProcessInfo; 2],
    cpu_usage: f32,
    last_start_time: i64,
    respawn_backoff_ms: i64,
    num_kills_sent: i32,
    first_kill_time: i64,
    /// Set when orders stopped listing this command while it was still
    /// running; the record is destroyed at reap time.
    remove_requested: bool,
    /// Keeps the pty read registration alive while the child runs.
    #[allow(dead_code)]
    stdout_notifier: Option<SocketHandle>,
    respawn_timer: Option<TimerHandle>,
}

/// The deputy engine.
pub struct ProcmanDeputy {
    options: DeputyOptions,
    event_loop: EventLoop,
    bus: Bus,
    pm: Procman,
    deputy_id: DeputyId,
    deputy_pid: i32,
    deputy_start_time: i64,
    cpu_load: f32,
    sys_info: [SystemInfo; 2],
    commands: HashMap<CommandId, DeputyCommand>,
    exiting: bool,
    fatal_exit: Option<ExitCode>,
    output: OutputAccumulator,
    weak_self: Weak<RefCell<ProcmanDeputy>>,
    discovery_timer: Option<TimerHandle>,
    status_timer: Option<TimerHandle>,
    introspection_timer: Option<TimerHandle>,
    // Held for their registrations; dropping any would cancel it.
    #[allow(dead_code)]
    output_flush_timer: Option<TimerHandle>,
    #[allow(dead_code)]
    quit_timer: Option<TimerHandle>,
    #[allow(dead_code)]
    bus_notifier: Option<SocketHandle>,
}

fn default_deputy_id() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "deputy".to_string())
}

fn signal_name(signum: i32) -> &'static str {
    nix::sys::signal::Signal::try_from(signum)
        .map(|s| s.as_str())
        .unwrap_or("unknown signal")
}

impl ProcmanDeputy {
    /// Open the bus, wire timers/sockets/signals, and send the first
    /// discovery beacon. Fails only on bus or signal-handler setup.
    pub fn new(options: DeputyOptions) -> Result<Rc<RefCell<Self>>> {
        let deputy_id = DeputyId::from(
            options
                .deputy_id
                .clone()
                .unwrap_or_else(default_deputy_id),
        );

        let mut bus = Bus::open(&options.bus_url)?;
        bus.subscribe(INFO_CHANNEL);
        bus.subscribe(DISCOVER_CHANNEL);

        tracing::info!(deputy_id = %deputy_id, bus = %options.bus_url, "deputy starting");

        let this = Rc::new_cyclic(|weak| {
            RefCell::new(ProcmanDeputy {
                options,
                event_loop: EventLoop::new(),
                bus,
                pm: Procman::new(),
                deputy_id,
                deputy_pid: std::process::id() as i32,
                deputy_start_time: timestamp_now(),
                cpu_load: -1.0,
                sys_info: [SystemInfo::default(); 2],
                commands: HashMap::new(),
                exiting: false,
                fatal_exit: None,
                output: OutputAccumulator::new(),
                weak_self: weak.clone(),
                discovery_timer: None,
                status_timer: None,
                introspection_timer: None,
                output_flush_timer: None,
                quit_timer: None,
                bus_notifier: None,
            })
        });

        Self::wire(&this)?;
        Ok(this)
    }

    fn wire(this: &Rc<RefCell<Self>>) -> Result<()> {
        let (event_loop, bus_fd, wire_signals) = {
            let d = this.borrow();
            (
                d.event_loop.clone(),
                d.bus.fd(),
                d.options.wire_posix_signals,
            )
        };

        let callback = |weak: Weak<RefCell<Self>>, f: fn(&mut Self)| -> Box<dyn FnMut()> {
            Box::new(move || {
                if let Some(d) = weak.upgrade() {
                    f(&mut d.borrow_mut());
                }
            })
        };

        let discovery_timer = event_loop.add_timer(
            DISCOVERY_BEACON_INTERVAL_MS,
            TimerType::Repeating,
            true,
            callback(Rc::downgrade(this), Self::on_discovery_timer),
        );
        let status_timer = event_loop.add_timer(
            STATUS_INTERVAL_MS,
            TimerType::Repeating,
            false,
            callback(Rc::downgrade(this), Self::on_status_timer),
        );
        let introspection_timer = event_loop.add_timer(
            INTROSPECTION_INTERVAL_MS,
            TimerType::Repeating,
            false,
            callback(Rc::downgrade(this), Self::on_introspection_timer),
        );
        let output_flush_timer = event_loop.add_timer(
            output::FLUSH_INTERVAL_MS,
            TimerType::Repeating,
            true,
            callback(Rc::downgrade(this), Self::maybe_publish_output),
        );
        let bus_notifier = event_loop.add_socket(
            bus_fd,
            EventType::Read,
            callback(Rc::downgrade(this), Self::on_bus_readable),
        );

        if wire_signals {
            let weak = Rc::downgrade(this);
            event_loop.set_posix_signals(
                &[
                    libc::SIGINT,
                    libc::SIGHUP,
                    libc::SIGQUIT,
                    libc::SIGTERM,
                    libc::SIGCHLD,
                ],
                Box::new(move |signum| {
                    if let Some(d) = weak.upgrade() {
                        d.borrow_mut().on_posix_signal(signum);
                    }
                }),
            )?;
        }

        {
            let mut d = this.borrow_mut();
            d.discovery_timer = Some(discovery_timer);
            d.status_timer = Some(status_timer);
            d.introspection_timer = Some(introspection_timer);
            d.output_flush_timer = Some(output_flush_timer);
            d.bus_notifier = Some(bus_notifier);
        }

        // First beacon goes out immediately.
        this.borrow_mut().on_discovery_timer();
        Ok(())
    }

    /// Run the event loop until shutdown or a fatal identity conflict.
    pub fn run(this: &Rc<RefCell<Self>>) -> ExitCode {
        let event_loop = this.borrow().event_loop.clone();
        event_loop.run();
        this.borrow().fatal_exit.unwrap_or(ExitCode::Clean)
    }

    pub fn deputy_id(&self) -> &DeputyId {
        &self.deputy_id
    }

    pub fn event_loop(&self) -> EventLoop {
        self.event_loop.clone()
    }

    pub fn fatal_exit(&self) -> Option<ExitCode> {
        self.fatal_exit
    }

    pub fn exiting(&self) -> bool {
        self.exiting
    }

    /// Define a variable for exec-string expansion.
    pub fn set_variable(&mut self, name: &str, value: &str) {
        self.pm.set_variable(name, value);
    }

    fn in_discovery_mode(&self) -> bool {
        timestamp_now() < self.deputy_start_time + DISCOVERY_TIME_MS * 1000
    }

    fn fatal(&mut self, code: ExitCode) {
        self.fatal_exit = Some(code);
        self.event_loop.quit();
    }

    fn any_running(&self) -> bool {
        self.pm.commands().any(|c| c.pid() != 0)
    }

    // ------------------------------------------------------------------
    // Bus handling
    // ------------------------------------------------------------------

    fn on_bus_readable(&mut self) {
        for event in self.bus.handle() {
            match event {
                BusEvent::Discover(msg) => self.handle_discover(&msg),
                BusEvent::Info(msg) => self.handle_info(&msg),
                BusEvent::Orders(msg) => self.handle_orders(&msg),
                // We never subscribe to our own output channel.
                BusEvent::Output(_) => {}
            }
        }
    }

    fn handle_discover(&mut self, msg: &DiscoverMsg) {
        if self.in_discovery_mode() {
            // A beacon with our id but a different nonce means another
            // deputy is racing us for the name.
            if msg.transmitter_id == self.deputy_id && msg.nonce != self.deputy_pid {
                tracing::error!(
                    deputy_id = %msg.transmitter_id,
                    "detected another deputy with our id; aborting to avoid conflicts"
                );
                self.fatal(ExitCode::OsError);
            }
        } else {
            // Active mode: a discovery doubles as a ping.
            self.transmit_process_info();
        }
    }

    fn handle_info(&mut self, msg: &DeputyInfoMsg) {
        if self.in_discovery_mode() {
            if msg.deputy_id == self.deputy_id {
                tracing::error!(
                    deputy_id = %msg.deputy_id,
                    "an established deputy already owns our id; aborting"
                );
                self.fatal(ExitCode::DuplicateDeputy);
            }
        } else {
            tracing::warn!("still receiving deputy info while not in discovery mode");
        }
    }

    /// Apply one orders message: create/update/reconcile every listed
    /// command, cull the rest, publish status if anything changed.
    pub fn handle_orders(&mut self, orders: &OrdersMsg) {
        if self.exiting {
            return;
        }
        if orders.deputy_id != self.deputy_id {
            tracing::trace!(target_id = %orders.deputy_id, "ignoring orders for another deputy");
            return;
        }

        let now = timestamp_now();
        if now - orders.utime > MAX_ORDERS_AGE_US {
            for desired in &orders.cmds {
                self.printf_and_transmit(
                    &desired.cmd.command_id,
                    &format!(
                        "ignoring stale orders (utime {} seconds ago). \
                         You may want to check the system clocks!\n",
                        (now - orders.utime) / 1_000_000
                    ),
                );
            }
            return;
        }

        let mut action_taken = false;

        for desired in &orders.cmds {
            let cmd_id = desired.cmd.command_id.clone();

            if !self.commands.contains_key(&cmd_id) {
                let token = self.pm.add_command(&desired.cmd.exec_str);
                let _ = self.pm.set_command_id(token, cmd_id.clone());

                let weak = self.weak_self.clone();
                let respawn_id = cmd_id.clone();
                let respawn_timer = self.event_loop.add_timer(
                    MIN_RESPAWN_DELAY_MS,
                    TimerType::SingleShot,
                    false,
                    Box::new(move || {
                        if let Some(d) = weak.upgrade() {
                            d.borrow_mut().on_respawn_timer(&respawn_id);
                        }
                    }),
                );

                self.commands.insert(
                    cmd_id.clone(),
                    DeputyCommand {
                        token,
                        group: desired.cmd.group.clone(),
                        auto_respawn: desired.cmd.auto_respawn,
                        stop_signal: desired.cmd.stop_signal,
                        stop_time_allowed: desired.cmd.stop_time_allowed,
                        actual_runid: 0,
                        should_be_running: false,
                        cpu_time: [ProcessInfo::default(); 2],
                        cpu_usage: 0.0,
                        last_start_time: 0,
                        respawn_backoff_ms: MIN_RESPAWN_DELAY_MS,
                        num_kills_sent: 0,
                        first_kill_time: 0,
                        remove_requested: false,
                        stdout_notifier: None,
                        respawn_timer: Some(respawn_timer),
                    },
                );
                tracing::info!(%cmd_id, exec = desired.cmd.exec_str.as_str(), "new command");
                action_taken = true;
            }

            let token = self.commands[&cmd_id].token;

            // Exec change waits for the next start; a running child is
            // untouched.
            let current_exec = self
                .pm
                .command(token)
                .map(|c| c.exec_str().to_string())
                .unwrap_or_default();
            if current_exec != desired.cmd.exec_str {
                tracing::info!(%cmd_id, exec = desired.cmd.exec_str.as_str(), "exec str changed");
                let _ = self.pm.set_command_exec_str(token, &desired.cmd.exec_str);
                action_taken = true;
            }

            if let Some(mi) = self.commands.get_mut(&cmd_id) {
                if mi.auto_respawn != desired.cmd.auto_respawn {
                    tracing::info!(%cmd_id, auto_respawn = desired.cmd.auto_respawn, "auto-respawn changed");
                    mi.auto_respawn = desired.cmd.auto_respawn;
                }
                if mi.group != desired.cmd.group {
                    tracing::info!(%cmd_id, group = desired.cmd.group.as_str(), "group changed");
                    mi.group = desired.cmd.group.clone();
                    action_taken = true;
                }
                if mi.stop_signal != desired.cmd.stop_signal {
                    tracing::debug!(%cmd_id, stop_signal = desired.cmd.stop_signal, "stop signal changed");
                    mi.stop_signal = desired.cmd.stop_signal;
                }
                if (mi.stop_time_allowed - desired.cmd.stop_time_allowed).abs() > f32::EPSILON {
                    tracing::debug!(%cmd_id, stop_time_allowed = desired.cmd.stop_time_allowed,
                        "stop time allowed changed");
                    mi.stop_time_allowed = desired.cmd.stop_time_allowed;
                }
                mi.should_be_running = !desired.force_quit;
            }

            let running = self.pm.command(token).map(|c| c.pid() > 0).unwrap_or(false);
            let (actual_runid, should_be_running) = {
                let mi = &self.commands[&cmd_id];
                (mi.actual_runid, mi.should_be_running)
            };

            if !running && actual_runid != desired.desired_runid && should_be_running {
                self.start_command(&cmd_id, desired.desired_runid);
                action_taken = true;
            } else if running
                && (!should_be_running
                    || (desired.desired_runid != actual_runid && desired.desired_runid != 0))
            {
                self.stop_command(&cmd_id);
                action_taken = true;
            } else if desired.desired_runid != 0 {
                if let Some(mi) = self.commands.get_mut(&cmd_id) {
                    mi.actual_runid = desired.desired_runid;
                }
            }
        }

        // Cull commands the orders no longer mention.
        let known: Vec<CommandId> = self.commands.keys().cloned().collect();
        for cmd_id in known {
            if orders.cmds.iter().any(|c| c.cmd.command_id == cmd_id) {
                continue;
            }
            let token = self.commands[&cmd_id].token;
            let running = self.pm.command(token).map(|c| c.pid() > 0).unwrap_or(false);
            if running {
                tracing::info!(%cmd_id, "scheduling removal");
                if let Some(mi) = self.commands.get_mut(&cmd_id) {
                    mi.remove_requested = true;
                }
                self.stop_command(&cmd_id);
            } else {
                tracing::info!(%cmd_id, "remove");
                self.commands.remove(&cmd_id);
                let _ = self.pm.remove_command(token);
            }
            action_taken = true;
        }

        if action_taken {
            self.transmit_process_info();
        }
    }

    // ------------------------------------------------------------------
    // Per-command state machine
    // ------------------------------------------------------------------

    fn on_respawn_timer(&mut self, cmd_id: &CommandId) {
        let Some(mi) = self.commands.get(cmd_id) else {
            return;
        };
        if mi.auto_respawn && mi.should_be_running && !self.exiting {
            let runid = mi.actual_runid;
            self.start_command(cmd_id, runid);
        }
    }

    fn maybe_schedule_respawn(&mut self, cmd_id: &CommandId) {
        if self.exiting {
            return;
        }
        if let Some(mi) = self.commands.get(cmd_id) {
            if mi.auto_respawn && mi.should_be_running {
                if let Some(timer) = &mi.respawn_timer {
                    timer.set_interval(mi.respawn_backoff_ms);
                    timer.start();
                }
            }
        }
    }

    /// Start (or restart) a command, updating the respawn backoff.
    ///
    /// Backoff doubles when the previous start was less than a second
    /// ago and decays by one right-shift per elapsed second otherwise,
    /// bounded to [10 ms, 1000 ms].
    fn start_command(&mut self, cmd_id: &CommandId, desired_runid: i32) {
        if self.exiting {
            return;
        }
        let Some(mi) = self.commands.get_mut(cmd_id) else {
            return;
        };
        tracing::info!(%cmd_id, "start");

        mi.should_be_running = true;
        if let Some(timer) = &mi.respawn_timer {
            timer.stop();
        }

        let now = timestamp_now();
        let ms_since_started = (now - mi.last_start_time) / 1000;
        if ms_since_started < MAX_RESPAWN_DELAY_MS {
            mi.respawn_backoff_ms =
                (mi.respawn_backoff_ms * RESPAWN_BACKOFF_RATE).min(MAX_RESPAWN_DELAY_MS);
        } else {
            let shift = (ms_since_started / MAX_RESPAWN_DELAY_MS).min(62) as u32;
            mi.respawn_backoff_ms = (mi.respawn_backoff_ms >> shift).max(MIN_RESPAWN_DELAY_MS);
        }
        mi.last_start_time = now;
        let token = mi.token;

        match self.pm.start_command(token) {
            Ok(()) => {
                let fd = self
                    .pm
                    .command(token)
                    .map(|c| c.stdout_fd())
                    .unwrap_or(-1);
                set_nonblocking(fd);

                let weak = self.weak_self.clone();
                let notify_id = cmd_id.clone();
                let notifier = self.event_loop.add_socket(
                    fd,
                    EventType::Read,
                    Box::new(move || {
                        if let Some(d) = weak.upgrade() {
                            d.borrow_mut().on_process_output(&notify_id);
                        }
                    }),
                );
                if let Some(mi) = self.commands.get_mut(cmd_id) {
                    mi.stdout_notifier = Some(notifier);
                }
            }
            Err(e) => {
                tracing::error!(%cmd_id, error = %e, "start failed");
                self.printf_and_transmit(cmd_id, &format!("failed to start: {e}\n"));
                self.maybe_schedule_respawn(cmd_id);
            }
        }

        if let Some(mi) = self.commands.get_mut(cmd_id) {
            mi.actual_runid = desired_runid;
            mi.num_kills_sent = 0;
            mi.first_kill_time = 0;
        }
    }

    /// Request a stop. The first call delivers the configured stop
    /// signal; once `stop_time_allowed` has elapsed, subsequent calls
    /// escalate to SIGKILL.
    fn stop_command(&mut self, cmd_id: &CommandId) {
        let Some(mi) = self.commands.get_mut(cmd_id) else {
            return;
        };
        let token = mi.token;
        if self.pm.command(token).map(|c| c.pid()).unwrap_or(0) == 0 {
            return;
        }

        mi.should_be_running = false;
        if let Some(timer) = &mi.respawn_timer {
            timer.stop();
        }
        let stop_signal = mi.stop_signal;
        let first_kill_time = mi.first_kill_time;
        let sigkill_time = first_kill_time + (mi.stop_time_allowed as f64 * 1e6) as i64;

        let now = timestamp_now();
        let result = if first_kill_time == 0 {
            tracing::info!(%cmd_id, signum = stop_signal, "stop");
            let r = self.pm.kill_command(token, stop_signal);
            if let Some(mi) = self.commands.get_mut(cmd_id) {
                mi.first_kill_time = now;
                mi.num_kills_sent += 1;
            }
            r
        } else if now > sigkill_time {
            tracing::info!(%cmd_id, signum = libc::SIGKILL, "stop escalation");
            self.pm.kill_command(token, libc::SIGKILL)
        } else {
            return;
        };

        if let Err(e) = result {
            tracing::warn!(%cmd_id, error = %e, "kill failed");
            self.printf_and_transmit(cmd_id, "failed to send kill signal to command\n");
        }
    }

    /// Drain the reap queue: collect trailing output, log and publish
    /// the termination cause, close the pty, then either destroy the
    /// record (cull finished) or arm the respawn timer.
    pub fn check_for_stopped_commands(&mut self) {
        while let Some(token) = self.pm.check_for_stopped_commands() {
            let Some(cmd_id) = self.command_id_for_token(token) else {
                // Not in the side table; just release the pty.
                self.pm.cleanup_stopped_command(token);
                continue;
            };

            // The pty is still open: pull out anything buffered before
            // it goes away.
            self.drain_command_output(&cmd_id, token);

            let exit_status = self
                .pm
                .command(token)
                .map(|c| c.exit_status())
                .unwrap_or(0);
            if libc::WIFSIGNALED(exit_status) {
                let signum = libc::WTERMSIG(exit_status);
                tracing::info!(%cmd_id, signum, "terminated by signal");
                self.printf_and_transmit(
                    &cmd_id,
                    &format!("{} (signal {})\n", signal_name(signum), signum),
                );
                if libc::WCOREDUMP(exit_status) {
                    self.printf_and_transmit(&cmd_id, "Core dumped.\n");
                }
            } else if exit_status != 0 {
                tracing::info!(%cmd_id, code = libc::WEXITSTATUS(exit_status), "exited with status");
            } else {
                tracing::info!(%cmd_id, "exited");
            }

            if let Some(mi) = self.commands.get_mut(&cmd_id) {
                mi.stdout_notifier = None;
            }
            self.pm.cleanup_stopped_command(token);

            let remove_requested = self
                .commands
                .get(&cmd_id)
                .map(|mi| mi.remove_requested)
                .unwrap_or(false);
            if remove_requested {
                tracing::info!(%cmd_id, "remove");
                self.commands.remove(&cmd_id);
                let _ = self.pm.remove_command(token);
            } else {
                self.maybe_schedule_respawn(&cmd_id);
            }

            self.transmit_process_info();
        }
    }

    fn command_id_for_token(&self, token: CommandToken) -> Option<CommandId> {
        self.commands
            .iter()
            .find(|(_, mi)| mi.token == token)
            .map(|(id, _)| id.clone())
    }

    // ------------------------------------------------------------------
    // Output capture
    // ------------------------------------------------------------------

    fn on_process_output(&mut self, cmd_id: &CommandId) {
        let Some(mi) = self.commands.get(cmd_id) else {
            return;
        };
        let fd = self
            .pm
            .command(mi.token)
            .map(|c| c.stdout_fd())
            .unwrap_or(-1);
        if fd >= 0 {
            self.read_command_output_once(cmd_id, fd);
        }
    }

    /// One non-blocking read of up to 1 KiB. Returns false when the fd
    /// has nothing more to give.
    fn read_command_output_once(&mut self, cmd_id: &CommandId, fd: RawFd) -> bool {
        let mut buf = [0u8; OUTPUT_READ_CHUNK];
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n > 0 {
            let text = String::from_utf8_lossy(&buf[..n as usize]).into_owned();
            self.transmit_str(cmd_id, &text);
            true
        } else if n == 0 {
            false
        } else {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                // EIO from a pty master just means the child side closed.
                Some(libc::EAGAIN) | Some(libc::EIO) => false,
                _ => {
                    self.printf_and_transmit(
                        cmd_id,
                        &format!("error reading console output: {err}\n"),
                    );
                    false
                }
            }
        }
    }

    /// Final drain before pty teardown so buffered output is not lost.
    fn drain_command_output(&mut self, cmd_id: &CommandId, token: CommandToken) {
        let fd = self
            .pm
            .command(token)
            .map(|c| c.stdout_fd())
            .unwrap_or(-1);
        if fd < 0 {
            return;
        }
        loop {
            let mut pfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };
            let ready = unsafe { libc::poll(&mut pfd, 1, 0) };
            if ready <= 0 || pfd.revents & libc::POLLIN == 0 {
                break;
            }
            if !self.read_command_output_once(cmd_id, fd) {
                break;
            }
        }
    }

    fn transmit_str(&mut self, cmd_id: &CommandId, text: &str) {
        self.output.append(cmd_id, text);
        self.maybe_publish_output();
    }

    fn printf_and_transmit(&mut self, cmd_id: &CommandId, text: &str) {
        if self.options.verbose {
            tracing::debug!(%cmd_id, text = text.trim_end(), "command diagnostic");
        }
        self.transmit_str(cmd_id, text);
    }

    fn maybe_publish_output(&mut self) {
        let now = timestamp_now();
        if !self.output.flush_due(now) {
            return;
        }
        let msg = OutputMsg {
            utime: now,
            deputy_id: self.deputy_id.clone(),
            streams: self.output.take(now),
        };
        if let Err(e) = self.bus.publish(OUTPUT_CHANNEL, &msg) {
            tracing::warn!(error = %e, "output publish failed");
        }
    }

    // ------------------------------------------------------------------
    // Status and sampling
    // ------------------------------------------------------------------

    fn on_status_timer(&mut self) {
        self.update_cpu_times();
        self.transmit_process_info();
    }

    /// Difference the paired /proc snapshots into system load and
    /// per-command CPU fractions.
    fn update_cpu_times(&mut self) {
        let Ok(current) = procinfo::read_system_info() else {
            return;
        };
        self.sys_info[1] = current;
        let a = &self.sys_info[1];
        let b = &self.sys_info[0];

        let loaded_jiffies = a.user.saturating_sub(b.user)
            + a.user_low.saturating_sub(b.user_low)
            + a.system.saturating_sub(b.system);
        let elapsed_jiffies = loaded_jiffies + a.idle.saturating_sub(b.idle);
        self.cpu_load = if elapsed_jiffies == 0 || loaded_jiffies > elapsed_jiffies {
            0.0
        } else {
            loaded_jiffies as f32 / elapsed_jiffies as f32
        };

        for mi in self.commands.values_mut() {
            let pid = self.pm.command(mi.token).map(|c| c.pid()).unwrap_or(0);
            if pid > 0 {
                match procinfo::read_process_info(pid as u32) {
                    Ok(info) => {
                        mi.cpu_time[1] = info;
                        let prev = &mi.cpu_time[0];
                        let used_jiffies = info.user.saturating_sub(prev.user)
                            + info.system.saturating_sub(prev.system);
                        mi.cpu_usage = if elapsed_jiffies == 0
                            || prev.user == 0
                            || used_jiffies > elapsed_jiffies
                        {
                            0.0
                        } else {
                            used_jiffies as f32 / elapsed_jiffies as f32
                        };
                    }
                    Err(e) => {
                        mi.cpu_usage = 0.0;
                        mi.cpu_time[1].vsize = 0;
                        mi.cpu_time[1].rss = 0;
                        tracing::warn!(pid, error = %e, "could not sample process info");
                    }
                }
            } else {
                mi.cpu_usage = 0.0;
                mi.cpu_time[1].vsize = 0;
                mi.cpu_time[1].rss = 0;
            }
            mi.cpu_time[0] = mi.cpu_time[1];
        }

        self.sys_info[0] = self.sys_info[1];
    }

    /// Snapshot of the deputy and all commands, as published on
    /// `PM_INFO`.
    pub fn build_info_message(&self) -> DeputyInfoMsg {
        let cmds = self
            .commands
            .iter()
            .map(|(cmd_id, mi)| {
                let record = self.pm.command(mi.token);
                CommandStatus {
                    cmd: CommandConfig {
                        exec_str: record.map(|c| c.exec_str().to_string()).unwrap_or_default(),
                        command_id: cmd_id.clone(),
                        group: mi.group.clone(),
                        auto_respawn: mi.auto_respawn,
                        stop_signal: mi.stop_signal,
                        stop_time_allowed: mi.stop_time_allowed,
                    },
                    actual_runid: mi.actual_runid,
                    pid: record.map(|c| c.pid()).unwrap_or(0),
                    exit_code: record.map(|c| c.exit_status()).unwrap_or(0),
                    cpu_usage: mi.cpu_usage,
                    mem_vsize_bytes: mi.cpu_time[1].vsize,
                    mem_rss_bytes: mi.cpu_time[1].rss,
                }
            })
            .collect();

        DeputyInfoMsg {
            utime: timestamp_now(),
            deputy_id: self.deputy_id.clone(),
            cpu_load: self.cpu_load,
            phys_mem_total_bytes: self.sys_info[1].memtotal,
            phys_mem_free_bytes: self.sys_info[1].memfree,
            swap_total_bytes: self.sys_info[1].swaptotal,
            swap_free_bytes: self.sys_info[1].swapfree,
            cmds,
        }
    }

    fn transmit_process_info(&mut self) {
        let msg = self.build_info_message();
        tracing::trace!(ncmds = msg.cmds.len(), "transmitting deputy info");
        if let Err(e) = self.bus.publish(INFO_CHANNEL, &msg) {
            tracing::warn!(error = %e, "info publish failed");
        }
    }

    fn on_introspection_timer(&mut self) {
        let info = procinfo::read_process_info(self.deputy_pid as u32).unwrap_or_default();
        let alive = self.pm.commands().filter(|c| c.pid() != 0).count();
        tracing::info!(
            rss_kb = info.rss / 1024,
            vsz_kb = info.vsize / 1024,
            procs = self.commands.len(),
            alive,
            "MARK"
        );
    }

    // ------------------------------------------------------------------
    // Discovery and shutdown
    // ------------------------------------------------------------------

    fn on_discovery_timer(&mut self) {
        if self.in_discovery_mode() {
            let msg = DiscoverMsg {
                utime: timestamp_now(),
                transmitter_id: self.deputy_id.clone(),
                nonce: self.deputy_pid,
            };
            if let Err(e) = self.bus.publish(DISCOVER_CHANNEL, &msg) {
                tracing::warn!(error = %e, "discovery publish failed");
            }
        } else {
            tracing::debug!("discovery period finished; activating deputy");
            if let Some(timer) = &self.discovery_timer {
                timer.stop();
            }
            self.bus.unsubscribe(INFO_CHANNEL);
            self.bus.subscribe(ORDERS_CHANNEL);
            if let Some(timer) = &self.status_timer {
                timer.start();
            }
            if let Some(timer) = &self.introspection_timer {
                timer.start();
            }
            self.on_status_timer();
        }
    }

    /// SIGCHLD reaps; any other signal begins shutdown: polite-stop
    /// everything and arm a SIGKILL sweep after the longest
    /// `stop_time_allowed` among live commands.
    pub fn on_posix_signal(&mut self, signum: i32) {
        if signum == libc::SIGCHLD {
            self.check_for_stopped_commands();
        } else {
            tracing::info!(signum, name = signal_name(signum), "stopping all processes");

            let mut max_stop_time_allowed = 1.0f32;
            let ids: Vec<CommandId> = self.commands.keys().cloned().collect();
            for cmd_id in &ids {
                if let Some(mi) = self.commands.get(cmd_id) {
                    max_stop_time_allowed = max_stop_time_allowed.max(mi.stop_time_allowed);
                }
            }
            for cmd_id in &ids {
                self.stop_command(cmd_id);
            }
            self.exiting = true;

            let weak = self.weak_self.clone();
            self.quit_timer = Some(self.event_loop.add_timer(
                (max_stop_time_allowed * 1000.0) as i64,
                TimerType::SingleShot,
                true,
                Box::new(move || {
                    if let Some(d) = weak.upgrade() {
                        d.borrow_mut().on_quit_timer();
                    }
                }),
            ));
        }

        if self.exiting && !self.any_running() {
            tracing::debug!("all child processes are dead, exiting");
            self.event_loop.quit();
        }
    }

    fn on_quit_timer(&mut self) {
        let ids: Vec<CommandId> = self.commands.keys().cloned().collect();
        for cmd_id in ids {
            let Some(mi) = self.commands.remove(&cmd_id) else {
                continue;
            };
            if self.pm.command(mi.token).map(|c| c.pid()).unwrap_or(0) != 0 {
                tracing::info!(%cmd_id, signum = libc::SIGKILL, "stop");
                let _ = self.pm.kill_command(mi.token, libc::SIGKILL);
            }
            let _ = self.pm.remove_command(mi.token);
        }
        tracing::info!("stopping deputy main loop");
        self.event_loop.quit();
    }
}

fn set_nonblocking(fd: RawFd) {
    if fd < 0 {
        return;
    }
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}
