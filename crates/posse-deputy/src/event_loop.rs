//! Single-threaded cooperative event loop.
//!
//! Multiplexes three event sources into one dispatch queue:
//! - socket/fd readiness via `poll`
//! - timers (single-shot and repeating), deadline-ordered
//! - POSIX signals, demultiplexed through a self-pipe
//!
//! Within one iteration socket callbacks run before timer callbacks.
//! Timer callbacks fire in deadline order, ties broken by registration
//! order. Callbacks may freely create, start, stop, or drop other
//! timers and sockets; a registration dropped while queued for dispatch
//! is skipped rather than removed, keeping the iteration stable.
//!
//! The only suspension points are `poll` and the timer sleep; callbacks
//! must not block.

use posse_common::{Error, Result};
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use crate::timestamp_now;

/// Socket readiness condition a notifier waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Read,
    Write,
    Error,
}

/// Timer firing behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerType {
    SingleShot,
    Repeating,
}

type Callback = Box<dyn FnMut()>;

struct TimerState {
    interval_ms: i64,
    timer_type: TimerType,
    active: bool,
    /// Set while the timer is in the current dispatch round, between
    /// firing and rescheduling.
    fired: bool,
    dead: bool,
    deadline_us: i64,
    seq: u64,
    callback: Option<Callback>,
}

/// Owning handle for a registered timer. Dropping it destroys the
/// timer; a drop from within the timer's own callback is safe.
pub struct TimerHandle {
    state: Rc<RefCell<TimerState>>,
}

impl TimerHandle {
    /// Activate the timer with a fresh deadline. No-op if already
    /// active.
    pub fn start(&self) {
        let mut s = self.state.borrow_mut();
        if s.active {
            return;
        }
        s.deadline_us = timestamp_now() + s.interval_ms * 1000;
        s.active = true;
        s.fired = false;
    }

    /// Deactivate the timer. The callback will not fire again until
    /// [`start`](Self::start).
    pub fn stop(&self) {
        self.state.borrow_mut().active = false;
    }

    /// Change the interval. An active timer gets a fresh deadline.
    pub fn set_interval(&self, interval_ms: i64) {
        let mut s = self.state.borrow_mut();
        s.interval_ms = interval_ms;
        if s.active {
            s.deadline_us = timestamp_now() + interval_ms * 1000;
            s.fired = false;
        }
    }

    pub fn set_timer_type(&self, timer_type: TimerType) {
        self.state.borrow_mut().timer_type = timer_type;
    }

    pub fn is_active(&self) -> bool {
        self.state.borrow().active
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        let mut s = self.state.borrow_mut();
        s.dead = true;
        s.active = false;
        s.callback = None;
    }
}

struct SocketState {
    fd: RawFd,
    event_type: EventType,
    dead: bool,
    callback: Option<Callback>,
}

/// Owning handle for a socket registration. Dropping it cancels the
/// registration; if the socket is queued for callback in the current
/// iteration it is skipped.
pub struct SocketHandle {
    state: Rc<RefCell<SocketState>>,
}

impl SocketHandle {
    pub fn fd(&self) -> RawFd {
        self.state.borrow().fd
    }
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        let mut s = self.state.borrow_mut();
        s.dead = true;
        s.fd = -1;
        s.callback = None;
    }
}

struct LoopInner {
    timers: Vec<Rc<RefCell<TimerState>>>,
    sockets: Vec<Rc<RefCell<SocketState>>>,
    quit: bool,
    next_seq: u64,
    signal_notifier: Option<SocketHandle>,
}

/// The event loop. Cheap to clone; clones share the same loop state so
/// callbacks can register new timers and sockets while a dispatch is in
/// progress.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<RefCell<LoopInner>>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// Write end of the self-pipe, shared with the signal handler.
static SIGNAL_PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);
static SIGNALS_CONFIGURED: AtomicBool = AtomicBool::new(false);

/// Async-signal-safe: only a non-blocking write to the self-pipe.
extern "C" fn forward_signal(signum: libc::c_int) {
    let fd = SIGNAL_PIPE_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let bytes = signum.to_ne_bytes();
        unsafe {
            libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len());
        }
    }
}

impl EventLoop {
    pub fn new() -> Self {
        EventLoop {
            inner: Rc::new(RefCell::new(LoopInner {
                timers: Vec::new(),
                sockets: Vec::new(),
                quit: false,
                next_seq: 0,
                signal_notifier: None,
            })),
        }
    }

    /// Register `fd` for `event_type` readiness. The callback runs on
    /// each iteration where `poll` reports the condition.
    pub fn add_socket(&self, fd: RawFd, event_type: EventType, callback: Callback) -> SocketHandle {
        let state = Rc::new(RefCell::new(SocketState {
            fd,
            event_type,
            dead: false,
            callback: Some(callback),
        }));
        self.inner.borrow_mut().sockets.push(state.clone());
        SocketHandle { state }
    }

    /// Register a timer. `initially_active` arms it immediately.
    pub fn add_timer(
        &self,
        interval_ms: i64,
        timer_type: TimerType,
        initially_active: bool,
        callback: Callback,
    ) -> TimerHandle {
        let mut inner = self.inner.borrow_mut();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let state = Rc::new(RefCell::new(TimerState {
            interval_ms,
            timer_type,
            active: initially_active,
            fired: false,
            dead: false,
            deadline_us: if initially_active {
                timestamp_now() + interval_ms * 1000
            } else {
                0
            },
            seq,
            callback: Some(callback),
        }));
        inner.timers.push(state.clone());
        TimerHandle { state }
    }

    /// Install one shared handler for every listed signal. Each
    /// delivery writes the signum to an internal self-pipe; `callback`
    /// is invoked with it from the dispatch thread.
    ///
    /// Signal dispositions are process-global, so this may be called at
    /// most once per process.
    pub fn set_posix_signals(
        &self,
        signums: &[i32],
        mut callback: Box<dyn FnMut(i32)>,
    ) -> Result<()> {
        if SIGNALS_CONFIGURED.swap(true, Ordering::SeqCst) {
            return Err(Error::SignalSetup(
                "POSIX signals already configured for this process".into(),
            ));
        }

        let mut fds = [-1 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(Error::SignalSetup(format!(
                "self-pipe: {}",
                std::io::Error::last_os_error()
            )));
        }
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        SIGNAL_PIPE_WRITE_FD.store(fds[1], Ordering::SeqCst);

        for &signum in signums {
            unsafe {
                let mut sa: libc::sigaction = std::mem::zeroed();
                sa.sa_sigaction = forward_signal as usize;
                sa.sa_flags = libc::SA_RESTART;
                libc::sigemptyset(&mut sa.sa_mask);
                if libc::sigaction(signum, &sa, std::ptr::null_mut()) != 0 {
                    return Err(Error::SignalSetup(format!(
                        "sigaction({signum}): {}",
                        std::io::Error::last_os_error()
                    )));
                }
            }
        }

        let read_fd = fds[0];
        let notifier = self.add_socket(
            read_fd,
            EventType::Read,
            Box::new(move || {
                let mut buf = [0u8; 4];
                loop {
                    let n = unsafe {
                        libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                    };
                    if n == buf.len() as isize {
                        callback(i32::from_ne_bytes(buf));
                    } else {
                        break;
                    }
                }
            }),
        );
        self.inner.borrow_mut().signal_notifier = Some(notifier);
        Ok(())
    }

    /// Dispatch until [`quit`](Self::quit).
    pub fn run(&self) {
        while !self.inner.borrow().quit {
            self.iterate_once();
        }
    }

    /// Request loop exit. Takes effect between iterations and between
    /// timer callbacks during the drain, so a callback can stop the
    /// loop without further timers firing.
    pub fn quit(&self) {
        self.inner.borrow_mut().quit = true;
    }

    pub fn quitting(&self) -> bool {
        self.inner.borrow().quit
    }

    /// One poll-and-dispatch round: wait for fd readiness or the
    /// nearest timer deadline, run ready socket callbacks in
    /// registration order, then drain due timers.
    pub fn iterate_once(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.sockets.retain(|s| !s.borrow().dead);
            inner.timers.retain(|t| !t.borrow().dead);
        }

        let (sockets, next_deadline) = {
            let inner = self.inner.borrow();
            let sockets: Vec<_> = inner.sockets.clone();
            let next_deadline = inner
                .timers
                .iter()
                .filter_map(|t| {
                    let s = t.borrow();
                    (s.active && !s.dead).then_some(s.deadline_us)
                })
                .min();
            (sockets, next_deadline)
        };

        if !sockets.is_empty() {
            let timeout_ms: libc::c_int = match next_deadline {
                Some(deadline) => {
                    (((deadline - timestamp_now()) / 1000).max(0)).min(i32::MAX as i64) as libc::c_int
                }
                None => -1,
            };

            let mut pfds: Vec<libc::pollfd> = sockets
                .iter()
                .map(|s| {
                    let st = s.borrow();
                    libc::pollfd {
                        fd: st.fd,
                        events: match st.event_type {
                            EventType::Read => libc::POLLIN,
                            EventType::Write => libc::POLLOUT,
                            EventType::Error => libc::POLLERR,
                        },
                        revents: 0,
                    }
                })
                .collect();

            let num_ready =
                unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout_ms) };

            if num_ready > 0 {
                let ready: Vec<_> = pfds
                    .iter()
                    .enumerate()
                    .filter(|(_, pfd)| pfd.revents & pfd.events != 0)
                    .map(|(index, _)| sockets[index].clone())
                    .collect();

                for socket in ready {
                    if socket.borrow().dead {
                        continue;
                    }
                    let cb = socket.borrow_mut().callback.take();
                    if let Some(mut cb) = cb {
                        cb();
                        let mut st = socket.borrow_mut();
                        if !st.dead {
                            st.callback = Some(cb);
                        }
                    }
                }
            }
        } else if let Some(deadline) = next_deadline {
            let wait_us = deadline - timestamp_now();
            if wait_us > 0 {
                std::thread::sleep(Duration::from_micros(wait_us as u64));
            }
        }

        self.process_ready_timers();
    }

    fn process_ready_timers(&self) {
        let process_time = timestamp_now();
        loop {
            if self.inner.borrow().quit {
                break;
            }
            let next = {
                let inner = self.inner.borrow();
                inner
                    .timers
                    .iter()
                    .filter(|t| {
                        let s = t.borrow();
                        s.active && !s.dead && !s.fired && s.deadline_us <= process_time
                    })
                    .min_by_key(|t| {
                        let s = t.borrow();
                        (s.deadline_us, s.seq)
                    })
                    .cloned()
            };
            let Some(timer) = next else { break };

            timer.borrow_mut().fired = true;
            let cb = timer.borrow_mut().callback.take();
            if let Some(mut cb) = cb {
                cb();
                let mut s = timer.borrow_mut();
                if !s.dead {
                    s.callback = Some(cb);
                }
            }
        }

        // Reschedule everything that fired this round.
        let reschedule_base = timestamp_now();
        let timers: Vec<_> = self.inner.borrow().timers.clone();
        for timer in timers {
            let mut s = timer.borrow_mut();
            if !s.fired {
                continue;
            }
            s.fired = false;
            if s.dead {
                continue;
            }
            if s.timer_type == TimerType::SingleShot || !s.active {
                s.active = false;
            } else {
                s.deadline_us = reschedule_base + s.interval_ms * 1000;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn single_shot_fires_once_repeating_fires_until_dropped() {
        let event_loop = EventLoop::new();

        let a_count = Rc::new(Cell::new(0));
        let b_count = Rc::new(Cell::new(0));
        let c_count = Rc::new(Cell::new(0));

        let a = a_count.clone();
        let _timer_a = event_loop.add_timer(
            10,
            TimerType::SingleShot,
            true,
            Box::new(move || a.set(a.get() + 1)),
        );

        let b = b_count.clone();
        let timer_b = Rc::new(RefCell::new(None::<TimerHandle>));
        *timer_b.borrow_mut() = Some(event_loop.add_timer(
            40,
            TimerType::Repeating,
            true,
            Box::new(move || b.set(b.get() + 1)),
        ));

        let c = c_count.clone();
        let timer_b_for_c = timer_b.clone();
        let _timer_c = event_loop.add_timer(
            100,
            TimerType::SingleShot,
            true,
            Box::new(move || {
                c.set(c.get() + 1);
                // Dropping another timer's handle from a callback is allowed.
                timer_b_for_c.borrow_mut().take();
            }),
        );

        let loop_for_quit = event_loop.clone();
        let _quit_timer = event_loop.add_timer(
            150,
            TimerType::SingleShot,
            true,
            Box::new(move || loop_for_quit.quit()),
        );

        event_loop.run();

        assert_eq!(a_count.get(), 1);
        assert_eq!(b_count.get(), 2);
        assert_eq!(c_count.get(), 1);
    }

    #[test]
    fn socket_read_readiness_dispatches() {
        let event_loop = EventLoop::new();

        let mut fds = [-1 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let received = Rc::new(RefCell::new(Vec::new()));
        let received_in_cb = received.clone();
        let loop_for_cb = event_loop.clone();
        let _sock = event_loop.add_socket(
            read_fd,
            EventType::Read,
            Box::new(move || {
                let mut buf = [0u8; 80];
                let n = unsafe {
                    libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                if n > 0 {
                    received_in_cb
                        .borrow_mut()
                        .extend_from_slice(&buf[..n as usize]);
                }
                loop_for_cb.quit();
            }),
        );

        let text = b"hello";
        let n = unsafe { libc::write(write_fd, text.as_ptr() as *const libc::c_void, text.len()) };
        assert_eq!(n, text.len() as isize);

        event_loop.run();
        assert_eq!(received.borrow().as_slice(), text);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn due_timers_fire_in_deadline_order_ties_by_insertion() {
        let event_loop = EventLoop::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o1 = order.clone();
        let _t1 = event_loop.add_timer(5, TimerType::SingleShot, true, Box::new(move || {
            o1.borrow_mut().push("first");
        }));
        let o2 = order.clone();
        let _t2 = event_loop.add_timer(5, TimerType::SingleShot, true, Box::new(move || {
            o2.borrow_mut().push("second");
        }));
        let o3 = order.clone();
        let _t3 = event_loop.add_timer(1, TimerType::SingleShot, true, Box::new(move || {
            o3.borrow_mut().push("soonest");
        }));

        std::thread::sleep(Duration::from_millis(10));
        event_loop.iterate_once();

        assert_eq!(*order.borrow(), vec!["soonest", "first", "second"]);
    }

    #[test]
    fn quit_from_timer_callback_stops_drain() {
        let event_loop = EventLoop::new();
        let fired_after_quit = Rc::new(Cell::new(false));

        let loop_for_cb = event_loop.clone();
        let _quitter = event_loop.add_timer(1, TimerType::SingleShot, true, Box::new(move || {
            loop_for_cb.quit();
        }));
        let flag = fired_after_quit.clone();
        let _later = event_loop.add_timer(2, TimerType::SingleShot, true, Box::new(move || {
            flag.set(true);
        }));

        std::thread::sleep(Duration::from_millis(5));
        event_loop.iterate_once();

        assert!(event_loop.quitting());
        assert!(!fired_after_quit.get());
    }

    #[test]
    fn dropped_handle_cancels_timer() {
        let event_loop = EventLoop::new();
        let count = Rc::new(Cell::new(0));

        let c = count.clone();
        let timer = event_loop.add_timer(1, TimerType::Repeating, true, Box::new(move || {
            c.set(c.get() + 1);
        }));
        drop(timer);

        std::thread::sleep(Duration::from_millis(5));
        event_loop.iterate_once();
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn timer_can_restop_and_restart_itself() {
        // A repeating timer that stops itself fires exactly once.
        let event_loop = EventLoop::new();
        let count = Rc::new(Cell::new(0));

        let handle: Rc<RefCell<Option<TimerHandle>>> = Rc::new(RefCell::new(None));
        let c = count.clone();
        let handle_in_cb = handle.clone();
        *handle.borrow_mut() = Some(event_loop.add_timer(
            1,
            TimerType::Repeating,
            true,
            Box::new(move || {
                c.set(c.get() + 1);
                if let Some(h) = handle_in_cb.borrow().as_ref() {
                    h.stop();
                }
            }),
        ));

        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(3));
            event_loop.iterate_once();
        }
        assert_eq!(count.get(), 1);

        // Restarting arms it again.
        handle.borrow().as_ref().unwrap().start();
        std::thread::sleep(Duration::from_millis(3));
        event_loop.iterate_once();
        assert_eq!(count.get(), 2);
    }
}
