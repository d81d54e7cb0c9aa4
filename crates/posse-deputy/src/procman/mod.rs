//! Local child-process manager.
//!
//! Owns every command record: fork-pty spawn, signal delivery to the
//! command and its descendants, non-blocking reap with orphan cleanup,
//! and pty teardown. Strictly local, synchronous, and non-blocking
//! (except [`Procman::remove_command`], which waits for an
//! already-dying child to finish exiting).
//!
//! Callers hold opaque [`CommandToken`]s; the manager is the single
//! owner of the records themselves.

pub mod exec_string;

use posse_common::{CommandId, Error, Result};
use std::collections::{HashMap, VecDeque};
use std::ffi::CString;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::time::Duration;

use crate::procinfo;

/// Stable opaque handle for one command record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandToken(u64);

/// Coarse run state derived from the PID invariant: running iff
/// `pid > 0`, stopped iff `pid == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Running,
}

/// One managed command.
#[derive(Debug)]
pub struct ProcmanCommand {
    token: CommandToken,
    command_id: CommandId,
    exec_str: String,
    /// PID of the child while running, 0 otherwise.
    pid: i32,
    /// Master side of the pty; writing reaches the child's stdin.
    stdin_fd: RawFd,
    /// Same fd as `stdin_fd` while running; reading yields the child's
    /// stdout/stderr.
    stdout_fd: RawFd,
    /// Raw wait status from the last exit.
    exit_status: i32,
    /// Descendants already signalled; re-signalled with SIGKILL at reap
    /// time if they were orphaned by the exit.
    descendants_to_kill: Vec<u32>,
}

impl ProcmanCommand {
    pub fn token(&self) -> CommandToken {
        self.token
    }

    pub fn command_id(&self) -> &CommandId {
        &self.command_id
    }

    pub fn exec_str(&self) -> &str {
        &self.exec_str
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn stdout_fd(&self) -> RawFd {
        self.stdout_fd
    }

    pub fn stdin_fd(&self) -> RawFd {
        self.stdin_fd
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_status
    }

    fn close_pty(&mut self) {
        if self.stdout_fd >= 0 {
            unsafe {
                libc::close(self.stdout_fd);
            }
        }
        self.stdout_fd = -1;
        self.stdin_fd = -1;
    }
}

impl Drop for ProcmanCommand {
    fn drop(&mut self) {
        self.close_pty();
    }
}

/// The process manager.
pub struct Procman {
    commands: Vec<ProcmanCommand>,
    /// Reaped commands awaiting cleanup, in reap order.
    dead_children: VecDeque<CommandToken>,
    /// Variable table consulted first during exec-string expansion.
    variables: HashMap<String, String>,
    next_token: u64,
}

impl Default for Procman {
    fn default() -> Self {
        Self::new()
    }
}

impl Procman {
    pub fn new() -> Self {
        Procman {
            commands: Vec::new(),
            dead_children: VecDeque::new(),
            variables: HashMap::new(),
            next_token: 1,
        }
    }

    /// Create a command record. The command is not started.
    pub fn add_command(&mut self, exec_str: &str) -> CommandToken {
        let token = CommandToken(self.next_token);
        self.next_token += 1;
        tracing::debug!(exec = exec_str, "new command");
        self.commands.push(ProcmanCommand {
            token,
            command_id: CommandId::from(""),
            exec_str: exec_str.to_string(),
            pid: 0,
            stdin_fd: -1,
            stdout_fd: -1,
            exit_status: 0,
            descendants_to_kill: Vec::new(),
        });
        token
    }

    pub fn commands(&self) -> impl Iterator<Item = &ProcmanCommand> {
        self.commands.iter()
    }

    pub fn tokens(&self) -> Vec<CommandToken> {
        self.commands.iter().map(|c| c.token).collect()
    }

    pub fn command(&self, token: CommandToken) -> Option<&ProcmanCommand> {
        self.commands.iter().find(|c| c.token == token)
    }

    fn command_mut(&mut self, token: CommandToken) -> Result<&mut ProcmanCommand> {
        self.commands
            .iter_mut()
            .find(|c| c.token == token)
            .ok_or(Error::InvalidCommand)
    }

    pub fn run_state(&self, token: CommandToken) -> Option<RunState> {
        self.command(token).map(|c| {
            if c.pid > 0 {
                RunState::Running
            } else {
                RunState::Stopped
            }
        })
    }

    /// Change the exec string. Takes effect on next start; a running
    /// child is untouched.
    pub fn set_command_exec_str(&mut self, token: CommandToken, exec_str: &str) -> Result<()> {
        self.command_mut(token)?.exec_str = exec_str.to_string();
        Ok(())
    }

    pub fn set_command_id(&mut self, token: CommandToken, id: CommandId) -> Result<()> {
        self.command_mut(token)?.command_id = id;
        Ok(())
    }

    /// Define a variable for `$NAME` expansion in exec strings.
    pub fn set_variable(&mut self, name: &str, value: &str) {
        self.variables
            .insert(name.to_string(), value.to_string());
    }

    /// Start a command under a fresh pseudo-terminal.
    ///
    /// Parses and expands the exec string, forks with the slave pty as
    /// the child's controlling terminal and stdio, and execs. On
    /// success the master fd is recorded as both `stdin_fd` and
    /// `stdout_fd`. Exec failure inside the child surfaces as a
    /// diagnostic on the pty followed by a fast exit, handled by the
    /// normal reap path.
    pub fn start_command(&mut self, token: CommandToken) -> Result<()> {
        let variables = self.variables.clone();
        let cmd = self.command_mut(token)?;
        if cmd.pid != 0 {
            return Err(Error::AlreadyRunning { pid: cmd.pid });
        }
        tracing::debug!(exec = cmd.exec_str.as_str(), "starting");

        let (environment, argv) = prepare_args_and_environment(&cmd.exec_str, &variables)?;

        // Clear any stale pty from a previous run.
        cmd.close_pty();
        cmd.exit_status = 0;

        // Back up stderr so the child can report an exec failure to the
        // real console. If exec succeeds the duplicate simply closes
        // when the child exits.
        let stderr_backup = unsafe { libc::dup(libc::STDERR_FILENO) };

        let pty = match nix::pty::openpty(None, None) {
            Ok(pty) => pty,
            Err(errno) => {
                unsafe {
                    libc::close(stderr_backup);
                }
                return Err(Error::Spawn {
                    errno: errno as i32,
                    message: format!("openpty: {errno}"),
                });
            }
        };

        match unsafe { nix::unistd::fork() } {
            Ok(nix::unistd::ForkResult::Child) => {
                drop(pty.master);
                let _ = nix::unistd::setsid();
                unsafe {
                    libc::ioctl(pty.slave.as_raw_fd(), libc::TIOCSCTTY as _, 0);
                }
                let slave_fd = pty.slave.as_raw_fd();
                unsafe {
                    libc::dup2(slave_fd, libc::STDIN_FILENO);
                    libc::dup2(slave_fd, libc::STDOUT_FILENO);
                    libc::dup2(slave_fd, libc::STDERR_FILENO);
                }
                drop(pty.slave);

                for (key, value) in &environment {
                    std::env::set_var(key, value);
                }

                let err = match nix::unistd::execvp(&argv[0], &argv) {
                    Err(errno) => errno,
                    Ok(infallible) => match infallible {},
                };

                // Report on the pty (reaches the sheriff as captured
                // output), then on the saved real stderr.
                let msg = format!(
                    "ERROR executing [{}]\n       execvp: {err}\n",
                    cmd.exec_str
                );
                unsafe {
                    libc::write(
                        libc::STDERR_FILENO,
                        msg.as_ptr() as *const libc::c_void,
                        msg.len(),
                    );
                    libc::dup2(stderr_backup, libc::STDERR_FILENO);
                    libc::write(
                        libc::STDERR_FILENO,
                        msg.as_ptr() as *const libc::c_void,
                        msg.len(),
                    );
                    libc::close(stderr_backup);
                    libc::_exit(-1)
                }
            }
            Ok(nix::unistd::ForkResult::Parent { child }) => {
                drop(pty.slave);
                let master_fd = pty.master.into_raw_fd();
                cmd.pid = child.as_raw();
                cmd.stdin_fd = master_fd;
                cmd.stdout_fd = master_fd;
                unsafe {
                    libc::close(stderr_backup);
                }
                Ok(())
            }
            Err(errno) => {
                unsafe {
                    libc::close(stderr_backup);
                }
                Err(Error::Spawn {
                    errno: errno as i32,
                    message: format!("fork: {errno}"),
                })
            }
        }
    }

    /// Send `signum` to the command and the same signal to each of its
    /// current descendants, remembering the descendants for orphan
    /// cleanup at reap time.
    ///
    /// Success is judged by the signal to the command's own PID;
    /// descendant delivery is best-effort.
    pub fn kill_command(&mut self, token: CommandToken, signum: i32) -> Result<()> {
        let cmd = self.command_mut(token)?;
        if cmd.pid == 0 {
            return Err(Error::NotRunning);
        }
        let pid = cmd.pid;
        let descendants = procinfo::descendants(pid as u32);

        tracing::debug!(pid, signum, "kill");
        send_signal(pid, signum).map_err(|e| Error::Kill {
            pid,
            signum,
            message: e.to_string(),
        })?;

        let cmd = self.command_mut(token)?;
        for desc in descendants {
            tracing::debug!(descendant = desc, signum, "signal descendant");
            let _ = send_signal(desc as i32, signum);
            if !cmd.descendants_to_kill.contains(&desc) {
                cmd.descendants_to_kill.push(desc);
            }
        }
        Ok(())
    }

    /// Reap every waitable child without blocking.
    ///
    /// Each reaped command gets `pid = 0` and its raw wait status
    /// recorded; descendants it had been signalled are SIGKILLed if the
    /// exit orphaned them. Returns the oldest reaped-but-uncleaned
    /// command, or `None`. Callers drain by alternating with
    /// [`cleanup_stopped_command`](Self::cleanup_stopped_command).
    pub fn check_for_stopped_commands(&mut self) -> Option<CommandToken> {
        loop {
            let mut status: libc::c_int = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }

            let Some(cmd) = self.commands.iter_mut().find(|c| c.pid == pid) else {
                tracing::warn!(pid, "reaped a child that no command owns");
                continue;
            };
            cmd.pid = 0;
            cmd.exit_status = status;

            if libc::WIFSIGNALED(status) {
                tracing::debug!(
                    exec = cmd.exec_str.as_str(),
                    signum = libc::WTERMSIG(status),
                    "terminated by signal"
                );
            } else if status != 0 {
                tracing::debug!(
                    exec = cmd.exec_str.as_str(),
                    code = libc::WEXITSTATUS(status),
                    "exited with nonzero status"
                );
            } else {
                tracing::debug!(exec = cmd.exec_str.as_str(), "exited");
            }

            for &desc in &cmd.descendants_to_kill {
                if procinfo::is_orphaned_child_of(desc, pid as u32) {
                    tracing::debug!(orphan = desc, "SIGKILL orphaned descendant");
                    let _ = send_signal(desc as i32, libc::SIGKILL);
                }
            }
            cmd.descendants_to_kill.clear();

            self.dead_children.push_back(cmd.token);
        }

        self.dead_children.front().copied()
    }

    /// Close the pty of a reaped command and clear both fds. Harmless
    /// if already cleaned; must not be called while the child runs.
    pub fn cleanup_stopped_command(&mut self, token: CommandToken) {
        let Some(pos) = self.dead_children.iter().position(|t| *t == token) else {
            return;
        };
        self.dead_children.remove(pos);

        if let Some(cmd) = self.commands.iter_mut().find(|c| c.token == token) {
            debug_assert_eq!(cmd.pid, 0, "cleanup of a running command");
            cmd.close_pty();
        }
    }

    /// Remove a command record. If the child is still running this
    /// waits for it to exit (without signalling it).
    pub fn remove_command(&mut self, token: CommandToken) -> Result<()> {
        if self.command(token).is_none() {
            return Err(Error::InvalidCommand);
        }

        while self.command(token).map(|c| c.pid).unwrap_or(0) != 0 {
            std::thread::sleep(Duration::from_millis(1));
            self.check_for_stopped_commands();
        }

        self.cleanup_stopped_command(token);
        self.commands.retain(|c| c.token != token);
        Ok(())
    }
}

fn send_signal(pid: i32, signum: i32) -> std::io::Result<()> {
    if unsafe { libc::kill(pid, signum) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Parse an exec string into child environment assignments and an
/// expanded, exec-ready argv.
fn prepare_args_and_environment(
    exec_str: &str,
    variables: &HashMap<String, String>,
) -> Result<(Vec<(String, String)>, Vec<CString>)> {
    let tokens = exec_string::separate_args(exec_str);
    let (environment, argv_tokens) = exec_string::separate_env_prefix(tokens);

    if argv_tokens.is_empty() {
        return Err(Error::EmptyExecString {
            exec_str: exec_str.to_string(),
        });
    }

    let mut argv = Vec::with_capacity(argv_tokens.len());
    for token in &argv_tokens {
        let expanded = exec_string::expand_variables(token, variables);
        argv.push(CString::new(expanded).map_err(|_| Error::Spawn {
            errno: libc::EINVAL,
            message: "argument contains a NUL byte".to_string(),
        })?);
    }
    Ok((environment, argv))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_assigns_distinct_tokens() {
        let mut pm = Procman::new();
        let a = pm.add_command("/bin/true");
        let b = pm.add_command("/bin/false");
        assert_ne!(a, b);
        assert_eq!(pm.run_state(a), Some(RunState::Stopped));
        assert_eq!(pm.command(a).unwrap().pid(), 0);
        assert_eq!(pm.command(b).unwrap().stdout_fd(), -1);
    }

    #[test]
    fn mutators_reject_unknown_tokens() {
        let mut pm = Procman::new();
        let token = pm.add_command("/bin/true");
        pm.remove_command(token).unwrap();
        assert!(matches!(
            pm.set_command_exec_str(token, "x"),
            Err(Error::InvalidCommand)
        ));
        assert!(matches!(pm.remove_command(token), Err(Error::InvalidCommand)));
    }

    #[test]
    fn kill_requires_a_running_child() {
        let mut pm = Procman::new();
        let token = pm.add_command("/bin/true");
        assert!(matches!(
            pm.kill_command(token, libc::SIGTERM),
            Err(Error::NotRunning)
        ));
    }

    #[test]
    fn prepare_expands_argv_but_not_environment() {
        let mut vars = HashMap::new();
        vars.insert("TARGET".to_string(), "/tmp".to_string());
        let (env, argv) =
            prepare_args_and_environment("MODE=$TARGET ls $TARGET", &vars).unwrap();
        assert_eq!(env, vec![("MODE".to_string(), "$TARGET".to_string())]);
        let argv: Vec<&str> = argv.iter().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(argv, vec!["ls", "/tmp"]);
    }

    #[test]
    fn prepare_rejects_empty_argv() {
        let vars = HashMap::new();
        assert!(matches!(
            prepare_args_and_environment("A=1 B=2", &vars),
            Err(Error::EmptyExecString { .. })
        ));
        assert!(matches!(
            prepare_args_and_environment("   ", &vars),
            Err(Error::EmptyExecString { .. })
        ));
    }
}
