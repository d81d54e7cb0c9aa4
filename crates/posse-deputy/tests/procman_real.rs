//! Real-child integration tests for the process manager: spawn under a
//! pty, capture output, deliver signals, reap, and clean up.

#![cfg(unix)]

use posse_deputy::procman::{CommandToken, Procman, RunState};
use std::sync::Mutex;
use std::time::{Duration, Instant};

// The reap path uses waitpid(-1), which is process-wide; tests that
// spawn children must not overlap.
static CHILD_TEST_LOCK: Mutex<()> = Mutex::new(());

fn lock() -> std::sync::MutexGuard<'static, ()> {
    CHILD_TEST_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Poll the reap queue until a command dies or the timeout passes.
fn reap_next(pm: &mut Procman, timeout: Duration) -> Option<CommandToken> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(token) = pm.check_for_stopped_commands() {
            return Some(token);
        }
        if Instant::now() > deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Read whatever the pty has buffered, waiting up to `timeout`.
fn read_pty(fd: i32, timeout: Duration) -> String {
    let mut collected = Vec::new();
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut pfd, 1, 50) };
        if ready > 0 && pfd.revents & libc::POLLIN != 0 {
            let mut buf = [0u8; 1024];
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n > 0 {
                collected.extend_from_slice(&buf[..n as usize]);
                continue;
            }
            break;
        }
        if !collected.is_empty() {
            break;
        }
    }
    String::from_utf8_lossy(&collected).into_owned()
}

#[test]
fn spawn_captures_console_output() {
    let _guard = lock();
    let mut pm = Procman::new();
    let token = pm.add_command("echo hello from the pty");
    pm.start_command(token).expect("start");

    let cmd = pm.command(token).unwrap();
    assert!(cmd.pid() > 0);
    assert_eq!(cmd.stdout_fd(), cmd.stdin_fd());
    assert!(cmd.stdout_fd() >= 0);

    let text = read_pty(cmd.stdout_fd(), Duration::from_secs(5));
    assert!(
        text.contains("hello from the pty"),
        "pty output was {text:?}"
    );

    let reaped = reap_next(&mut pm, Duration::from_secs(5)).expect("reaped");
    assert_eq!(reaped, token);
    assert_eq!(pm.command(token).unwrap().pid(), 0);
    assert_eq!(pm.command(token).unwrap().exit_status(), 0);

    pm.cleanup_stopped_command(token);
    assert_eq!(pm.command(token).unwrap().stdout_fd(), -1);
    assert_eq!(pm.command(token).unwrap().stdin_fd(), -1);

    pm.remove_command(token).expect("remove");
    assert!(pm.command(token).is_none());
}

#[test]
fn variable_expansion_applies_on_start() {
    let _guard = lock();
    let mut pm = Procman::new();
    pm.set_variable("POSSE_PM_TEST_WORD", "expanded-ok");
    let token = pm.add_command(r"echo $POSSE_PM_TEST_WORD \$POSSE_PM_TEST_WORD");
    pm.start_command(token).expect("start");

    let text = read_pty(pm.command(token).unwrap().stdout_fd(), Duration::from_secs(5));
    assert!(text.contains("expanded-ok"), "pty output was {text:?}");
    assert!(text.contains("$POSSE_PM_TEST_WORD"), "pty output was {text:?}");

    reap_next(&mut pm, Duration::from_secs(5)).expect("reaped");
    pm.cleanup_stopped_command(token);
    pm.remove_command(token).expect("remove");
}

#[test]
fn kill_terminates_a_sleeping_child() {
    let _guard = lock();
    let mut pm = Procman::new();
    let token = pm.add_command("sleep 30");
    pm.start_command(token).expect("start");
    assert_eq!(pm.run_state(token), Some(RunState::Running));

    // Signals need a moment to land after exec.
    std::thread::sleep(Duration::from_millis(100));
    pm.kill_command(token, libc::SIGTERM).expect("kill");

    reap_next(&mut pm, Duration::from_secs(5)).expect("reaped");
    let status = pm.command(token).unwrap().exit_status();
    assert!(libc::WIFSIGNALED(status));
    assert_eq!(libc::WTERMSIG(status), libc::SIGTERM);

    pm.cleanup_stopped_command(token);
    pm.remove_command(token).expect("remove");
}

#[test]
fn exec_failure_exits_fast_with_diagnostic() {
    let _guard = lock();
    let mut pm = Procman::new();
    let token = pm.add_command("/no/such/binary-posse-test --flag");
    pm.start_command(token).expect("forkpty itself succeeds");

    let text = read_pty(pm.command(token).unwrap().stdout_fd(), Duration::from_secs(5));
    assert!(text.contains("ERROR executing"), "pty output was {text:?}");
    assert!(text.contains("execvp"), "pty output was {text:?}");

    let reaped = reap_next(&mut pm, Duration::from_secs(5)).expect("reaped");
    assert_eq!(reaped, token);
    let status = pm.command(token).unwrap().exit_status();
    assert!(!libc::WIFSIGNALED(status));
    assert_eq!(libc::WEXITSTATUS(status), 255);

    pm.cleanup_stopped_command(token);
    pm.remove_command(token).expect("remove");
}

#[test]
fn command_can_be_restarted_after_cleanup() {
    let _guard = lock();
    let mut pm = Procman::new();
    let token = pm.add_command("true");

    for _ in 0..2 {
        pm.start_command(token).expect("start");
        let first_pid = pm.command(token).unwrap().pid();
        assert!(first_pid > 0);
        reap_next(&mut pm, Duration::from_secs(5)).expect("reaped");
        pm.cleanup_stopped_command(token);
        assert_eq!(pm.command(token).unwrap().pid(), 0);
        assert_eq!(pm.command(token).unwrap().stdout_fd(), -1);
    }

    pm.remove_command(token).expect("remove");
}

#[test]
fn start_while_running_is_rejected() {
    let _guard = lock();
    let mut pm = Procman::new();
    let token = pm.add_command("sleep 30");
    pm.start_command(token).expect("start");
    assert!(pm.start_command(token).is_err());

    pm.kill_command(token, libc::SIGKILL).expect("kill");
    reap_next(&mut pm, Duration::from_secs(5)).expect("reaped");
    pm.cleanup_stopped_command(token);
    pm.remove_command(token).expect("remove");
}

#[cfg(target_os = "linux")]
#[test]
fn orphaned_descendant_is_sigkilled_at_reap() {
    use posse_deputy::procinfo;

    let _guard = lock();
    let mut pm = Procman::new();
    // The grandchild ignores SIGHUP (nohup), so the polite signal kills
    // only the shell and leaves an orphan for the reap path.
    let token = pm.add_command("bash -c 'nohup sleep 60 >/dev/null 2>&1 & wait'");
    pm.start_command(token).expect("start");
    let shell_pid = pm.command(token).unwrap().pid() as u32;

    // Give the shell time to fork the grandchild.
    let mut grandchildren = Vec::new();
    for _ in 0..50 {
        grandchildren = procinfo::descendants(shell_pid);
        if !grandchildren.is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(!grandchildren.is_empty(), "shell never forked a child");

    pm.kill_command(token, libc::SIGHUP).expect("kill");
    reap_next(&mut pm, Duration::from_secs(5)).expect("shell reaped");

    // The orphan was SIGKILLed during reap processing.
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        // Gone, or left as a zombie awaiting init, both count as dead.
        let alive: Vec<u32> = grandchildren
            .iter()
            .copied()
            .filter(|&pid| match procinfo::read_pid_info(pid) {
                Ok(info) => info.state != 'Z',
                Err(_) => false,
            })
            .collect();
        if alive.is_empty() {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "orphaned descendants still alive: {alive:?}"
        );
        std::thread::sleep(Duration::from_millis(50));
    }

    pm.cleanup_stopped_command(token);
    pm.remove_command(token).expect("remove");
}
