//! Process liveness helpers.

use std::thread;
use std::time::{Duration, Instant};

/// Check if a process with the given PID is running.
///
/// Uses signal 0; `EPERM` means the process exists under another user.
#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_process_running(_pid: u32) -> bool {
    // On non-Unix systems, assume process is running if we can't check
    true
}

/// Poll until `pid` is gone or `timeout` elapses. Returns whether it exited.
pub fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !is_process_running(pid) {
            return true;
        }
        thread::sleep(Duration::from_millis(100));
    }
    !is_process_running(pid)
}
