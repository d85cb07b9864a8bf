//! Process validation utilities for PID checking.

/// Kill a process with SIGKILL.
///
/// Returns `true` if the process was killed or already gone, `false` if the
/// kill syscall failed for a reason other than the process not existing
/// (most commonly a permission error).
pub fn kill_process(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, libc::SIGKILL) == 0 || !is_process_alive(pid) }
}

/// Send SIGTERM, giving a process a chance to shut down gracefully.
pub fn terminate_process(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, libc::SIGTERM) == 0 || !is_process_alive(pid) }
}

/// Check whether a process with the given PID exists, via `kill(pid, 0)`.
pub fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Verify that a PID still belongs to the sandbox's VM backend process
/// rather than a recycled PID now owned by an unrelated process.
///
/// On Linux this reads `/proc/{pid}/cmdline` and checks that it mentions the
/// sandbox id; anywhere else it falls back to a liveness-only check.
pub fn is_same_process(pid: u32, sandbox_id: &str) -> bool {
    #[cfg(target_os = "linux")]
    {
        is_same_process_linux(pid, sandbox_id)
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = sandbox_id;
        is_process_alive(pid)
    }
}

#[cfg(target_os = "linux")]
fn is_same_process_linux(pid: u32, sandbox_id: &str) -> bool {
    use std::fs;

    let cmdline_path = format!("/proc/{}/cmdline", pid);
    match fs::read_to_string(&cmdline_path) {
        Ok(cmdline) => cmdline.contains(sandbox_id),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn high_unlikely_pids_are_not_alive() {
        assert!(!is_process_alive(999_999_999));
        assert!(!is_process_alive(888_888_888));
    }

    #[test]
    fn same_process_rejects_invalid_pid() {
        assert!(!is_same_process(0, "vm-0011223344556677"));
    }
}
