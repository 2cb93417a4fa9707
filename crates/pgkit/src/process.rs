//! Process liveness and signalling.

use crate::error::Result;

/// Pids that address a single process; 0 and negative values would
/// address process groups.
fn single(pid: u32) -> Option<libc::pid_t> {
    libc::pid_t::try_from(pid).ok().filter(|p| *p > 0)
}

/// Whether a process with `pid` exists.
pub fn is_alive(pid: u32) -> bool {
    let Some(pid) = single(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs error checking only; nothing is delivered.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Send SIGTERM to `pid`. A process that is already gone is not an error.
pub fn terminate(pid: u32) -> Result<()> {
    let Some(raw) = single(pid) else {
        return Ok(());
    };
    // SAFETY: plain kill(2) on a pid we were given; no memory is involved.
    let rc = unsafe { libc::kill(raw, libc::SIGTERM) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err.into());
        }
        log::debug!("process {pid} already exited");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn test_out_of_range_pid() {
        assert!(!is_alive(u32::MAX));
        assert!(terminate(u32::MAX).is_ok());
        assert!(!is_alive(0));
        assert!(terminate(0).is_ok());
    }
}
