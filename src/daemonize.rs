//! Daemonization (§A.4): single `fork()`, stdio redirected to `/dev/null`,
//! optional log file. Grounded on `bmd.c`'s `main()` daemonize branch —
//! out of the dispatch core's scope per spec.md §1, kept as a small module
//! so the binary is a complete daemon.

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;

use crate::error::{Error, Result};

/// Fork once; the parent exits immediately, the child redirects stdin,
/// stdout, and stderr to `/dev/null` (or to the per-pid log file for
/// stdout/stderr, if `use_log_file` is set) and continues running.
///
/// The log file path is derived from the pid *after* the fork — grounded
/// on `bmd.c`'s `main()`, which calls `getpid()` only once it is running
/// in the child (`bmd.c:310,333,357`), since the parent's pid is not the
/// pid that ends up owning the log file or the UDS path.
pub fn daemonize(use_log_file: bool) -> Result<()> {
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    if pid > 0 {
        std::process::exit(0);
    }

    unsafe {
        if libc::setsid() < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
    }

    let devnull = OpenOptions::new().read(true).write(true).open("/dev/null").map_err(Error::Io)?;
    redirect_fd(devnull.as_raw_fd(), libc::STDIN_FILENO)?;

    if use_log_file {
        let log_path = default_log_path(std::process::id());
        let log = OpenOptions::new().create(true).append(true).open(&log_path).map_err(Error::Io)?;
        redirect_fd(log.as_raw_fd(), libc::STDOUT_FILENO)?;
        redirect_fd(log.as_raw_fd(), libc::STDERR_FILENO)?;
    } else {
        redirect_fd(devnull.as_raw_fd(), libc::STDOUT_FILENO)?;
        redirect_fd(devnull.as_raw_fd(), libc::STDERR_FILENO)?;
    }
    Ok(())
}

fn redirect_fd(src: std::os::fd::RawFd, dst: std::os::fd::RawFd) -> Result<()> {
    let ret = unsafe { libc::dup2(src, dst) };
    if ret < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// The default log file path for a daemonized process: `/tmp/bmd_<pid>.log`.
pub fn default_log_path(pid: u32) -> std::path::PathBuf {
    std::path::PathBuf::from(format!("/tmp/bmd_{pid}.log"))
}
