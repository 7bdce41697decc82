//! Linux pidfd support: race-free process liveness watches and signal
//! delivery. No safe wrapper crate for this exists in the corpus; this
//! extends the teacher's "raw libc block" idiom to the two syscalls glibc
//! only wraps in recent versions (`pidfd_open`, `pidfd_send_signal`).

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tokio::io::unix::AsyncFd;

use crate::error::{Result, SessionError};

#[cfg(target_os = "linux")]
const SYS_PIDFD_OPEN: libc::c_long = 434;
#[cfg(target_os = "linux")]
const SYS_PIDFD_SEND_SIGNAL: libc::c_long = 424;

/// Convert a PID into a pidfd. Caller must hold the reaper mutex
/// (`lifecycle::REAPER`) across the `spawn -> pidfd_open` window so the PID
/// cannot be recycled by `waitpid` in between.
pub fn pidfd_open(pid: libc::pid_t) -> Result<OwnedFd> {
    let fd = unsafe { libc::syscall(SYS_PIDFD_OPEN, pid, 0) };
    if fd < 0 {
        return Err(SessionError::Pidfd(std::io::Error::last_os_error().to_string()));
    }
    // SAFETY: pidfd_open returns a fresh, owned file descriptor on success.
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

pub fn pidfd_send_signal(fd: RawFd, signal: libc::c_int) -> Result<()> {
    let ret = unsafe { libc::syscall(SYS_PIDFD_SEND_SIGNAL, fd, signal, std::ptr::null::<u8>(), 0) };
    if ret < 0 {
        return Err(SessionError::Pidfd(std::io::Error::last_os_error().to_string()));
    }
    Ok(())
}

/// Block (asynchronously) until `fd` becomes readable, i.e. the process it
/// refers to has exited. Returns once the pidfd reports readiness; the
/// caller treats this as a restart/teardown trigger.
pub async fn wait_exit(fd: &OwnedFd) -> Result<()> {
    let async_fd = AsyncFd::new(fd.as_raw_fd()).map_err(SessionError::Io)?;
    let mut guard = async_fd.readable().await.map_err(SessionError::Io)?;
    guard.clear_ready();
    Ok(())
}
