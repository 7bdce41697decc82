//! Inbound client message dispatcher: routes `INPUT`/`SIGNAL` to the control
//! socket or the PTY master depending on session mode, serializing writes
//! per destination so a blocked write can't be raced by a second one to the
//! same fd.
//!
//! Exec-scoped PTY writes are cancellable: a `RESP_PROMPT` transition bumps
//! `exec_generation`, and an in-flight PTY write checks it between chunks
//! and abandons the rest of the payload rather than writing stale input
//! into a sandbox that has already returned to its prompt.

use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::unix::AsyncFd;
use tokio::sync::Mutex as AsyncMutex;

use shellbridge_protocol::control::{input_command, signal_command};

use crate::error::{Result, SessionError};
use crate::state::SessionMode;

fn send_control_packet(fd: RawFd, data: &[u8]) -> std::io::Result<()> {
    let n = unsafe { libc::send(fd, data.as_ptr() as *const libc::c_void, data.len(), 0) };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub struct InputRouter {
    control_fd: RawFd,
    ptm_fd: RawFd,
    cmd_lock: AsyncMutex<()>,
    ptm_lock: AsyncMutex<()>,
    exec_generation: AtomicU64,
}

impl InputRouter {
    pub fn new(control_fd: RawFd, ptm_fd: RawFd) -> Self {
        Self {
            control_fd,
            ptm_fd,
            cmd_lock: AsyncMutex::new(()),
            ptm_lock: AsyncMutex::new(()),
            exec_generation: AtomicU64::new(0),
        }
    }

    /// Called on every `RESP_PROMPT`: any PTY write still draining from the
    /// prior exec abandons its remaining bytes.
    pub fn cancel_exec_writes(&self) {
        self.exec_generation.fetch_add(1, Ordering::SeqCst);
    }

    pub async fn dispatch_input(&self, mode: SessionMode, payload: &str) -> Result<()> {
        match mode {
            SessionMode::Prompt => {
                let packet = input_command(payload);
                self.write_control(&packet).await
            }
            SessionMode::ExecDirect | SessionMode::ExecTermemu => {
                // The sandbox shell expects CR, not NL, as Enter.
                let bytes = payload.replace('\n', "\r").into_bytes();
                self.write_ptm_cancellable(&bytes).await
            }
            SessionMode::Bad => Ok(()),
        }
    }

    /// `SIGNAL` is only meaningful while a command is executing, so its
    /// write is exec-scoped exactly like a PTY write: a `RESP_PROMPT` that
    /// lands first cancels it rather than sending it into a sandbox that
    /// has already returned to its prompt.
    pub async fn dispatch_signal(&self, mode: SessionMode, signum: i32) -> Result<()> {
        match mode {
            SessionMode::ExecDirect | SessionMode::ExecTermemu => {
                let packet = signal_command(signum);
                let generation = self.exec_generation.load(Ordering::SeqCst);
                self.write_control_cancellable(&packet, generation).await
            }
            _ => Ok(()),
        }
    }

    async fn write_control(&self, data: &[u8]) -> Result<()> {
        let _guard = self.cmd_lock.lock().await;
        let async_fd = AsyncFd::new(self.control_fd).map_err(SessionError::Io)?;
        loop {
            let mut writable = async_fd.writable().await.map_err(SessionError::Io)?;
            match writable.try_io(|inner| send_control_packet(inner.as_raw_fd(), data)) {
                Ok(result) => return result.map_err(SessionError::Io),
                Err(_would_block) => continue,
            }
        }
    }

    /// Like `write_control`, but abandons the write (returning `Ok(())`,
    /// not an error) if `exec_generation` has moved on from `generation`
    /// before the packet goes out — a cancellation, not a failure.
    async fn write_control_cancellable(&self, data: &[u8], generation: u64) -> Result<()> {
        let _guard = self.cmd_lock.lock().await;
        let async_fd = AsyncFd::new(self.control_fd).map_err(SessionError::Io)?;
        loop {
            if self.exec_generation.load(Ordering::SeqCst) != generation {
                return Ok(());
            }
            let mut writable = async_fd.writable().await.map_err(SessionError::Io)?;
            match writable.try_io(|inner| send_control_packet(inner.as_raw_fd(), data)) {
                Ok(result) => return result.map_err(SessionError::Io),
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_ptm_cancellable(&self, data: &[u8]) -> Result<()> {
        let _guard = self.ptm_lock.lock().await;
        let generation = self.exec_generation.load(Ordering::SeqCst);
        let async_fd = AsyncFd::new(self.ptm_fd).map_err(SessionError::Io)?;

        let mut offset = 0;
        while offset < data.len() {
            if self.exec_generation.load(Ordering::SeqCst) != generation {
                return Ok(());
            }

            let mut writable = async_fd.writable().await.map_err(SessionError::Io)?;
            let chunk = &data[offset..];
            match writable.try_io(|inner| {
                let n = unsafe {
                    libc::write(
                        inner.as_raw_fd(),
                        chunk.as_ptr() as *const libc::c_void,
                        chunk.len(),
                    )
                };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(n)) => offset += n,
                Ok(Err(e)) => return Err(SessionError::Io(e)),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;
    use std::os::unix::net::UnixDatagram;

    #[tokio::test]
    async fn dispatch_input_in_prompt_mode_writes_tagged_command() {
        let (a, b) = UnixDatagram::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let router = InputRouter::new(a.as_raw_fd(), a.as_raw_fd());
        router.dispatch_input(SessionMode::Prompt, "ls").await.unwrap();

        let mut buf = [0u8; 16];
        let n = b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"\x01ls");
    }

    #[tokio::test]
    async fn write_control_cancellable_drops_stale_generation() {
        let (a, b) = UnixDatagram::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        let router = InputRouter::new(a.as_raw_fd(), a.as_raw_fd());
        router.cancel_exec_writes(); // generation is now 1

        // A write captured at generation 0 before the cancel should be
        // dropped silently, not sent and not errored.
        router
            .write_control_cancellable(b"\x02\x00\x00\x00\x00", 0)
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        assert!(b.recv(&mut buf).is_err());
    }

    #[tokio::test]
    async fn write_control_cancellable_sends_when_generation_is_current() {
        let (a, b) = UnixDatagram::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let router = InputRouter::new(a.as_raw_fd(), a.as_raw_fd());

        router
            .write_control_cancellable(b"\x02\x01\x00\x00\x00", 0)
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let n = b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"\x02\x01\x00\x00\x00");
    }

    #[tokio::test]
    async fn dispatch_input_in_bad_mode_is_a_no_op() {
        let (read_fd, write_fd) = pipe().unwrap();
        let router = InputRouter::new(write_fd.as_raw_fd(), write_fd.as_raw_fd());
        router.dispatch_input(SessionMode::Bad, "ls").await.unwrap();
        drop(write_fd);

        let mut buf = [0u8; 16];
        let n = nix::unistd::read(read_fd.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(n, 0);
    }
}
