//! The session event loop: fans in PTY master reads, control socket
//! packets, the flush timer, client input, and pidfd liveness watches, and
//! drives `state::Engine` + `input::InputRouter` from them.
//!
//! The original's `asyncio.wait(..., FIRST_COMPLETED)` loop resolves ties
//! between simultaneously-ready PTY and control events with an explicit
//! priority rule (`on_cmd_ptm`'s race tiebreaker). `tokio::select!` doesn't
//! expose that ordering directly, so each iteration opportunistically
//! checks whether the *other* source also has data ready immediately after
//! the first one resolves, and applies the same priority rule before
//! acting — same ordering guarantee, different plumbing.

use std::os::fd::{AsFd, AsRawFd, FromRawFd, RawFd};
use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::time::Instant as TokioInstant;

use shellbridge_core::config::{BridgeConfig, DEFAULT_FLUSH_DEADLINE_MS};
use shellbridge_protocol::control::{decode_response, ControlResponse};
use shellbridge_protocol::wire::{is_valid_idname, ClientMessage};

use crate::error::{Result, SessionError};
use crate::input::InputRouter;
use crate::lifecycle::{self, Launcher, SandboxRoot};
use crate::outbound::Outbound;
use crate::pidfd;
use crate::state::{Engine, FlushType, SessionMode};
use crate::upload;

/// A fully stood-up sandbox: PTY master, control socket, tracked pidfds,
/// and the output engine, ready to run the fan-in loop.
pub struct Session {
    engine: Engine,
    router: InputRouter,
    ptm_fd: RawFd,
    control_fd: RawFd,
    launcher_pidfd: std::os::fd::OwnedFd,
    shell_pidfd: Option<std::os::fd::OwnedFd>,
    net_helper_pidfd: Option<std::os::fd::OwnedFd>,
    flush_deadline: Duration,
    upload_guard: Option<upload::Registration>,
}

impl Session {
    /// Stand up one sandbox for `idname`: mount/reuse its overlay root, seal
    /// the shell binary into a memfd, fork the launcher, receive the shell
    /// pidfd and netns fd over the control socket, and spawn the network
    /// helper. Mirrors `Comm._run`'s setup section up to `on_cmd_ptm`.
    pub async fn start(cfg: &BridgeConfig, idname: &str, reinit: bool, upload_uuid: &str) -> Result<Self> {
        if !is_valid_idname(idname) {
            return Err(SessionError::Handshake(format!("invalid idname: {idname}")));
        }

        let root: SandboxRoot = lifecycle::ensure_root(&cfg.sandbox, idname, reinit)?;
        let exe_fd = lifecycle::seal_shell_binary(&cfg.sandbox.shell_binary)?;

        let Launcher { ptm, control, pidfd: launcher_pidfd } =
            lifecycle::spawn_launcher(&cfg.sandbox, &root, &exe_fd, upload_uuid).await?;
        drop(exe_fd);

        let init_timeout = Duration::from_millis(cfg.timing.init_timeout_ms);
        let (shell_pidfd, net_ns_fd) = tokio::time::timeout(init_timeout, Self::recv_init_fds(&control))
            .await
            .map_err(|_| SessionError::Handshake("timed out waiting for shell fds".into()))??;

        let net_helper_pidfd = lifecycle::spawn_network_helper(&cfg.sandbox, net_ns_fd.as_fd())
            .await
            .ok();

        let (upload_guard, _upload_rx) = upload::register(upload_uuid.to_string());

        use std::os::fd::IntoRawFd;
        let ptm_fd = ptm.into_raw_fd();
        let control_fd = control.into_raw_fd();

        Ok(Self {
            engine: Engine::new(),
            router: InputRouter::new(control_fd, ptm_fd),
            ptm_fd,
            control_fd,
            launcher_pidfd,
            shell_pidfd: Some(shell_pidfd),
            net_helper_pidfd,
            flush_deadline: Duration::from_millis(DEFAULT_FLUSH_DEADLINE_MS),
            upload_guard: Some(upload_guard),
        })
    }

    async fn recv_init_fds(
        control: &std::os::unix::net::UnixDatagram,
    ) -> Result<(std::os::fd::OwnedFd, std::os::fd::OwnedFd)> {
        let shell = Self::recv_one_fd(control).await?;
        let netns = Self::recv_one_fd(control).await?;
        Ok((shell, netns))
    }

    async fn recv_one_fd(control: &std::os::unix::net::UnixDatagram) -> Result<std::os::fd::OwnedFd> {
        let async_fd = AsyncFd::new(control.as_raw_fd()).map_err(SessionError::Io)?;
        loop {
            let mut guard = async_fd.readable().await.map_err(SessionError::Io)?;
            match guard.try_io(|_| crate::fdpass::recv_with_fds(control, 1)) {
                Ok(Ok((_, mut fds))) => {
                    return fds
                        .pop()
                        .ok_or_else(|| SessionError::Handshake("control packet carried no fd".into()))
                }
                Ok(Err(e)) => return Err(SessionError::Io(e)),
                Err(_would_block) => continue,
            }
        }
    }

    /// Run the fan-in loop against `client_lines`/`outbound` until the
    /// client disconnects, the sandbox dies (→ `SessionError::Restart`), or
    /// a hard error occurs. `client_lines` is owned by the caller so it
    /// survives a restart and is handed to the next `Session::run` call
    /// unconsumed past whatever line triggered the restart.
    pub async fn run<R, W>(
        &mut self,
        client_lines: &mut tokio::io::Lines<BufReader<R>>,
        outbound: &Outbound<W>,
    ) -> Result<()>
    where
        R: tokio::io::AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let ptm_async = AsyncFd::new(self.ptm_fd).map_err(SessionError::Io)?;
        let control_async = AsyncFd::new(self.control_fd).map_err(SessionError::Io)?;

        loop {
            let deadline = self.engine.flush_deadline(self.flush_deadline);
            let timer = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(TokioInstant::from_std(at)).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;

                _ = timer, if deadline.is_some() => {
                    self.flush(FlushType::HitTimer, outbound).await?;
                }

                r = pidfd::wait_exit(self.shell_pidfd.as_ref().unwrap()) => {
                    r.ok();
                    return Err(SessionError::Restart);
                }

                r = pidfd::wait_exit(&self.launcher_pidfd) => {
                    r.ok();
                    return Err(SessionError::Restart);
                }

                ctrl_ready = control_async.readable() => {
                    let mut guard = ctrl_ready.map_err(SessionError::Io)?;
                    let raw = match guard.try_io(|_| read_control_packet_raw(self.control_fd)) {
                        Ok(r) => r?,
                        Err(_would_block) => continue,
                    };
                    drop(guard);

                    // Opportunistic tiebreak: the PTY may also be ready right now.
                    if let Some(ptm_data) = try_read_ptm(self.ptm_fd) {
                        self.handle_raced_pair(raw, ptm_data, outbound).await?;
                    } else {
                        if raw.is_empty() {
                            return Err(SessionError::Restart);
                        }
                        let resp = decode_response(&raw)
                            .map_err(|e| SessionError::ProtocolViolation(e.to_string()))?;
                        self.apply_control_response(resp, outbound).await?;
                    }
                }

                ptm_ready = ptm_async.readable() => {
                    let mut guard = ptm_ready.map_err(SessionError::Io)?;
                    let data = match guard.try_io(|_| read_ptm_packet(self.ptm_fd)) {
                        Ok(r) => r?,
                        Err(_would_block) => continue,
                    };
                    drop(guard);

                    // Reciprocal opportunistic tiebreak: the control socket may
                    // also be ready right now, same as the ctrl_ready arm above.
                    if let Some(ctrl_raw) = try_read_control(self.control_fd) {
                        self.handle_raced_pair(ctrl_raw, data, outbound).await?;
                    } else {
                        self.apply_ptm(data, outbound).await?;
                    }
                }

                line = client_lines.next_line() => {
                    let line = line.map_err(SessionError::Io)?
                        .ok_or(SessionError::ClientClosed)?;
                    self.handle_client_line(&line).await?;
                }
            }
        }
    }

    /// Apply a control packet and a PTY chunk that were both ready in the
    /// same `select!` iteration, in the priority order `cmd_has_priority`
    /// dictates, regardless of which one happened to win the race.
    async fn handle_raced_pair<W: AsyncWrite + Unpin>(
        &mut self,
        ctrl_raw: Vec<u8>,
        ptm_data: Vec<u8>,
        outbound: &Outbound<W>,
    ) -> Result<()> {
        if ctrl_raw.is_empty() {
            return Err(SessionError::Restart);
        }
        let resp = decode_response(&ctrl_raw)
            .map_err(|e| SessionError::ProtocolViolation(e.to_string()))?;

        if self.cmd_has_priority(&resp) {
            self.apply_control_response(resp, outbound).await?;
            self.apply_ptm(ptm_data, outbound).await?;
        } else {
            self.apply_ptm(ptm_data, outbound).await?;
            self.apply_control_response(resp, outbound).await?;
        }
        Ok(())
    }

    /// True when the control event should be applied before the PTY event
    /// that raced it in: the shell is already at its prompt and the sandbox
    /// is announcing a new exec (priority to the transition), or this isn't
    /// a PROMPT response (misc control events always go first).
    fn cmd_has_priority(&self, resp: &ControlResponse) -> bool {
        match (self.engine.mode(), resp) {
            (SessionMode::Prompt, ControlResponse::Begin) => true,
            (_, ControlResponse::Prompt(_)) => false,
            _ => true,
        }
    }

    async fn apply_ptm<W: AsyncWrite + Unpin>(&mut self, data: Vec<u8>, outbound: &Outbound<W>) -> Result<()> {
        if data.is_empty() {
            return Err(SessionError::Restart);
        }
        let outcome = self.engine.handle_ptm(&data, FlushType::IfNecessary);
        self.emit(outcome, outbound).await
    }

    async fn flush<W: AsyncWrite + Unpin>(&mut self, ft: FlushType, outbound: &Outbound<W>) -> Result<()> {
        let outcome = self.engine.handle_ptm(&[], ft);
        self.emit(outcome, outbound).await
    }

    async fn apply_control_response<W: AsyncWrite + Unpin>(
        &mut self,
        resp: ControlResponse,
        outbound: &Outbound<W>,
    ) -> Result<()> {
        match resp {
            ControlResponse::Prompt(payload) => {
                self.router.cancel_exec_writes();
                let outcome = self.engine.on_prompt(&payload);
                self.emit(outcome, outbound).await
            }
            ControlResponse::Begin => {
                self.engine.on_begin();
                Ok(())
            }
        }
    }

    async fn emit<W: AsyncWrite + Unpin>(
        &mut self,
        outcome: crate::state::PtmOutcome,
        outbound: &Outbound<W>,
    ) -> Result<()> {
        if !outcome.pty_replies.is_empty() {
            write_ptm_raw(self.ptm_fd, &outcome.pty_replies)?;
        }
        for msg in outcome.messages {
            outbound.send(&msg).await.map_err(SessionError::Io)?;
        }
        Ok(())
    }

    async fn handle_client_line(&mut self, line: &str) -> Result<()> {
        let msg: ClientMessage =
            serde_json::from_str(line).map_err(|e| SessionError::ProtocolViolation(e.to_string()))?;

        match msg {
            ClientMessage::Init { .. } => {
                Err(SessionError::ProtocolViolation("INIT after handshake".into()))
            }
            ClientMessage::Input { payload } => {
                self.router.dispatch_input(self.engine.mode(), &payload).await
            }
            ClientMessage::Signal { signum } => {
                self.router.dispatch_signal(self.engine.mode(), signum).await
            }
        }
    }

    /// SIGKILL the launcher/shell, SIGTERM the network helper. The overlay
    /// mount is intentionally left in place so user state survives a
    /// reconnect or a sandbox restart; only `ensure_root`'s `reinit` path
    /// tears it down.
    pub fn shutdown(&mut self) {
        lifecycle::kill_pidfd(&self.launcher_pidfd, libc::SIGKILL);
        if let Some(fd) = self.shell_pidfd.take() {
            lifecycle::kill_pidfd(&fd, libc::SIGKILL);
        }
        if let Some(fd) = self.net_helper_pidfd.take() {
            lifecycle::kill_pidfd(&fd, libc::SIGTERM);
        }
        self.upload_guard.take();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
        unsafe {
            libc::close(self.ptm_fd);
            libc::close(self.control_fd);
        }
    }
}

fn read_ptm_packet(fd: RawFd) -> std::io::Result<Vec<u8>> {
    let mut buf = [0u8; 1024];
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(buf[..n as usize].to_vec())
}

fn try_read_ptm(fd: RawFd) -> Option<Vec<u8>> {
    let mut buf = [0u8; 1024];
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n > 0 {
        Some(buf[..n as usize].to_vec())
    } else {
        None
    }
}

/// Non-blocking probe for a control packet already queued while handling a
/// different event. Mirrors `try_read_ptm`: only reports genuine data,
/// leaving EOF/would-block to the next main-loop iteration's real read.
fn try_read_control(fd: RawFd) -> Option<Vec<u8>> {
    let mut buf = [0u8; 4096];
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if n > 0 {
        Some(buf[..n as usize].to_vec())
    } else {
        None
    }
}

/// Read one packet from the control socket. An empty result means the peer
/// closed the socket (shell/launcher died) — the caller treats that as a
/// restart condition rather than an I/O error.
fn read_control_packet_raw(fd: RawFd) -> std::io::Result<Vec<u8>> {
    let mut buf = [0u8; 4096];
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(buf[..n as usize].to_vec())
}

fn write_ptm_raw(fd: RawFd, data: &[u8]) -> Result<()> {
    let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if n < 0 {
        return Err(SessionError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_in_mode(mode: SessionMode) -> Engine {
        let mut engine = Engine::new();
        match mode {
            SessionMode::Prompt => {}
            SessionMode::ExecDirect | SessionMode::ExecTermemu => {
                engine.on_begin();
            }
            SessionMode::Bad => unreachable!(),
        }
        engine
    }

    fn session_stub(engine: Engine) -> Session {
        Session {
            engine,
            router: InputRouter::new(0, 0),
            ptm_fd: -1,
            control_fd: -1,
            launcher_pidfd: unsafe {
                std::os::fd::OwnedFd::from_raw_fd(libc::dup(libc::STDIN_FILENO))
            },
            shell_pidfd: None,
            net_helper_pidfd: None,
            flush_deadline: Duration::from_millis(500),
            upload_guard: None,
        }
    }

    #[test]
    fn prompt_mode_begin_goes_first() {
        let session = session_stub(engine_in_mode(SessionMode::Prompt));
        assert!(session.cmd_has_priority(&ControlResponse::Begin));
        std::mem::forget(session);
    }

    #[test]
    fn prompt_response_always_yields_to_ptm() {
        let session = session_stub(engine_in_mode(SessionMode::ExecDirect));
        assert!(!session.cmd_has_priority(&ControlResponse::Prompt(Vec::new())));
        std::mem::forget(session);
    }

    #[test]
    fn exec_mode_begin_still_goes_first() {
        let session = session_stub(engine_in_mode(SessionMode::ExecDirect));
        assert!(session.cmd_has_priority(&ControlResponse::Begin));
        std::mem::forget(session);
    }

    #[test]
    fn control_socket_eof_reads_as_empty_packet() {
        // The real control socket is SOCK_SEQPACKET, which reports peer
        // shutdown as a zero-length read, unlike SOCK_DGRAM.
        let mut fds = [0i32; 2];
        let ret = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_SEQPACKET, 0, fds.as_mut_ptr())
        };
        assert_eq!(ret, 0);
        let (a, b) = (fds[0], fds[1]);
        unsafe { libc::close(b) };

        let raw = read_control_packet_raw(a);
        assert_eq!(raw.unwrap(), Vec::<u8>::new());
        unsafe { libc::close(a) };
    }
}
