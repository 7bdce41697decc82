//! Error types for the shellbridge-terminal crate.

use thiserror::Error;

/// All errors that can surface from a session's lifecycle or run loop.
///
/// `Restart` is not a hard failure: it unwinds the session's run loop so the
/// server dispatcher can spin up a fresh session on the same TCP connection
/// (sandbox crashed — reconnect automatically, per the error handling policy).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("handshake error: {0}")]
    Handshake(String),

    #[error("overlay filesystem error: {0}")]
    Overlay(String),

    #[error("PTY spawn error: {0}")]
    PtySpawn(String),

    #[error("control socket error: {0}")]
    ControlSocket(String),

    #[error("pidfd error: {0}")]
    Pidfd(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("client closed the connection")]
    ClientClosed,

    /// Sandbox-side death (control socket EOF, launcher/helper pidfd readable,
    /// PTY EOF): not an error the client sees — the dispatcher restarts.
    #[error("sandbox restart requested")]
    Restart,
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::Handshake(_) => "HANDSHAKE_ERROR",
            SessionError::Overlay(_) => "OVERLAY_ERROR",
            SessionError::PtySpawn(_) => "PTY_SPAWN_ERROR",
            SessionError::ControlSocket(_) => "CONTROL_SOCKET_ERROR",
            SessionError::Pidfd(_) => "PIDFD_ERROR",
            SessionError::ProtocolViolation(_) => "PROTOCOL_VIOLATION",
            SessionError::Io(_) => "IO_ERROR",
            SessionError::ClientClosed => "CLIENT_CLOSED",
            SessionError::Restart => "RESTART",
        }
    }

    /// Whether this error should trigger the "restart same connection" path
    /// rather than tearing the client connection down entirely.
    pub fn is_restart(&self) -> bool {
        matches!(self, SessionError::Restart)
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
