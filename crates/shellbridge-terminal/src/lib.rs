//! shellbridge-terminal — sandboxed PTY session lifecycle and the output
//! state machine that turns raw shell bytes into the client-facing wire
//! protocol.
//!
//! A `Session` owns one sandbox: its overlay root, sealed shell binary,
//! forked launcher, control socket, and the tracked pidfds that let the
//! bridge notice the sandbox dying without polling. `state::Engine` holds
//! the per-session output mode (`PROMPT` / `EXEC_DIRECT` / `EXEC_TERMEMU`)
//! and decides what, if anything, to flush to the client on each PTY read.

pub mod ansi;
pub mod error;
pub mod fdpass;
pub mod input;
pub mod lifecycle;
pub mod outbound;
pub mod pidfd;
pub mod session;
pub mod snapshot;
pub mod state;
pub mod types;
pub mod upload;

pub use error::{Result, SessionError};
pub use session::Session;
pub use state::{Engine, SessionMode};
pub use types::SessionId;
