pub mod control;
pub mod wire;

pub use control::{CommandTag, ControlResponse, ResponseTag};
pub use wire::{ClientMessage, ServerMessage};
