//! tether-core: Shared protocol library for tether.
//!
//! Provides the JSON message types exchanged over the terminal channel, the
//! text frame codec, and the error type shared by the server.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode_text, encode, Inbound};
pub use error::{TetherError, TetherResult};
pub use messages::{ClientMessage, DetachReason, ErrorCode, ResumableEntry, ServerMessage};
