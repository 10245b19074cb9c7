//! JSON text framing for the terminal channel.
//!
//! Records with a `type` tag decode into [`ClientMessage`]. Anything that is
//! not a JSON object is literal terminal input and passes through untouched.

use crate::error::{TetherError, TetherResult};
use crate::messages::{ClientMessage, ServerMessage};

/// A decoded inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(ClientMessage),
    /// Non-record payload, forwarded as raw input.
    Passthrough(String),
}

/// Decode one inbound text frame.
///
/// Returns `InvalidMessage` for records that are JSON objects but do not match
/// any known message (unknown `type`, missing or mistyped fields).
pub fn decode_text(text: &str) -> TetherResult<Inbound> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Ok(Inbound::Passthrough(text.to_string())),
    };
    if !value.is_object() {
        return Ok(Inbound::Passthrough(text.to_string()));
    }
    serde_json::from_value::<ClientMessage>(value)
        .map(Inbound::Message)
        .map_err(|e| TetherError::InvalidMessage(e.to_string()))
}

/// Encode an outbound message as a JSON text frame.
pub fn encode(msg: &ServerMessage) -> TetherResult<String> {
    Ok(serde_json::to_string(msg)?)
}
