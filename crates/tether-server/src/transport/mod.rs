//! Transport layer: WebSocket listener and frame conversion.

pub mod websocket;
