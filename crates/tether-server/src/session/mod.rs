//! Session management: PTY lifecycle, output history, timers, attachment.

pub mod connection;
pub mod process;
pub mod pty;
pub mod registry;
pub mod resume;
pub mod ring_buffer;
pub mod timers;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{ConnectionHandle, Outbound};
pub use pty::PtySpawner;
pub use registry::{SessionPolicy, SessionRegistry, SessionRequest};
pub use resume::ResumeScanner;
