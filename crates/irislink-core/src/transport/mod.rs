//! Device transports
//!
//! The engine talks to hardware through the [`Transport`] trait so that
//! sessions, the dispatcher, and the console streamer are all testable
//! against scripted implementations. [`serial::SerialTransport`] is the real
//! one.

use std::time::Duration;

use async_trait::async_trait;

use crate::protocol::error::EngineError;

pub mod serial;

pub use serial::{list_ports, PortInfo, SerialTransport};

/// A modem control line of the serial port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlLine {
    /// Data Terminal Ready, wired to the ESP32 reset circuit
    Dtr,
    /// Request To Send
    Rts,
}

/// Byte-level channel to a device
///
/// Methods take `&self` so a session can hold the transport behind an `Arc`
/// and tear it down from the watchdog while a dispatch is blocked on reads.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the channel at the given baud rate
    async fn connect(&self, baud_rate: u32) -> Result<(), EngineError>;

    /// Close the channel; idempotent
    async fn disconnect(&self) -> Result<(), EngineError>;

    /// Write raw bytes
    async fn write(&self, bytes: &[u8]) -> Result<(), EngineError>;

    /// Read whatever is available, returning an empty chunk when nothing is
    /// pending. Callers are expected to back off briefly on empty reads.
    async fn read_chunk(&self) -> Result<Vec<u8>, EngineError>;

    /// Drive a modem control line high or low
    async fn set_control_line(&self, line: ControlLine, level: bool) -> Result<(), EngineError>;

    /// Wait until no other task holds the underlying port, up to `timeout`
    async fn wait_for_release(&self, timeout: Duration);

    /// Whether the channel is currently open
    fn is_connected(&self) -> bool;

    /// Whether the physical device is still attached to the host
    async fn is_present(&self) -> bool;
}
