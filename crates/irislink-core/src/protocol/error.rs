//! Engine errors

use thiserror::Error;

/// Errors that can occur while talking to the device
#[derive(Error, Debug)]
pub enum EngineError {
    /// No transport is open
    #[error("Not connected to device")]
    NotConnected,

    /// The serial channel is owned by another operation
    #[error("Channel busy: another operation owns the transport")]
    Busy,

    /// The device did not answer within the command's deadline
    #[error("Timeout waiting for response")]
    Timeout,

    /// The request could not be written to the port
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// The device answered with an error payload
    #[error("Device returned error: {0}")]
    Device(String),

    /// The underlying transport failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Low-level I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
