//! Device protocol
//!
//! The device speaks newline-terminated JSON envelopes over its serial
//! console. This module owns the command vocabulary, stream framing,
//! response classification, and the single-command dispatch loop.

pub mod commands;
pub(crate) mod dispatcher;
pub mod error;
pub mod frame;
pub mod response;

pub use commands::{Command, DeviceMode, WifiSettings};
pub use error::EngineError;
pub use frame::{Frame, FrameExtractor};
pub use response::{Classification, NetworkInfo, Response, ResultEntry};

/// Default serial baud rate for the device console
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default response timeout in milliseconds for commands without one
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
