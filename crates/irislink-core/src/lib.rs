//! # IrisLink Core Library
//!
//! Core functionality for setting up OpenIris-compatible eye-tracker boards
//! over their serial console.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - JSON command protocol over the board's half-duplex serial console
//! - Frame extraction from a stream that mixes responses with log noise
//! - Session arbitration between commands and console streaming
//! - WiFi provisioning, device-mode switching, LED duty-cycle control
//! - Rate limiting for slider-driven duty-cycle updates
//! - A connection watchdog that notices unplugged boards
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use irislink_core::prelude::*;
//!
//! let transport = Arc::new(SerialTransport::new("/dev/ttyACM0"));
//! let (mut session, mut events) = DeviceSession::new(transport, SessionConfig::default());
//! session.connect_and_pause().await?;
//!
//! let mac = session.get_mac().await?;
//! let networks = session.scan_networks().await?;
//! session.configure_wifi(&WifiSettings::main("home", "hunter2")).await?;
//! session.connect_wifi().await?;
//! ```

pub mod console;
pub mod demo;
pub mod device;
pub mod protocol;
pub mod pwm;
pub mod session;
pub mod transport;
pub mod watchdog;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::console::ConsoleStreamer;
    pub use crate::demo::DemoTransport;
    pub use crate::device::{DeviceSummary, SessionDutyWriter, SharedSession, WifiStatus};
    pub use crate::protocol::{
        Command, DeviceMode, EngineError, FrameExtractor, NetworkInfo, Response, WifiSettings,
    };
    pub use crate::pwm::{DutyCycleWriter, PwmConfig, PwmDriver, PwmEvent, PwmRateLimiter};
    pub use crate::session::{DeviceSession, SessionConfig, SessionEvent, SessionMode};
    pub use crate::transport::{list_ports, ControlLine, PortInfo, SerialTransport, Transport};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
