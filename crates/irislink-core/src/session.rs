//! Device session
//!
//! Owns the transport and arbitrates the half-duplex channel between the two
//! things that want it: one-shot commands and console streaming. Only one
//! may run at a time. Dispatching a command while streaming preempts the
//! streamer; starting the streamer while a command is in flight is refused.
//!
//! Mode transitions and connection loss are reported over an event channel
//! handed out at construction, so a UI can follow along without polling.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::console::ConsoleStreamer;
use crate::protocol::dispatcher::dispatch;
use crate::protocol::{Command, EngineError, Response, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS};
use crate::pwm::PwmConfig;
use crate::transport::{ControlLine, Transport};
use crate::watchdog::{self, WatchdogHandle};

/// What currently owns the serial channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMode {
    /// Channel free
    Idle,
    /// A command dispatch owns the channel
    CommandInFlight,
    /// The console streamer owns the channel
    Streaming,
}

/// Notifications emitted by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The channel owner changed
    ModeChanged {
        /// Previous mode
        from: SessionMode,
        /// New mode
        to: SessionMode,
    },
    /// The connection is gone (unplug, teardown)
    Disconnected {
        /// Human-readable cause
        reason: String,
    },
}

/// Session tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Serial baud rate
    pub baud_rate: u32,
    /// Default command timeout in milliseconds
    pub command_timeout_ms: u64,
    /// Grace window for scans after a completion ack; `None` uses the
    /// command's own timeout
    pub scan_grace_ms: Option<u64>,
    /// Device presence poll interval in milliseconds
    pub watchdog_interval_ms: u64,
    /// Bound on waiting for the port to be released during a mode switch
    pub release_wait_ms: u64,
    /// Settle delay before the first pause attempt, in milliseconds
    pub pause_settle_ms: u64,
    /// Number of pause attempts before giving up
    pub pause_attempts: u32,
    /// Delay between pause attempts, in milliseconds
    pub pause_retry_delay_ms: u64,
    /// LED duty-cycle rate limiting
    pub pwm: PwmConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            command_timeout_ms: DEFAULT_TIMEOUT_MS,
            scan_grace_ms: None,
            watchdog_interval_ms: 2000,
            release_wait_ms: 500,
            pause_settle_ms: 600,
            pause_attempts: 3,
            pause_retry_delay_ms: 500,
            pwm: PwmConfig::default(),
        }
    }
}

struct StreamerHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// A connection to one device
///
/// Construct with [`DeviceSession::new`], then [`connect`](Self::connect).
/// The typed operations (`get_mac`, `scan_networks`, …) live in
/// [`crate::device`]; this type owns the channel arbitration they build on.
pub struct DeviceSession {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    mode: SessionMode,
    last_baud: u32,
    paused: bool,
    events: mpsc::UnboundedSender<SessionEvent>,
    streamer: Option<StreamerHandle>,
    watchdog: Option<WatchdogHandle>,
}

impl DeviceSession {
    /// Create a session over `transport`, returning it with the receiving
    /// end of its event channel
    pub fn new(
        transport: Arc<dyn Transport>,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let baud = config.baud_rate;
        (
            Self {
                transport,
                config,
                mode: SessionMode::Idle,
                last_baud: baud,
                paused: false,
                events,
                streamer: None,
                watchdog: None,
            },
            rx,
        )
    }

    /// Open the transport and start the presence watchdog
    pub async fn connect(&mut self) -> Result<(), EngineError> {
        self.transport.connect(self.config.baud_rate).await?;
        self.last_baud = self.config.baud_rate;
        self.watchdog = Some(watchdog::spawn(
            Arc::clone(&self.transport),
            self.events.clone(),
            Duration::from_millis(self.config.watchdog_interval_ms),
        ));
        info!(baud = self.last_baud, "session connected");
        Ok(())
    }

    /// Connect, then put the device into setup mode with retries
    pub async fn connect_and_pause(&mut self) -> Result<bool, EngineError> {
        self.connect().await?;
        self.pause_with_retries().await
    }

    /// Dispatch one command and wait for its response.
    ///
    /// Preempts console streaming if it is running. Fails with
    /// [`EngineError::Busy`] when another command already owns the channel.
    pub async fn send(&mut self, command: Command) -> Result<Response, EngineError> {
        if self.mode == SessionMode::CommandInFlight {
            return Err(EngineError::Busy);
        }
        if self.mode == SessionMode::Streaming {
            debug!(command = %command.name, "preempting console streaming");
            self.stop_streaming().await?;
        }
        if !self.transport.is_connected() {
            return Err(EngineError::NotConnected);
        }

        let scan_grace = self
            .config
            .scan_grace_ms
            .map(Duration::from_millis)
            .unwrap_or(command.timeout);

        self.set_mode(SessionMode::CommandInFlight);
        let result = dispatch(self.transport.as_ref(), &command, scan_grace).await;
        self.set_mode(SessionMode::Idle);
        result
    }

    /// Put the device into setup mode if it is not already.
    ///
    /// The paused state is cached for the life of the connection, so repeated
    /// calls cost nothing on the wire. A failed pause is reported as
    /// `Ok(false)` rather than an error; callers retry or proceed.
    pub async fn ensure_paused(&mut self) -> Result<bool, EngineError> {
        if self.paused {
            return Ok(true);
        }
        match self.send(Command::pause()).await {
            Ok(_) => {
                self.paused = true;
                debug!("device paused");
                Ok(true)
            }
            Err(e) => {
                debug!(error = %e, "pause attempt failed");
                Ok(false)
            }
        }
    }

    /// Pause with a settle delay and retries, for right after connect when
    /// the device may still be booting and chatty
    pub async fn pause_with_retries(&mut self) -> Result<bool, EngineError> {
        tokio::time::sleep(Duration::from_millis(self.config.pause_settle_ms)).await;
        for attempt in 1..=self.config.pause_attempts {
            if self.ensure_paused().await? {
                return Ok(true);
            }
            warn!(attempt, "pause not acknowledged");
            if attempt < self.config.pause_attempts {
                tokio::time::sleep(Duration::from_millis(self.config.pause_retry_delay_ms)).await;
            }
        }
        Ok(false)
    }

    /// Hand the channel to the console streamer, delivering each line to
    /// `on_line` until [`stop_streaming`](Self::stop_streaming) or a command
    /// preempts it. No-op when already streaming; refused while a command is
    /// in flight.
    pub async fn start_streaming(
        &mut self,
        on_line: impl FnMut(String) + Send + 'static,
    ) -> Result<(), EngineError> {
        match self.mode {
            SessionMode::CommandInFlight => return Err(EngineError::Busy),
            SessionMode::Streaming => return Ok(()),
            SessionMode::Idle => {}
        }

        // Fresh port state so the streamer never inherits a half-read frame
        self.rebuild_transport().await?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let transport = Arc::clone(&self.transport);
        let task = tokio::spawn(async move {
            ConsoleStreamer::run(transport.as_ref(), on_line, cancel_rx).await;
        });
        self.streamer = Some(StreamerHandle {
            cancel: cancel_tx,
            task,
        });
        self.set_mode(SessionMode::Streaming);
        Ok(())
    }

    /// Stop console streaming and return the channel to idle
    pub async fn stop_streaming(&mut self) -> Result<(), EngineError> {
        if let Some(handle) = self.streamer.take() {
            let _ = handle.cancel.send(true);
            let _ = handle.task.await;
            self.rebuild_transport().await?;
        }
        self.set_mode(SessionMode::Idle);
        Ok(())
    }

    /// Pulse DTR low to reset the board via its auto-program circuit.
    /// The device reboots unpaused.
    pub async fn reset_pulse(&mut self) -> Result<(), EngineError> {
        self.transport
            .set_control_line(ControlLine::Dtr, false)
            .await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.transport
            .set_control_line(ControlLine::Dtr, true)
            .await?;
        self.paused = false;
        info!("reset pulse sent");
        Ok(())
    }

    /// Close everything down: streamer, watchdog, transport. Emits a
    /// `Disconnected` event.
    pub async fn teardown(&mut self) {
        if let Some(handle) = self.streamer.take() {
            let _ = handle.cancel.send(true);
            let _ = handle.task.await;
        }
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.stop().await;
        }
        let _ = self.transport.disconnect().await;
        self.paused = false;
        self.set_mode(SessionMode::Idle);
        let _ = self.events.send(SessionEvent::Disconnected {
            reason: "session closed".to_string(),
        });
        info!("session torn down");
    }

    /// Current channel owner
    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// Whether the device is believed to be in setup mode
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Session tuning
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Shared handle to the underlying transport
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    /// Drop the cached paused state, forcing the next `ensure_paused` to go
    /// to the wire. Used after operations that reboot the device.
    pub fn invalidate_paused(&mut self) {
        self.paused = false;
    }

    async fn rebuild_transport(&mut self) -> Result<(), EngineError> {
        self.transport.disconnect().await?;
        self.transport
            .wait_for_release(Duration::from_millis(self.config.release_wait_ms))
            .await;
        self.transport.connect(self.last_baud).await
    }

    fn set_mode(&mut self, to: SessionMode) {
        if self.mode != to {
            let from = self.mode;
            self.mode = to;
            debug!(?from, ?to, "session mode changed");
            let _ = self.events.send(SessionEvent::ModeChanged { from, to });
        }
    }
}
