//! LED duty-cycle rate limiting
//!
//! A UI slider can emit dozens of values per second, but every write costs a
//! full serial round trip on a half-duplex channel. The limiter lets large
//! jumps through immediately (capped by a cooldown) for responsive feedback
//! and settles on the final value once input goes quiet.
//!
//! [`PwmRateLimiter`] is a pure state machine over explicit timestamps so it
//! can be tested without a device; [`PwmDriver`] wires it to a
//! [`DutyCycleWriter`] and a tokio input channel.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::protocol::error::EngineError;

/// Tuning knobs for the rate limiter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PwmConfig {
    /// Quiet period before the final value is committed, in milliseconds
    pub debounce_ms: u64,
    /// Minimum jump (in duty points) that sends immediately
    pub threshold: u8,
    /// Minimum spacing between immediate sends, in milliseconds
    pub cooldown_ms: u64,
}

impl Default for PwmConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1000,
            threshold: 5,
            cooldown_ms: 400,
        }
    }
}

impl PwmConfig {
    fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Why a value was sent to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendReason {
    /// Input went quiet; this is the settled value
    Debounced,
    /// The value jumped far enough to warrant immediate feedback
    Threshold,
}

/// A duty-cycle write the limiter has decided to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PwmSend {
    /// Duty cycle to write (0..=100)
    pub value: u8,
    /// What triggered the send
    pub reason: SendReason,
}

/// Notifications emitted by [`PwmDriver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PwmEvent {
    /// A value was written to the device
    Sent {
        /// Duty cycle written
        value: u8,
        /// What triggered the send
        reason: SendReason,
    },
    /// The device confirmed the settled value via readback
    Confirmed {
        /// Duty cycle the device reports
        value: u8,
    },
    /// A write failed; the limiter keeps its previous state
    Failed {
        /// Duty cycle that could not be written
        value: u8,
        /// Error description
        error: String,
    },
}

/// Decides when slider input becomes a device write
#[derive(Debug)]
pub struct PwmRateLimiter {
    config: PwmConfig,
    /// Last value the device confirmed (via sync or readback)
    device_value: Option<u8>,
    /// Last value successfully written
    last_sent: Option<u8>,
    /// Latest input, not yet committed
    pending: Option<u8>,
    debounce_deadline: Option<Instant>,
    last_threshold_send: Option<Instant>,
    /// Value currently being written, if any
    in_flight: Option<u8>,
}

impl PwmRateLimiter {
    /// Create a limiter with the given tuning
    pub fn new(config: PwmConfig) -> Self {
        Self {
            config,
            device_value: None,
            last_sent: None,
            pending: None,
            debounce_deadline: None,
            last_threshold_send: None,
            in_flight: None,
        }
    }

    /// Record an input value. Returns an immediate threshold send when the
    /// jump is large enough, the cooldown has passed, and no write is in
    /// flight; otherwise the value waits for the debounce deadline.
    pub fn on_input(&mut self, value: u8, now: Instant) -> Option<PwmSend> {
        let value = value.min(100);
        self.pending = Some(value);
        self.debounce_deadline = Some(now + self.config.debounce());

        if self.in_flight.is_some() {
            return None;
        }
        let baseline = self.last_sent.or(self.device_value)?;
        let jump = (i16::from(value) - i16::from(baseline)).unsigned_abs();
        if jump < u16::from(self.config.threshold) {
            return None;
        }
        if let Some(at) = self.last_threshold_send {
            if now < at + self.config.cooldown() {
                return None;
            }
        }
        self.last_threshold_send = Some(now);
        Some(PwmSend {
            value,
            reason: SendReason::Threshold,
        })
    }

    /// Check the debounce deadline. The settled value is always sent, even
    /// when it equals the last threshold send, so the device and a readback
    /// confirmation end on the final input.
    pub fn poll_debounce(&mut self, now: Instant) -> Option<PwmSend> {
        let deadline = self.debounce_deadline?;
        if now < deadline || self.in_flight.is_some() {
            return None;
        }
        let value = self.pending.take()?;
        self.debounce_deadline = None;
        Some(PwmSend {
            value,
            reason: SendReason::Debounced,
        })
    }

    /// Deadline the driver should wake at, if a value is pending
    pub fn debounce_deadline(&self) -> Option<Instant> {
        self.debounce_deadline
    }

    /// Adopt a value read from the device as the current baseline
    pub fn sync_device_value(&mut self, value: u8) {
        self.device_value = Some(value);
        self.last_sent = Some(value);
    }

    /// Mark a write of `value` as started; inputs keep accumulating but
    /// nothing sends until it finishes
    pub fn begin_send(&mut self, value: u8) {
        self.in_flight = Some(value);
    }

    /// Mark the write as successful. The baseline moves only now: to the
    /// readback when the device reports one, else to the written value.
    pub fn complete_send(&mut self, readback: Option<u8>) {
        let sent = self.in_flight.take();
        match readback {
            Some(value) => {
                self.device_value = Some(value);
                self.last_sent = Some(value);
            }
            None => {
                if sent.is_some() {
                    self.last_sent = sent;
                }
            }
        }
    }

    /// Mark the write as failed; the baseline stays on what the device
    /// last had, so the value remains eligible for another send
    pub fn fail_send(&mut self) {
        self.in_flight = None;
    }

    /// Last value the device confirmed
    pub fn device_value(&self) -> Option<u8> {
        self.device_value
    }

    /// Drop all pending state, keeping the tuning
    pub fn reset(&mut self) {
        self.device_value = None;
        self.last_sent = None;
        self.pending = None;
        self.debounce_deadline = None;
        self.last_threshold_send = None;
        self.in_flight = None;
    }
}

/// Writes a duty cycle to the device, returning the value it reads back
#[async_trait]
pub trait DutyCycleWriter: Send {
    /// Apply `duty` and return the device's readback, when available
    async fn apply(&mut self, duty: u8) -> Result<Option<u8>, EngineError>;
}

/// Pumps slider input through the limiter into a [`DutyCycleWriter`]
pub struct PwmDriver<W: DutyCycleWriter> {
    limiter: PwmRateLimiter,
    writer: W,
}

impl<W: DutyCycleWriter> PwmDriver<W> {
    /// Create a driver with the given tuning and writer
    pub fn new(config: PwmConfig, writer: W) -> Self {
        Self {
            limiter: PwmRateLimiter::new(config),
            writer,
        }
    }

    /// Seed the limiter with the device's current duty cycle
    pub fn sync_device_value(&mut self, value: u8) {
        self.limiter.sync_device_value(value);
    }

    /// Run until the input channel closes. Each input goes through the
    /// limiter; accepted sends are written and reported on `events`.
    pub async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<u8>, events: mpsc::UnboundedSender<PwmEvent>) {
        loop {
            let deadline = self.limiter.debounce_deadline();
            let send = tokio::select! {
                maybe = inputs.recv() => match maybe {
                    Some(value) => self.limiter.on_input(value, Instant::now()),
                    None => break,
                },
                _ = wake_at(deadline) => self.limiter.poll_debounce(Instant::now()),
            };
            if let Some(send) = send {
                self.apply(send, &events).await;
            }
        }
    }

    async fn apply(&mut self, send: PwmSend, events: &mpsc::UnboundedSender<PwmEvent>) {
        self.limiter.begin_send(send.value);
        match self.writer.apply(send.value).await {
            Ok(readback) => {
                self.limiter.complete_send(readback);
                debug!(value = send.value, reason = ?send.reason, "duty cycle written");
                let _ = events.send(PwmEvent::Sent {
                    value: send.value,
                    reason: send.reason,
                });
                // Confirmations matter only for the settled value; the
                // intermediate threshold sends are feedback, not state.
                if send.reason == SendReason::Debounced {
                    if let Some(value) = readback {
                        let _ = events.send(PwmEvent::Confirmed { value });
                    }
                }
            }
            Err(e) => {
                self.limiter.fail_send();
                warn!(value = send.value, error = %e, "duty cycle write failed");
                let _ = events.send(PwmEvent::Failed {
                    value: send.value,
                    error: e.to_string(),
                });
            }
        }
    }
}

/// Sleep until `deadline`, or forever when there is none
async fn wake_at(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
