//! Command dispatch
//!
//! Writes a single request to the transport and drains the stream until a
//! frame classifies as its response, the deadline passes, or the device
//! reports an error. One dispatch owns the channel for its whole duration;
//! arbitration between commands and console streaming happens in the session.

use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, trace, warn};

use super::commands::Command;
use super::error::EngineError;
use super::frame::FrameExtractor;
use super::response::{classify, is_generic_ack, Classification, Response};
use crate::transport::Transport;

/// Poll backoff when the port has nothing for us
const READ_IDLE_BACKOFF: Duration = Duration::from_millis(30);

/// Send `command` and wait for its classified response.
///
/// For network scans, `scan_grace` bounds how long to keep waiting for a
/// networks block after the device has acknowledged the command; if the
/// grace window drains without one, the scan resolves to an empty list
/// rather than a timeout.
pub(crate) async fn dispatch(
    transport: &dyn Transport,
    command: &Command,
    scan_grace: Duration,
) -> Result<Response, EngineError> {
    let wire = command.encode();
    debug!(command = %command.name, "dispatching");
    transport
        .write(wire.as_bytes())
        .await
        .map_err(|e| EngineError::WriteFailed(e.to_string()))?;

    let deadline = Instant::now() + command.timeout;
    let mut extractor = FrameExtractor::new();
    let mut ack_at: Option<Instant> = None;

    loop {
        let now = Instant::now();
        let effective_deadline = match ack_at {
            Some(at) if command.is_scan() => deadline.min(at + scan_grace),
            _ => deadline,
        };
        if now >= effective_deadline {
            if command.is_scan() && ack_at.is_some() {
                // The scan completed but no networks block ever arrived;
                // treat it as a clean empty result.
                debug!(command = %command.name, "scan grace elapsed, no networks");
                return Ok(Response::Networks(Vec::new()));
            }
            warn!(command = %command.name, "response deadline passed");
            return Err(EngineError::Timeout);
        }

        let chunk = transport.read_chunk().await?;
        if chunk.is_empty() {
            let remaining = effective_deadline - now;
            sleep(remaining.min(READ_IDLE_BACKOFF)).await;
            continue;
        }
        trace!(bytes = chunk.len(), "received");

        for frame in extractor.feed(&chunk) {
            match classify(&frame, command) {
                Classification::Accepted(Response::ErrorResult(message)) => {
                    warn!(command = %command.name, %message, "device error");
                    return Err(EngineError::Device(message));
                }
                Classification::Accepted(response) => {
                    debug!(command = %command.name, "response accepted");
                    return Ok(response);
                }
                Classification::Continue => {
                    if command.is_scan() && ack_at.is_none() && is_generic_ack(&frame) {
                        debug!(command = %command.name, "scan acknowledged, grace window open");
                        ack_at = Some(Instant::now());
                    }
                }
            }
        }
    }
}
