//! Connection watchdog
//!
//! Periodically checks that the device is still enumerated on the host.
//! USB serial devices vanish without any error on the open handle when
//! unplugged; a read just sees silence. The watchdog notices the port is
//! gone, tears the transport down, and reports the loss so a dispatch
//! blocked on reads fails fast instead of running out its full timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::session::SessionEvent;
use crate::transport::Transport;

/// Handle to a running watchdog task
pub struct WatchdogHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WatchdogHandle {
    /// Stop the watchdog and wait for its task to finish
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

/// Start watching `transport` for device presence every `interval`.
///
/// On loss the transport is disconnected and a [`SessionEvent::Disconnected`]
/// is emitted, then the task exits.
pub fn spawn(
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<SessionEvent>,
    interval: Duration,
) -> WatchdogHandle {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        debug!(?interval, "watchdog started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop_rx.changed() => {
                    debug!("watchdog stopped");
                    return;
                }
            }

            if !transport.is_connected() {
                debug!("transport already closed, watchdog exiting");
                return;
            }
            if !transport.is_present().await {
                warn!("device no longer present, tearing down transport");
                let _ = transport.disconnect().await;
                let _ = events.send(SessionEvent::Disconnected {
                    reason: "device removed".to_string(),
                });
                return;
            }
        }
    });
    WatchdogHandle {
        stop: stop_tx,
        task,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::protocol::error::EngineError;
    use crate::transport::ControlLine;

    struct FakeTransport {
        connected: AtomicBool,
        present: AtomicBool,
    }

    impl FakeTransport {
        fn new() -> Self {
            Self {
                connected: AtomicBool::new(true),
                present: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn connect(&self, _baud_rate: u32) -> Result<(), EngineError> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), EngineError> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn write(&self, _bytes: &[u8]) -> Result<(), EngineError> {
            Ok(())
        }

        async fn read_chunk(&self) -> Result<Vec<u8>, EngineError> {
            Ok(Vec::new())
        }

        async fn set_control_line(
            &self,
            _line: ControlLine,
            _level: bool,
        ) -> Result<(), EngineError> {
            Ok(())
        }

        async fn wait_for_release(&self, _timeout: Duration) {}

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn is_present(&self) -> bool {
            self.present.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_detects_unplug_and_disconnects() {
        let transport = Arc::new(FakeTransport::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = spawn(transport.clone(), tx, Duration::from_secs(2));

        transport.present.store(false, Ordering::SeqCst);
        match rx.recv().await.unwrap() {
            SessionEvent::Disconnected { reason } => assert_eq!(reason, "device removed"),
            other => panic!("expected Disconnected, got {:?}", other),
        }
        assert!(!transport.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_task_quietly() {
        let transport = Arc::new(FakeTransport::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn(transport.clone(), tx, Duration::from_secs(2));

        handle.stop().await;
        assert!(transport.is_connected());
        assert!(rx.try_recv().is_err());
    }
}
