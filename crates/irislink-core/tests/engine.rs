use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::time::Instant;

use irislink_core::demo::DemoTransport;
use irislink_core::protocol::{Command, EngineError, Response};
use irislink_core::session::{DeviceSession, SessionConfig, SessionEvent, SessionMode};
use irislink_core::transport::{ControlLine, Transport};

/// Transport that replays a fixed script of read chunks and records writes.
/// Once the script is exhausted every read comes back empty, like a silent
/// port.
struct MockWire {
    script: Mutex<VecDeque<Vec<u8>>>,
    writes: Mutex<Vec<String>>,
    connected: std::sync::atomic::AtomicBool,
}

impl MockWire {
    fn new(script: Vec<&[u8]>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().map(|c| c.to_vec()).collect()),
            writes: Mutex::new(Vec::new()),
            connected: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn silent() -> Arc<Self> {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl Transport for MockWire {
    async fn connect(&self, _baud_rate: u32) -> Result<(), EngineError> {
        self.connected
            .store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), EngineError> {
        self.connected
            .store(false, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), EngineError> {
        if !self.is_connected() {
            return Err(EngineError::NotConnected);
        }
        self.writes
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(bytes).to_string());
        Ok(())
    }

    async fn read_chunk(&self) -> Result<Vec<u8>, EngineError> {
        if !self.is_connected() {
            return Err(EngineError::NotConnected);
        }
        Ok(self.script.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn set_control_line(&self, _line: ControlLine, _level: bool) -> Result<(), EngineError> {
        Ok(())
    }

    async fn wait_for_release(&self, _timeout: Duration) {}

    fn is_connected(&self) -> bool {
        self.connected.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn is_present(&self) -> bool {
        true
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn grace_config() -> SessionConfig {
    SessionConfig {
        scan_grace_ms: Some(500),
        ..SessionConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_scan_block_arriving_after_ack_is_collected() {
    let ack = b"{\"results\":[\"Networks scanned\"]}\n" as &[u8];
    let block =
        b"{\n  \"networks\" : [\n    {\"ssid\":\"lab\",\"rssi\":-44,\"channel\":6,\"auth_mode\":3}\n  ]\n}\n"
            as &[u8];
    // The block shows up a few polls after the completion ack
    let wire = MockWire::new(vec![ack, b"", b"", b"", block]);
    let (mut session, _events) = DeviceSession::new(wire, grace_config());
    session.connect().await.unwrap();

    let response = session.send(Command::scan_networks()).await.unwrap();
    match response {
        Response::Networks(networks) => {
            assert_eq!(networks.len(), 1);
            assert_eq!(networks[0].ssid, "lab");
        }
        other => panic!("expected Networks, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_scan_with_no_networks_resolves_empty_after_grace() {
    let wire = MockWire::new(vec![b"{\"results\":[\"Networks scanned\"]}\n"]);
    let (mut session, _events) = DeviceSession::new(wire, grace_config());
    session.connect().await.unwrap();

    let started = Instant::now();
    let response = session.send(Command::scan_networks()).await.unwrap();
    assert_eq!(response, Response::Networks(Vec::new()));
    // Resolved by the grace window, well inside the 30s scan timeout
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_ensure_paused_writes_once() {
    let transport = Arc::new(DemoTransport::new());
    let (mut session, _events) =
        DeviceSession::new(transport.clone(), SessionConfig::default());
    session.connect().await.unwrap();

    assert!(session.ensure_paused().await.unwrap());
    assert!(session.ensure_paused().await.unwrap());
    assert!(session.ensure_paused().await.unwrap());
    assert_eq!(transport.pause_commands_received(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_command_preempts_streaming_in_order() {
    let transport = Arc::new(DemoTransport::new());
    let (mut session, mut events) =
        DeviceSession::new(transport.clone(), SessionConfig::default());
    session.connect().await.unwrap();

    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    session
        .start_streaming(move |line| sink.lock().unwrap().push(line))
        .await
        .unwrap();
    assert_eq!(session.mode(), SessionMode::Streaming);

    // Let the streamer pick up some console noise
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!lines.lock().unwrap().is_empty());

    let mac = session.get_mac().await.unwrap();
    assert_eq!(mac.as_deref(), Some("24:0a:c4:12:34:56"));
    assert_eq!(session.mode(), SessionMode::Idle);

    let mut observed = Vec::new();
    while let Ok(event) = events.try_recv() {
        observed.push(event);
    }
    // Streaming hands the channel back before any command touches the wire
    assert_eq!(
        observed[0],
        SessionEvent::ModeChanged {
            from: SessionMode::Idle,
            to: SessionMode::Streaming
        }
    );
    assert_eq!(
        observed[1],
        SessionEvent::ModeChanged {
            from: SessionMode::Streaming,
            to: SessionMode::Idle
        }
    );
    assert_eq!(
        observed[2],
        SessionEvent::ModeChanged {
            from: SessionMode::Idle,
            to: SessionMode::CommandInFlight
        }
    );

    // And the wire agrees: pause goes out first, then the getter
    let writes = transport.writes();
    assert!(writes[0].contains("\"pause\""));
    assert!(writes[1].contains("get_serial"));
}

#[tokio::test(start_paused = true)]
async fn test_start_streaming_twice_is_a_no_op() {
    let transport = Arc::new(DemoTransport::new());
    let (mut session, mut events) =
        DeviceSession::new(transport, SessionConfig::default());
    session.connect().await.unwrap();

    session.start_streaming(|_| {}).await.unwrap();
    session.start_streaming(|_| {}).await.unwrap();
    assert_eq!(session.mode(), SessionMode::Streaming);

    let mut mode_changes = 0;
    while let Ok(SessionEvent::ModeChanged { .. }) = events.try_recv() {
        mode_changes += 1;
    }
    assert_eq!(mode_changes, 1);
    session.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_mid_dispatch_fails_fast() {
    let wire = MockWire::silent();
    let (mut session, _events) = DeviceSession::new(wire.clone(), SessionConfig::default());
    session.connect().await.unwrap();

    let started = Instant::now();
    let dispatch = tokio::spawn(async move {
        // get_serial has an 8s timeout; the unplug should beat it
        session.send(Command::get_serial()).await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    wire.disconnect().await.unwrap();

    let result = dispatch.await.unwrap();
    assert!(matches!(result, Err(EngineError::NotConnected)));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_reports_unplugged_board() {
    let transport = Arc::new(DemoTransport::new());
    let (mut session, mut events) =
        DeviceSession::new(transport.clone(), SessionConfig::default());
    session.connect().await.unwrap();

    transport.unplug();
    loop {
        match events.recv().await.unwrap() {
            SessionEvent::Disconnected { .. } => break,
            SessionEvent::ModeChanged { .. } => {}
        }
    }
    assert!(!transport.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_full_provisioning_flow_against_demo_board() {
    let transport = Arc::new(DemoTransport::new());
    init_tracing();
    let (mut session, _events) =
        DeviceSession::new(transport.clone(), SessionConfig::default());
    assert!(session.connect_and_pause().await.unwrap());

    let networks = session.scan_networks().await.unwrap();
    assert_eq!(networks.len(), 2);
    // Strongest first
    assert!(networks[0].rssi >= networks[1].rssi);
    assert_eq!(networks[0].ssid, "demo-lab");

    session
        .configure_wifi(&irislink_core::protocol::WifiSettings::main(
            "demo-lab", "hunter2",
        ))
        .await
        .unwrap();
    session.connect_wifi().await.unwrap();

    // The demo board reports 0.0.0.0 for a couple of polls before DHCP lands
    let ip = session
        .wait_for_ip(Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(ip.as_deref(), Some("192.168.4.42"));

    session.set_led_duty(75).await.unwrap();
    assert_eq!(session.get_led_duty().await.unwrap(), Some(75));
    assert_eq!(transport.duty(), 75);

    session.teardown().await;
    assert!(!transport.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_device_error_payload_surfaces() {
    let wire = MockWire::new(vec![b"{\"error\":\"flash busy\"}\n"]);
    let (mut session, _events) = DeviceSession::new(wire, SessionConfig::default());
    session.connect().await.unwrap();

    let err = session.send(Command::get_serial()).await.unwrap_err();
    match err {
        EngineError::Device(message) => assert_eq!(message, "flash busy"),
        other => panic!("expected Device error, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_response_classification_ignores_interleaved_noise() {
    let wire = MockWire::new(vec![
        b"[TRACK] fps=30 eye=ok\n" as &[u8],
        b"{\"heartbeat\":1}\n",
        b"{\"results\":[\"{\\\"result\\\":\\\"{\\\\\\\"mode\\\\\\\":\\\\\\\"wifi\\\\\\\"}\\\"}\"]}\n",
    ]);
    let (mut session, _events) = DeviceSession::new(wire, SessionConfig::default());
    session.connect().await.unwrap();

    let response = session.send(Command::get_device_mode()).await.unwrap();
    match response {
        Response::Results(entries) => {
            assert_eq!(entries[0].payload(), json!({"mode": "wifi"}));
        }
        other => panic!("expected Results, got {:?}", other),
    }
}
