//! Demo Mode - Simulated tracker board for testing
//!
//! A [`Transport`] that behaves like a real board on the other end of the
//! serial line: it answers the JSON command protocol (with the firmware's
//! double-encoded payloads), chats heartbeat noise while unpaused, emits a
//! multiline networks block for scans, and reboots on a DTR pulse. Useful
//! for UI demo mode and for integration tests that need a full conversation
//! rather than a scripted one.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

use crate::protocol::commands::{
    CMD_CONNECT_WIFI, CMD_GET_DEVICE_MODE, CMD_GET_LED_DUTY, CMD_GET_SERIAL, CMD_GET_WIFI_STATUS,
    CMD_PAUSE, CMD_SCAN_NETWORKS, CMD_SET_LED_DUTY, CMD_SET_WIFI, CMD_SWITCH_MODE,
};
use crate::protocol::{DeviceMode, EngineError};
use crate::transport::{ControlLine, Transport};

/// How many empty reads pass between heartbeat lines while unpaused
const HEARTBEAT_PERIOD: u32 = 5;

struct DemoInner {
    connected: bool,
    present: bool,
    paused: bool,
    dtr_high: bool,
    mode: DeviceMode,
    duty: u8,
    mac: String,
    wifi_configured: bool,
    /// Status queries left before DHCP "finishes"
    dhcp_pending: u8,
    wifi_connected: bool,
    out: VecDeque<u8>,
    writes: Vec<String>,
    pause_commands: u32,
    reads_since_heartbeat: u32,
    rng: StdRng,
}

/// Simulated board behind the [`Transport`] trait
pub struct DemoTransport {
    inner: Mutex<DemoInner>,
}

impl Default for DemoTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoTransport {
    /// Create a simulated board in UVC mode, LED at 50%, unpaused
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DemoInner {
                connected: false,
                present: true,
                paused: false,
                dtr_high: true,
                mode: DeviceMode::Uvc,
                duty: 50,
                mac: "24:0a:c4:12:34:56".to_string(),
                wifi_configured: false,
                dhcp_pending: 0,
                wifi_connected: false,
                out: VecDeque::new(),
                writes: Vec::new(),
                pause_commands: 0,
                reads_since_heartbeat: 0,
                rng: StdRng::seed_from_u64(0x1815),
            }),
        }
    }

    /// Simulate unplugging the board from the host
    pub fn unplug(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.present = false;
    }

    /// How many `pause` commands arrived on the wire
    pub fn pause_commands_received(&self) -> u32 {
        self.inner.lock().unwrap().pause_commands
    }

    /// Every raw write the host has made, in order
    pub fn writes(&self) -> Vec<String> {
        self.inner.lock().unwrap().writes.clone()
    }

    /// Current simulated duty cycle
    pub fn duty(&self) -> u8 {
        self.inner.lock().unwrap().duty
    }
}

impl DemoInner {
    fn enqueue_line(&mut self, line: &str) {
        self.out.extend(line.as_bytes());
        self.out.push_back(b'\n');
    }

    /// Results frame carrying a double-encoded payload, the way the
    /// firmware wraps every getter reply
    fn enqueue_result(&mut self, payload: Value) {
        let entry = json!({ "result": payload.to_string() }).to_string();
        let frame = json!({ "results": [entry] }).to_string();
        self.enqueue_line(&frame);
    }

    fn enqueue_ack(&mut self, message: &str) {
        let frame = json!({ "results": [message] }).to_string();
        self.enqueue_line(&frame);
    }

    fn enqueue_error(&mut self, message: &str) {
        let frame = json!({ "error": message }).to_string();
        self.enqueue_line(&frame);
    }

    fn enqueue_boot_banner(&mut self) {
        // ANSI colors on purpose: the extractor has to strip these
        self.enqueue_line("\x1b[32m[INFO]\x1b[0m OpenIris-compatible firmware booting");
        self.enqueue_line("[INFO] camera init ok");
    }

    fn enqueue_scan_results(&mut self) {
        self.enqueue_ack("Networks scanned");
        // The firmware prints this block pretty, over several lines
        let jitter_a: i32 = self.rng.gen_range(-4..=4);
        let jitter_b: i32 = self.rng.gen_range(-4..=4);
        let block = format!(
            "{{\n  \"networks\" : [\n    \
             {{\"ssid\":\"demo-lab\",\"rssi\":{},\"channel\":6,\"auth_mode\":3}},\n    \
             {{\"ssid\":\"open-guest\",\"rssi\":{},\"channel\":11,\"auth_mode\":0}}\n  ]\n}}",
            -48 + jitter_a,
            -72 + jitter_b,
        );
        self.enqueue_line(&block);
    }

    fn handle_command(&mut self, name: &str, data: Option<&Value>) {
        match name {
            CMD_PAUSE => {
                self.pause_commands += 1;
                self.paused = data
                    .and_then(|d| d.get("pause"))
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                self.enqueue_ack("Paused");
            }
            CMD_GET_SERIAL => {
                let payload = json!({ "mac": self.mac });
                self.enqueue_result(payload);
            }
            CMD_GET_DEVICE_MODE => {
                let payload = json!({ "mode": self.mode.as_str() });
                self.enqueue_result(payload);
            }
            CMD_SWITCH_MODE => {
                let requested = data
                    .and_then(|d| d.get("mode"))
                    .and_then(Value::as_str)
                    .and_then(DeviceMode::parse);
                match requested {
                    Some(mode) => {
                        self.mode = mode;
                        self.enqueue_ack("Mode updated, restart to apply");
                    }
                    None => self.enqueue_error("Invalid mode"),
                }
            }
            CMD_SCAN_NETWORKS => self.enqueue_scan_results(),
            CMD_SET_WIFI => {
                self.wifi_configured = true;
                self.enqueue_ack("Credentials stored");
            }
            CMD_CONNECT_WIFI => {
                if self.wifi_configured {
                    self.wifi_connected = true;
                    self.dhcp_pending = 2;
                    self.enqueue_ack("Connecting");
                } else {
                    self.enqueue_error("No credentials configured");
                }
            }
            CMD_GET_WIFI_STATUS => {
                let payload = if self.wifi_connected {
                    if self.dhcp_pending > 0 {
                        self.dhcp_pending -= 1;
                        json!({ "status": "connecting", "ip_address": "0.0.0.0" })
                    } else {
                        json!({
                            "status": "connected",
                            "ip_address": "192.168.4.42",
                            "networks_configured": 1
                        })
                    }
                } else {
                    json!({ "status": "idle" })
                };
                self.enqueue_result(payload);
            }
            CMD_GET_LED_DUTY => {
                // Numeric string, as some firmware builds report it
                let payload = json!({ "led_external_pwm_duty_cycle": self.duty.to_string() });
                self.enqueue_result(payload);
            }
            CMD_SET_LED_DUTY => {
                let requested = data
                    .and_then(|d| d.get("dutyCycle"))
                    .and_then(Value::as_u64);
                match requested {
                    Some(duty) if duty <= 100 => {
                        self.duty = duty as u8;
                        self.enqueue_ack("Duty cycle set");
                    }
                    _ => self.enqueue_error("Invalid duty cycle"),
                }
            }
            _ => self.enqueue_error("Unknown command"),
        }
    }

    fn maybe_heartbeat(&mut self) {
        if self.paused {
            return;
        }
        self.reads_since_heartbeat += 1;
        if self.reads_since_heartbeat >= HEARTBEAT_PERIOD {
            self.reads_since_heartbeat = 0;
            let fps: u32 = self.rng.gen_range(28..=32);
            self.enqueue_line(&format!("[TRACK] fps={} eye=ok", fps));
        }
    }
}

#[async_trait]
impl Transport for DemoTransport {
    async fn connect(&self, _baud_rate: u32) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.present {
            return Err(EngineError::Transport("device not present".into()));
        }
        inner.connected = true;
        inner.out.clear();
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), EngineError> {
        self.inner.lock().unwrap().connected = false;
        Ok(())
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.connected {
            return Err(EngineError::NotConnected);
        }
        if !inner.present {
            return Err(EngineError::Transport("device not present".into()));
        }
        let text = String::from_utf8_lossy(bytes).to_string();
        inner.writes.push(text.clone());

        let Ok(envelope) = serde_json::from_str::<Value>(text.trim()) else {
            inner.enqueue_error("Malformed request");
            return Ok(());
        };
        let commands = envelope
            .get("commands")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for entry in &commands {
            let Some(name) = entry.get("command").and_then(Value::as_str) else {
                inner.enqueue_error("Malformed request");
                continue;
            };
            inner.handle_command(name, entry.get("data"));
        }
        Ok(())
    }

    async fn read_chunk(&self) -> Result<Vec<u8>, EngineError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.connected {
            return Err(EngineError::NotConnected);
        }
        if inner.out.is_empty() {
            inner.maybe_heartbeat();
        }
        // Deliver in bounded chunks so consumers see realistic fragmentation
        let take = inner.out.len().min(64);
        Ok(inner.out.drain(..take).collect())
    }

    async fn set_control_line(&self, line: ControlLine, level: bool) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        if line == ControlLine::Dtr {
            let was_high = inner.dtr_high;
            inner.dtr_high = level;
            // Rising edge after a low pulse reboots the board
            if level && !was_high {
                inner.paused = false;
                inner.wifi_connected = false;
                inner.dhcp_pending = 0;
                inner.out.clear();
                inner.enqueue_boot_banner();
            }
        }
        Ok(())
    }

    async fn wait_for_release(&self, _timeout: Duration) {}

    fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }

    async fn is_present(&self) -> bool {
        self.inner.lock().unwrap().present
    }
}
