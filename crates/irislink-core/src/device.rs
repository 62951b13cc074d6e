//! Typed device operations
//!
//! High-level getters and setters over the raw command machinery. Each
//! operation ensures the device is in setup mode, dispatches its command,
//! and unwraps the double-encoded payload into a typed value.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::protocol::{Command, DeviceMode, EngineError, NetworkInfo, Response, WifiSettings};
use crate::pwm::DutyCycleWriter;
use crate::session::DeviceSession;

/// Payload key the firmware uses for the LED duty cycle
const LED_DUTY_KEY: &str = "led_external_pwm_duty_cycle";

/// A session shared between tasks (e.g. the PWM driver and a UI)
pub type SharedSession = Arc<Mutex<DeviceSession>>;

/// WiFi connection state as reported by the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WifiStatus {
    /// Connection state string ("connected", "connecting", ...)
    #[serde(default)]
    pub status: String,
    /// Assigned IP address, when the device has one
    #[serde(default, alias = "ip")]
    pub ip_address: Option<String>,
    /// Number of stored credential slots
    #[serde(default)]
    pub networks_configured: Option<u32>,
}

impl WifiStatus {
    /// Whether the device holds a usable address. The firmware reports
    /// `0.0.0.0` while DHCP is still in progress.
    pub fn has_ip(&self) -> bool {
        matches!(self.ip_address.as_deref(), Some(ip) if !ip.is_empty() && ip != "0.0.0.0")
    }
}

/// Snapshot of the device state, fetched field by field
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSummary {
    /// Board MAC address
    pub mac: Option<String>,
    /// LED duty cycle
    pub led_duty: Option<u8>,
    /// Active device mode
    pub mode: Option<DeviceMode>,
    /// WiFi state
    pub wifi: Option<WifiStatus>,
}

impl DeviceSession {
    /// Read the board's MAC address
    pub async fn get_mac(&mut self) -> Result<Option<String>, EngineError> {
        self.ensure_paused().await?;
        let response = self.send(Command::get_serial()).await?;
        Ok(first_payload(&response)
            .and_then(|payload| string_field(&payload, "mac")))
    }

    /// Read the active device mode
    pub async fn get_device_mode(&mut self) -> Result<Option<DeviceMode>, EngineError> {
        self.ensure_paused().await?;
        let response = self.send(Command::get_device_mode()).await?;
        Ok(first_payload(&response)
            .and_then(|payload| string_field(&payload, "mode"))
            .and_then(|s| DeviceMode::parse(&s)))
    }

    /// Switch the device mode; the change takes effect after a restart
    pub async fn set_device_mode(&mut self, mode: DeviceMode) -> Result<(), EngineError> {
        self.ensure_paused().await?;
        self.send(Command::switch_mode(mode)).await?;
        debug!(mode = mode.as_str(), "device mode set");
        Ok(())
    }

    /// Scan for WiFi networks, strongest signal first
    pub async fn scan_networks(&mut self) -> Result<Vec<NetworkInfo>, EngineError> {
        self.ensure_paused().await?;
        let response = self.send(Command::scan_networks()).await?;
        let mut networks = match response {
            Response::Networks(networks) => networks,
            _ => Vec::new(),
        };
        networks.sort_by_key(|n| std::cmp::Reverse(n.rssi));
        Ok(networks)
    }

    /// Store WiFi credentials on the device
    pub async fn configure_wifi(&mut self, settings: &WifiSettings) -> Result<(), EngineError> {
        self.ensure_paused().await?;
        self.send(Command::set_wifi(settings)).await?;
        Ok(())
    }

    /// Tell the device to join its stored network
    pub async fn connect_wifi(&mut self) -> Result<(), EngineError> {
        self.ensure_paused().await?;
        self.send(Command::connect_wifi()).await?;
        Ok(())
    }

    /// Query the WiFi connection status
    pub async fn wifi_status(&mut self) -> Result<Option<WifiStatus>, EngineError> {
        self.ensure_paused().await?;
        let response = self.send(Command::get_wifi_status()).await?;
        Ok(first_payload(&response)
            .and_then(|payload| serde_json::from_value(payload).ok()))
    }

    /// Poll the WiFi status until the device has a real IP address or
    /// `timeout` elapses. Returns the address, or `None` on timeout.
    pub async fn wait_for_ip(
        &mut self,
        timeout: std::time::Duration,
    ) -> Result<Option<String>, EngineError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(status) = self.wifi_status().await? {
                if status.has_ip() {
                    return Ok(status.ip_address);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }
    }

    /// Read the LED external PWM duty cycle
    pub async fn get_led_duty(&mut self) -> Result<Option<u8>, EngineError> {
        self.ensure_paused().await?;
        let response = self.send(Command::get_led_duty()).await?;
        Ok(first_payload(&response)
            .as_ref()
            .and_then(|payload| payload.get(LED_DUTY_KEY))
            .and_then(duty_from_value))
    }

    /// Write the LED external PWM duty cycle (0..=100)
    pub async fn set_led_duty(&mut self, duty: u8) -> Result<(), EngineError> {
        self.ensure_paused().await?;
        self.send(Command::set_led_duty(duty.min(100))).await?;
        Ok(())
    }

    /// Fetch a best-effort snapshot of the device. Individual failures leave
    /// their field `None` rather than failing the whole snapshot.
    pub async fn summary(&mut self) -> DeviceSummary {
        DeviceSummary {
            mac: self.get_mac().await.ok().flatten(),
            led_duty: self.get_led_duty().await.ok().flatten(),
            mode: self.get_device_mode().await.ok().flatten(),
            wifi: self.wifi_status().await.ok().flatten(),
        }
    }
}

/// Payload of the first results entry, when the response carries one
fn first_payload(response: &Response) -> Option<Value> {
    match response {
        Response::Results(entries) => entries.first().map(|entry| entry.payload()),
        _ => None,
    }
}

/// A string field, accepting a bare string payload under the same name
fn string_field(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            // Some firmware builds answer with the bare value
            payload.as_str().map(str::to_string)
        })
}

/// The firmware reports the duty cycle as a number or a numeric string
fn duty_from_value(value: &Value) -> Option<u8> {
    if let Some(n) = value.as_u64() {
        return u8::try_from(n).ok();
    }
    value.as_str().and_then(|s| s.trim().parse().ok())
}

/// [`DutyCycleWriter`] over a shared session: write the duty cycle, then
/// read it back so the limiter resyncs to what the device actually applied
pub struct SessionDutyWriter {
    session: SharedSession,
}

impl SessionDutyWriter {
    /// Create a writer over `session`
    pub fn new(session: SharedSession) -> Self {
        Self { session }
    }
}

#[async_trait]
impl DutyCycleWriter for SessionDutyWriter {
    async fn apply(&mut self, duty: u8) -> Result<Option<u8>, EngineError> {
        let mut session = self.session.lock().await;
        session.set_led_duty(duty).await?;
        session.get_led_duty().await
    }
}
