//! Protocol commands
//!
//! Defines the JSON commands understood by the device's setup-mode console
//! and the wire envelope they are sent in.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Command name for entering setup (paused) mode
pub const CMD_PAUSE: &str = "pause";
/// Command name for querying the board serial/MAC
pub const CMD_GET_SERIAL: &str = "get_serial";
/// Command name for querying the active device mode
pub const CMD_GET_DEVICE_MODE: &str = "get_device_mode";
/// Command name for switching the device mode
pub const CMD_SWITCH_MODE: &str = "switch_mode";
/// Command name for scanning WiFi networks
pub const CMD_SCAN_NETWORKS: &str = "scan_networks";
/// Command name for storing WiFi credentials
pub const CMD_SET_WIFI: &str = "set_wifi";
/// Command name for joining the stored network
pub const CMD_CONNECT_WIFI: &str = "connect_wifi";
/// Command name for querying WiFi connection status
pub const CMD_GET_WIFI_STATUS: &str = "get_wifi_status";
/// Command name for reading the LED duty cycle
pub const CMD_GET_LED_DUTY: &str = "get_led_duty_cycle";
/// Command name for writing the LED duty cycle
pub const CMD_SET_LED_DUTY: &str = "set_led_duty_cycle";

/// A single request to the device
///
/// Immutable once created. Each command carries its own response timeout
/// since some operations (network scans) take far longer than others.
#[derive(Debug, Clone)]
pub struct Command {
    /// Command name as it appears on the wire
    pub name: String,
    /// Optional structured parameters (`data` field of the envelope)
    pub params: Option<Value>,
    /// Response deadline measured from send time
    pub timeout: Duration,
}

impl Command {
    /// Create a command with no parameters
    pub fn new(name: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            name: name.into(),
            params: None,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Create a command with parameters
    pub fn with_params(name: impl Into<String>, params: Value, timeout_ms: u64) -> Self {
        Self {
            name: name.into(),
            params: Some(params),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Enter setup mode so the device answers control commands
    pub fn pause() -> Self {
        Self::with_params(CMD_PAUSE, json!({ "pause": true }), 3000)
    }

    /// Query the board serial (MAC address)
    pub fn get_serial() -> Self {
        Self::new(CMD_GET_SERIAL, 8000)
    }

    /// Query the active device mode
    pub fn get_device_mode() -> Self {
        Self::new(CMD_GET_DEVICE_MODE, 15000)
    }

    /// Switch the device mode (takes effect after restart)
    pub fn switch_mode(mode: DeviceMode) -> Self {
        Self::with_params(CMD_SWITCH_MODE, json!({ "mode": mode.as_str() }), 5000)
    }

    /// Scan for WiFi networks
    pub fn scan_networks() -> Self {
        Self::new(CMD_SCAN_NETWORKS, 30000)
    }

    /// Store WiFi credentials on the device
    pub fn set_wifi(settings: &WifiSettings) -> Self {
        Self::with_params(
            CMD_SET_WIFI,
            serde_json::to_value(settings).unwrap_or(Value::Null),
            15000,
        )
    }

    /// Join the stored WiFi network
    pub fn connect_wifi() -> Self {
        Self::with_params(CMD_CONNECT_WIFI, json!({}), 10000)
    }

    /// Query the WiFi connection status
    pub fn get_wifi_status() -> Self {
        Self::new(CMD_GET_WIFI_STATUS, 8000)
    }

    /// Read the LED external PWM duty cycle
    pub fn get_led_duty() -> Self {
        Self::new(CMD_GET_LED_DUTY, 10000)
    }

    /// Write the LED external PWM duty cycle (0..=100)
    pub fn set_led_duty(duty: u8) -> Self {
        Self::with_params(CMD_SET_LED_DUTY, json!({ "dutyCycle": duty }), 8000)
    }

    /// Override the response timeout
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout = Duration::from_millis(timeout_ms);
        self
    }

    /// Whether this is the network-scan command (special response handling)
    pub fn is_scan(&self) -> bool {
        self.name == CMD_SCAN_NETWORKS
    }

    /// Whether this is the mode-switch command (prompt ack, no payload wait)
    pub fn is_mode_switch(&self) -> bool {
        self.name == CMD_SWITCH_MODE
    }

    /// Encode the request envelope, newline terminated:
    /// `{"commands":[{"command":<name>,"data":<params>}]}\n`
    ///
    /// The `data` field is omitted entirely when there are no parameters.
    pub fn encode(&self) -> String {
        let entry = match &self.params {
            Some(params) => json!({ "command": self.name, "data": params }),
            None => json!({ "command": self.name }),
        };
        let envelope = json!({ "commands": [entry] });
        let mut wire = envelope.to_string();
        wire.push('\n');
        wire
    }
}

/// Operating mode of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    /// Stream over WiFi
    Wifi,
    /// Act as a USB video device
    Uvc,
    /// Pick automatically at boot
    Auto,
}

impl DeviceMode {
    /// Wire spelling of the mode
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceMode::Wifi => "wifi",
            DeviceMode::Uvc => "uvc",
            DeviceMode::Auto => "auto",
        }
    }

    /// Parse the wire spelling (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "wifi" => Some(DeviceMode::Wifi),
            "uvc" => Some(DeviceMode::Uvc),
            "auto" => Some(DeviceMode::Auto),
            _ => None,
        }
    }
}

/// Parameters for the `set_wifi` command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiSettings {
    /// Credential slot name (the firmware default is "main")
    pub name: String,
    /// Network SSID
    pub ssid: String,
    /// Network password (empty for open networks)
    pub password: String,
    /// Channel hint, 0 for any
    pub channel: u8,
    /// TX power hint, 0 for default
    pub power: u8,
}

impl WifiSettings {
    /// Credentials for the default "main" slot
    pub fn main(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            name: "main".to_string(),
            ssid: ssid.into(),
            password: password.into(),
            channel: 0,
            power: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_encode_without_params() {
        let cmd = Command::get_serial();
        assert_eq!(cmd.encode(), "{\"commands\":[{\"command\":\"get_serial\"}]}\n");
    }

    #[test]
    fn test_encode_with_params() {
        let cmd = Command::pause();
        let wire = cmd.encode();
        assert!(wire.ends_with('\n'));
        let parsed: Value = serde_json::from_str(wire.trim()).unwrap();
        assert_eq!(parsed["commands"][0]["command"], "pause");
        assert_eq!(parsed["commands"][0]["data"]["pause"], true);
    }

    #[test]
    fn test_set_wifi_params() {
        let cmd = Command::set_wifi(&WifiSettings::main("lab", "hunter2"));
        let parsed: Value = serde_json::from_str(cmd.encode().trim()).unwrap();
        let data = &parsed["commands"][0]["data"];
        assert_eq!(data["name"], "main");
        assert_eq!(data["ssid"], "lab");
        assert_eq!(data["password"], "hunter2");
        assert_eq!(data["channel"], 0);
        assert_eq!(data["power"], 0);
    }

    #[test]
    fn test_command_kinds() {
        assert!(Command::scan_networks().is_scan());
        assert!(!Command::scan_networks().is_mode_switch());
        assert!(Command::switch_mode(DeviceMode::Uvc).is_mode_switch());
    }

    #[test]
    fn test_device_mode_round_trip() {
        for mode in [DeviceMode::Wifi, DeviceMode::Uvc, DeviceMode::Auto] {
            assert_eq!(DeviceMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(DeviceMode::parse("WIFI"), Some(DeviceMode::Wifi));
        assert_eq!(DeviceMode::parse("bogus"), None);
    }

    #[test]
    fn test_timeout_override() {
        let cmd = Command::get_wifi_status().timeout_ms(500);
        assert_eq!(cmd.timeout, Duration::from_millis(500));
    }
}
