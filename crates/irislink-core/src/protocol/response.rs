//! Response classification
//!
//! Decides whether a frame pulled out of the stream is the reply to the
//! command currently in flight, noise to skip, or a device error. Also owns
//! the unwrapping of the firmware's double-encoded result payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::commands::Command;
use super::frame::Frame;

/// A classified reply from the device
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Generic `results` array
    Results(Vec<ResultEntry>),
    /// Device reported an error
    ErrorResult(String),
    /// Networks discovered by a scan
    Networks(Vec<NetworkInfo>),
    /// A frame accepted as-is (mode-switch acknowledgements)
    Raw(Value),
}

/// Outcome of classifying one frame against the in-flight command
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// This frame is the response
    Accepted(Response),
    /// Not a match; keep waiting
    Continue,
}

/// One entry of a `results` array
///
/// The firmware double-encodes payloads: an entry may be a raw value or a
/// string that itself contains JSON, and the object inside may carry the
/// actual payload under a `result` key, again possibly string-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry(pub Value);

impl ResultEntry {
    /// One level of re-parse: a string entry that holds JSON becomes that JSON
    pub fn decoded(&self) -> Value {
        reparse(self.0.clone())
    }

    /// Fully unwrapped payload: decode the entry, unwrap a `result` field if
    /// present, and re-parse once more if that inner value is a JSON string.
    pub fn payload(&self) -> Value {
        let mut value = self.decoded();
        if let Some(inner) = value.get("result") {
            value = reparse(inner.clone());
        }
        value
    }
}

/// If `value` is a string containing JSON, parse it; otherwise keep it
fn reparse(value: Value) -> Value {
    if let Value::String(s) = &value {
        if let Ok(parsed) = serde_json::from_str::<Value>(s) {
            return parsed;
        }
    }
    value
}

/// One WiFi network found by `scan_networks`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// SSID; empty for hidden networks
    #[serde(default)]
    pub ssid: String,
    /// Signal strength in dBm
    #[serde(default)]
    pub rssi: i32,
    /// Channel number
    #[serde(default)]
    pub channel: i32,
    /// Authentication mode; 0 means open
    #[serde(default)]
    pub auth_mode: i32,
    /// BSSID, when the firmware reports it
    #[serde(default)]
    pub mac_address: Option<String>,
}

impl NetworkInfo {
    /// Whether the network requires no password
    pub fn is_open(&self) -> bool {
        self.auth_mode == 0
    }
}

/// Classify a frame against the command awaiting a reply
pub fn classify(frame: &Frame, command: &Command) -> Classification {
    if command.is_scan() {
        // Only a non-empty networks array is final; an empty one may just
        // mean the scan is still running. The grace window for accepting
        // "no networks" lives in the dispatcher.
        if let Some(networks) = find_networks(frame) {
            if !networks.is_empty() {
                return Classification::Accepted(Response::Networks(networks));
            }
        }
        return Classification::Continue;
    }

    if let Some(err) = frame.get("error") {
        if !err.is_null() {
            let message = err
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            return Classification::Accepted(Response::ErrorResult(message));
        }
    }

    if command.is_mode_switch() {
        // Mode-switch acks arrive promptly and carry no payload worth
        // unwrapping; accept the first enveloped frame as-is.
        if frame.get("results").is_some() {
            return Classification::Accepted(Response::Raw(frame.clone()));
        }
        return Classification::Continue;
    }

    if let Some(entries) = frame.get("results").and_then(Value::as_array) {
        let entries = entries.iter().cloned().map(ResultEntry).collect();
        return Classification::Accepted(Response::Results(entries));
    }

    Classification::Continue
}

/// Whether a frame looks like a generic command acknowledgement
///
/// Used by the dispatcher to start the scan grace window when the device
/// reports scan completion without having emitted a networks block yet.
pub fn is_generic_ack(frame: &Frame) -> bool {
    frame.get("results").is_some() || frame.get("error").is_some()
}

/// Search a frame for a `networks` array, looking through the
/// `result`/`results` wrappers with one level of string re-parse each.
pub fn find_networks(frame: &Value) -> Option<Vec<NetworkInfo>> {
    fn walk(value: &Value) -> Option<Vec<NetworkInfo>> {
        if let Some(arr) = value.get("networks").and_then(Value::as_array) {
            let networks = arr
                .iter()
                .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
                .collect();
            return Some(networks);
        }
        if let Some(inner) = value.get("result") {
            if let Some(found) = walk(&reparse(inner.clone())) {
                return Some(found);
            }
        }
        if let Some(entries) = value.get("results").and_then(Value::as_array) {
            for entry in entries {
                if let Some(found) = walk(&reparse(entry.clone())) {
                    return Some(found);
                }
            }
        }
        None
    }
    walk(frame)
}
