//! Serial transport
//!
//! Blocking `serialport` I/O wrapped behind the async [`Transport`] trait.
//! Reads poll `bytes_to_read` so an idle port never blocks the runtime for
//! longer than the 100ms port timeout.

use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use tracing::{debug, warn};

use super::{ControlLine, Transport};
use crate::protocol::error::EngineError;

/// Largest single read from the port
const READ_CHUNK_SIZE: usize = 4096;

/// USB vendor IDs of the bridge chips commonly found on ESP32 boards
const KNOWN_BRIDGE_VIDS: [u16; 3] = [
    0x10c4, // Silicon Labs CP210x
    0x1a86, // WCH CH340
    0x303a, // Espressif native USB
];

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyACM0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,

    /// Serial number (if available)
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// Whether the port's USB bridge chip is one found on supported boards
    pub fn looks_like_board(&self) -> bool {
        self.vid.is_some_and(|vid| KNOWN_BRIDGE_VIDS.contains(&vid))
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, manufacturer, product, serial_number) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => (
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.manufacturer,
                usb_info.product,
                usb_info.serial_number,
            ),
            _ => (None, None, None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            manufacturer,
            product,
            serial_number,
        }
    }
}

/// Sort key so likely board ports list first:
///  - ttyACM* (native USB consoles), numerically by suffix
///  - then ttyUSB* (bridge chips), numerically
///  - then everything else by name
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List available serial ports in a deterministic, board-first order
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // Linux-only: some enumerators miss ACM/USB nodes, pick them up from /dev
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone()).or_insert_with(|| PortInfo {
                        name: full,
                        vid: None,
                        pid: None,
                        manufacturer: None,
                        product: None,
                        serial_number: None,
                    });
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// [`Transport`] over a physical serial port
///
/// The port handle lives behind a mutex so control-line pulses and watchdog
/// teardown can reach it while a read loop is between polls.
pub struct SerialTransport {
    port_name: String,
    inner: Mutex<Option<Box<dyn SerialPort>>>,
    connected: AtomicBool,
}

impl SerialTransport {
    /// Create a transport for the named port; nothing is opened yet
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            inner: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    /// Name of the port this transport targets
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn serial_err(e: serialport::Error) -> EngineError {
        EngineError::Transport(e.to_string())
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn connect(&self, baud_rate: u32) -> Result<(), EngineError> {
        let mut port = serialport::new(&self.port_name, baud_rate)
            // Short timeout keeps reads responsive without spinning
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(Self::serial_err)?;

        // Standard 8N1, no flow control
        port.set_data_bits(serialport::DataBits::Eight)
            .map_err(Self::serial_err)?;
        port.set_parity(serialport::Parity::None)
            .map_err(Self::serial_err)?;
        port.set_stop_bits(serialport::StopBits::One)
            .map_err(Self::serial_err)?;
        port.set_flow_control(serialport::FlowControl::None)
            .map_err(Self::serial_err)?;

        // Keep DTR/RTS asserted: opening the port toggles DTR, and a low DTR
        // holds the board in reset on common dev-board auto-program circuits.
        if let Err(e) = port.write_data_terminal_ready(true) {
            warn!(port = %self.port_name, error = %e, "failed to assert DTR");
        }
        if let Err(e) = port.write_request_to_send(true) {
            warn!(port = %self.port_name, error = %e, "failed to assert RTS");
        }

        // Drop anything queued from before we attached
        if let Err(e) = port.clear(serialport::ClearBuffer::All) {
            warn!(port = %self.port_name, error = %e, "failed to clear buffers");
        }

        *self.inner.lock().unwrap() = Some(port);
        self.connected.store(true, Ordering::SeqCst);
        debug!(port = %self.port_name, baud_rate, "serial port opened");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), EngineError> {
        let had_port = self.inner.lock().unwrap().take().is_some();
        self.connected.store(false, Ordering::SeqCst);
        if had_port {
            debug!(port = %self.port_name, "serial port closed");
        }
        Ok(())
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), EngineError> {
        let mut guard = self.inner.lock().unwrap();
        let port = guard.as_mut().ok_or(EngineError::NotConnected)?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    async fn read_chunk(&self) -> Result<Vec<u8>, EngineError> {
        let mut guard = self.inner.lock().unwrap();
        let port = guard.as_mut().ok_or(EngineError::NotConnected)?;

        let available = port.bytes_to_read().map_err(Self::serial_err)? as usize;
        if available == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; available.min(READ_CHUNK_SIZE)];
        match port.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn set_control_line(&self, line: ControlLine, level: bool) -> Result<(), EngineError> {
        let mut guard = self.inner.lock().unwrap();
        let port = guard.as_mut().ok_or(EngineError::NotConnected)?;
        match line {
            ControlLine::Dtr => port.write_data_terminal_ready(level).map_err(Self::serial_err),
            ControlLine::Rts => port.write_request_to_send(level).map_err(Self::serial_err),
        }
    }

    async fn wait_for_release(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.inner.try_lock().is_ok() {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(port = %self.port_name, "port not released before timeout");
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn is_present(&self) -> bool {
        serialport::available_ports()
            .map(|ports| ports.iter().any(|p| p.port_name == self.port_name))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_list_ports_does_not_panic() {
        let ports = list_ports();
        for port in &ports {
            println!("Found port: {} - {:?}", port.name, port.product);
        }
    }

    #[test]
    fn test_port_sorting_boards_first() {
        let names = vec![
            "/dev/ttyUSB1",
            "/dev/ttyACM1",
            "/dev/ttyUSB0",
            "/dev/ttyACM0",
            "/dev/someport",
            "/dev/ttyACM10",
        ];
        let mut ports: Vec<PortInfo> = names
            .into_iter()
            .map(|n| PortInfo {
                name: n.to_string(),
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
                serial_number: None,
            })
            .collect();

        ports.sort_by_key(|p| port_sort_key(&p.name));
        let ordered: Vec<String> = ports.into_iter().map(|p| p.name).collect();

        assert_eq!(
            ordered,
            vec![
                "/dev/ttyACM0",
                "/dev/ttyACM1",
                "/dev/ttyACM10",
                "/dev/ttyUSB0",
                "/dev/ttyUSB1",
                "/dev/someport",
            ]
        );
    }

    #[test]
    fn test_bridge_vid_detection() {
        let mut info = PortInfo {
            name: "/dev/ttyUSB0".into(),
            vid: Some(0x10c4),
            pid: Some(0xea60),
            manufacturer: None,
            product: None,
            serial_number: None,
        };
        assert!(info.looks_like_board());
        info.vid = Some(0x0403);
        assert!(!info.looks_like_board());
        info.vid = None;
        assert!(!info.looks_like_board());
    }

    #[test]
    fn test_disconnected_transport_errors() {
        let transport = SerialTransport::new("/dev/null-port");
        assert!(!transport.is_connected());
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let err = rt.block_on(transport.write(b"x")).unwrap_err();
        assert!(matches!(err, EngineError::NotConnected));
    }
}
