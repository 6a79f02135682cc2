// src/io/serial/channel.rs
//
// Byte channel abstraction over a serial device.
//
// The transport needs two handles to the same device: one owned by the
// background reader, one used by writers. `try_clone_channel` provides the
// second handle, mirroring `serialport::SerialPort::try_clone`.

use serde::Serialize;
use std::io::{Read, Write};
use std::time::Duration;

use super::utils::{flow_control, SerialLineSettings};
use crate::io::error::IoError;

// ============================================================================
// Channel Trait
// ============================================================================

/// Blocking, timeout-bounded byte channel.
pub trait SerialChannel: Send {
    /// Device label used in logs and errors.
    fn name(&self) -> &str;

    /// Read up to `buf.len()` bytes. Returns `Ok(0)` when the channel's read
    /// timeout elapses with nothing available; never blocks past it.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError>;

    /// Write the whole buffer.
    fn write_all(&mut self, data: &[u8]) -> Result<(), IoError>;

    fn flush(&mut self) -> Result<(), IoError>;

    /// Release the device. Further reads and writes fail.
    fn close(&mut self) -> Result<(), IoError>;

    /// Second handle to the same device.
    fn try_clone_channel(&self) -> Result<Box<dyn SerialChannel>, IoError>;
}

// ============================================================================
// serialport-backed Channel
// ============================================================================

/// Options for opening a serial port.
#[derive(Clone, Debug)]
pub struct SerialPortOptions {
    pub port: String,
    pub baud_rate: u32,
    /// Hardware handshake (RTS/CTS)
    pub rtscts: bool,
    /// Per-read timeout
    pub timeout: Duration,
    pub line: SerialLineSettings,
}

impl SerialPortOptions {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            rtscts: false,
            timeout: Duration::from_millis(1),
            line: SerialLineSettings::default(),
        }
    }
}

/// Serial channel backed by the `serialport` crate.
pub struct SerialPortChannel {
    name: String,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialPortChannel {
    /// Open the port described by `options`.
    pub fn open(options: &SerialPortOptions) -> Result<Self, IoError> {
        let name = format!("canhacker({})", options.port);
        let port = serialport::new(&options.port, options.baud_rate)
            .data_bits(options.line.serialport_data_bits())
            .stop_bits(options.line.serialport_stop_bits())
            .parity(options.line.serialport_parity())
            .flow_control(flow_control(options.rtscts))
            .timeout(options.timeout)
            .open()
            .map_err(|e| IoError::connection(&name, e.to_string()))?;

        tracing::debug!(
            port = %options.port,
            baud = options.baud_rate,
            rtscts = options.rtscts,
            parity = ?options.line.parity,
            "serial port opened"
        );

        Ok(Self {
            name,
            port: Some(port),
        })
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>, IoError> {
        let name = &self.name;
        self.port
            .as_mut()
            .ok_or_else(|| IoError::connection(name, "port is closed"))
    }
}

impl SerialChannel for SerialPortChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        let name = self.name.clone();
        match self.port_mut()?.read(buf) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(IoError::read(name, e.to_string())),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), IoError> {
        let name = self.name.clone();
        self.port_mut()?
            .write_all(data)
            .map_err(|e| IoError::write(name, e.to_string()))
    }

    fn flush(&mut self) -> Result<(), IoError> {
        let name = self.name.clone();
        self.port_mut()?
            .flush()
            .map_err(|e| IoError::write(name, e.to_string()))
    }

    fn close(&mut self) -> Result<(), IoError> {
        // Dropping the handle releases the device.
        self.port = None;
        Ok(())
    }

    fn try_clone_channel(&self) -> Result<Box<dyn SerialChannel>, IoError> {
        let port = self
            .port
            .as_ref()
            .ok_or_else(|| IoError::connection(&self.name, "port is closed"))?;
        let clone = port
            .try_clone()
            .map_err(|e| IoError::connection(&self.name, e.to_string()))?;
        Ok(Box::new(SerialPortChannel {
            name: self.name.clone(),
            port: Some(clone),
        }))
    }
}

// ============================================================================
// Port Enumeration
// ============================================================================

/// Information about an available serial port
#[derive(Clone, Debug, Serialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

/// List serial ports the adapter could be attached to.
pub fn list_serial_ports() -> Result<Vec<SerialPortInfo>, IoError> {
    let ports = serialport::available_ports()
        .map_err(|e| IoError::connection("serial", format!("failed to enumerate ports: {}", e)))?;

    Ok(ports
        .into_iter()
        // On macOS only the calling-unit devices (/dev/cu.*) are usable
        .filter(|_p| {
            #[cfg(target_os = "macos")]
            {
                !_p.port_name.starts_with("/dev/tty.")
            }
            #[cfg(not(target_os = "macos"))]
            {
                true
            }
        })
        .map(|p| {
            let (port_type, manufacturer, product, serial_number, vid, pid) = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => (
                    "USB".to_string(),
                    info.manufacturer,
                    info.product,
                    info.serial_number,
                    Some(info.vid),
                    Some(info.pid),
                ),
                serialport::SerialPortType::BluetoothPort => {
                    ("Bluetooth".to_string(), None, None, None, None, None)
                }
                serialport::SerialPortType::PciPort => {
                    ("PCI".to_string(), None, None, None, None, None)
                }
                serialport::SerialPortType::Unknown => {
                    ("Unknown".to_string(), None, None, None, None, None)
                }
            };
            SerialPortInfo {
                port_name: p.port_name,
                port_type,
                manufacturer,
                product,
                serial_number,
                vid,
                pid,
            }
        })
        .collect())
}
