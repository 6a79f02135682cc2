// src/io/canhacker/config.rs
//
// Bus configuration: serde/TOML-loadable, with a builder for programmatic use.
// `validate` turns it into the resolved settings the construction routine
// consumes (port and baud split, bit timing chosen, channel checked).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::codec::AdapterChannel;
use super::device::{find_bitrate_code, ChannelMode, DEFAULT_RESPONSE_TIMEOUT};
use super::transport::{
    TransportOptions, DEFAULT_CONTROL_QUEUE_CAPACITY, DEFAULT_MESSAGE_QUEUE_CAPACITY,
};
use crate::io::error::IoError;
use crate::io::serial::{SerialLineSettings, SerialPortOptions};

const CAN_SFF_MASK: u32 = 0x0000_07FF;
const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

// ============================================================================
// Filters
// ============================================================================

/// Hardware acceptance filter: a frame passes when `id & can_mask == can_id & can_mask`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFilter {
    pub can_id: u32,
    pub can_mask: u32,
    #[serde(default)]
    pub extended: bool,
}

impl CanFilter {
    pub fn new(can_id: u32, can_mask: u32) -> Self {
        Self {
            can_id,
            can_mask,
            extended: false,
        }
    }

    pub fn new_extended(can_id: u32, can_mask: u32) -> Self {
        Self {
            extended: true,
            ..Self::new(can_id, can_mask)
        }
    }

    /// Parse `ID:MASK` or `ID:MASK:x` (hex, optional 0x prefix).
    pub fn parse(spec: &str) -> Result<Self, IoError> {
        let parts: Vec<&str> = spec.split(':').collect();
        let (id, mask, extended) = match parts.as_slice() {
            [id, mask] => (*id, *mask, false),
            [id, mask, "x"] | [id, mask, "X"] => (*id, *mask, true),
            _ => {
                return Err(IoError::configuration(format!(
                    "Invalid filter '{}'. Expected ID:MASK or ID:MASK:x",
                    spec
                )))
            }
        };
        let filter = Self {
            can_id: parse_hex(id)?,
            can_mask: parse_hex(mask)?,
            extended,
        };
        filter.check()?;
        Ok(filter)
    }

    fn check(&self) -> Result<(), IoError> {
        let limit = if self.extended { CAN_EFF_MASK } else { CAN_SFF_MASK };
        if self.can_id & !limit != 0 || self.can_mask & !limit != 0 {
            return Err(IoError::configuration(format!(
                "filter 0x{:X}/0x{:X} exceeds the {} identifier range",
                self.can_id,
                self.can_mask,
                if self.extended { "29-bit" } else { "11-bit" }
            )));
        }
        Ok(())
    }
}

fn parse_hex(text: &str) -> Result<u32, IoError> {
    let digits = text
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u32::from_str_radix(digits, 16)
        .map_err(|_| IoError::configuration(format!("Invalid hex value '{}'", text)))
}

// ============================================================================
// Configuration
// ============================================================================

fn default_tty_baudrate() -> u32 { 115_200 }
fn default_timeout_ms() -> u64 { 1 }
fn default_response_timeout_ms() -> u64 { DEFAULT_RESPONSE_TIMEOUT.as_millis() as u64 }
fn default_can_channel() -> u8 { 1 }
fn default_control_queue_capacity() -> usize { DEFAULT_CONTROL_QUEUE_CAPACITY }
fn default_message_queue_capacity() -> usize { DEFAULT_MESSAGE_QUEUE_CAPACITY }

/// CanHacker bus configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanHackerConfig {
    /// Serial port, optionally suffixed with `@<baud>` (e.g. `/dev/ttyACM0@921600`)
    pub channel: String,
    /// Serial baud rate when `channel` has no `@<baud>` suffix
    #[serde(default = "default_tty_baudrate")]
    pub tty_baudrate: u32,
    /// CAN bitrate in bit/s. Mutually exclusive with `btr`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
    /// Raw bit timing register value. Mutually exclusive with `bitrate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub btr: Option<String>,
    #[serde(default)]
    pub mode: ChannelMode,
    /// RTS/CTS hardware handshake
    #[serde(default)]
    pub rtscts: bool,
    /// Serial read timeout of the background reader
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Wait for a control reply
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Pause after opening the port, for adapters that reset on DTR
    #[serde(default)]
    pub sleep_after_open_ms: u64,
    /// Adapter CAN channel (1-7)
    #[serde(default = "default_can_channel")]
    pub can_channel: u8,
    #[serde(default = "default_control_queue_capacity")]
    pub control_queue_capacity: usize,
    #[serde(default = "default_message_queue_capacity")]
    pub message_queue_capacity: usize,
    #[serde(default)]
    pub serial: SerialLineSettings,
    /// Acceptance filters, programmed at indices 0..n-1
    #[serde(default)]
    pub filters: Vec<CanFilter>,
}

/// How the CAN bit timing is chosen at construction
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusTiming {
    /// Leave the adapter's current timing
    Default,
    Bitrate(u32),
    Register(String),
}

/// Configuration after validation
#[derive(Clone, Debug)]
pub struct ValidatedConfig {
    pub port: String,
    pub baud_rate: u32,
    pub timing: BusTiming,
    pub mode: ChannelMode,
    pub rtscts: bool,
    pub read_timeout: Duration,
    pub response_timeout: Duration,
    pub sleep_after_open: Duration,
    pub channel: AdapterChannel,
    pub transport: TransportOptions,
    pub line: SerialLineSettings,
    pub filters: Vec<CanFilter>,
}

impl ValidatedConfig {
    pub fn serial_options(&self) -> SerialPortOptions {
        SerialPortOptions {
            port: self.port.clone(),
            baud_rate: self.baud_rate,
            rtscts: self.rtscts,
            timeout: self.read_timeout,
            line: self.line.clone(),
        }
    }
}

impl CanHackerConfig {
    /// Defaults for everything but the port.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            tty_baudrate: default_tty_baudrate(),
            bitrate: None,
            btr: None,
            mode: ChannelMode::default(),
            rtscts: false,
            timeout_ms: default_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            sleep_after_open_ms: 0,
            can_channel: default_can_channel(),
            control_queue_capacity: default_control_queue_capacity(),
            message_queue_capacity: default_message_queue_capacity(),
            serial: SerialLineSettings::default(),
            filters: Vec::new(),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, IoError> {
        toml::from_str(content).map_err(|e| IoError::configuration(format!("Failed to parse config: {}", e)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, IoError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            IoError::configuration(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, IoError> {
        toml::to_string(self).map_err(|e| IoError::configuration(format!("Failed to serialize config: {}", e)))
    }

    // ------------------------------------------------------------------------
    // Builder
    // ------------------------------------------------------------------------

    pub fn bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = Some(bitrate);
        self
    }

    pub fn btr(mut self, btr: impl Into<String>) -> Self {
        self.btr = Some(btr.into());
        self
    }

    pub fn mode(mut self, mode: ChannelMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn rtscts(mut self, rtscts: bool) -> Self {
        self.rtscts = rtscts;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn sleep_after_open(mut self, pause: Duration) -> Self {
        self.sleep_after_open_ms = pause.as_millis() as u64;
        self
    }

    pub fn can_channel(mut self, channel: u8) -> Self {
        self.can_channel = channel;
        self
    }

    pub fn filter(mut self, filter: CanFilter) -> Self {
        self.filters.push(filter);
        self
    }

    // ------------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------------

    pub fn validate(&self) -> Result<ValidatedConfig, IoError> {
        let (port, baud_rate) = parse_channel(&self.channel, self.tty_baudrate)?;

        let timing = match (self.bitrate, &self.btr) {
            (Some(_), Some(_)) => {
                return Err(IoError::configuration(
                    "bitrate and btr are mutually exclusive",
                ))
            }
            (Some(bitrate), None) => {
                find_bitrate_code(bitrate)?;
                BusTiming::Bitrate(bitrate)
            }
            (None, Some(btr)) => {
                if btr.trim().is_empty() {
                    return Err(IoError::configuration("btr must not be empty"));
                }
                BusTiming::Register(btr.trim().to_string())
            }
            (None, None) => BusTiming::Default,
        };

        if self.timeout_ms == 0 {
            return Err(IoError::configuration("timeout_ms must be at least 1"));
        }
        if self.response_timeout_ms == 0 {
            return Err(IoError::configuration("response_timeout_ms must be at least 1"));
        }
        if self.control_queue_capacity == 0 || self.message_queue_capacity == 0 {
            return Err(IoError::configuration("queue capacities must be at least 1"));
        }
        for filter in &self.filters {
            filter.check()?;
        }

        Ok(ValidatedConfig {
            port,
            baud_rate,
            timing,
            mode: self.mode,
            rtscts: self.rtscts,
            read_timeout: Duration::from_millis(self.timeout_ms),
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            sleep_after_open: Duration::from_millis(self.sleep_after_open_ms),
            channel: AdapterChannel::new(self.can_channel)?,
            transport: TransportOptions {
                control_queue_capacity: self.control_queue_capacity,
                message_queue_capacity: self.message_queue_capacity,
            },
            line: self.serial.clone(),
            filters: self.filters.clone(),
        })
    }
}

/// Split `port[@baud]`.
fn parse_channel(channel: &str, default_baud: u32) -> Result<(String, u32), IoError> {
    let channel = channel.trim();
    let (port, baud) = match channel.split_once('@') {
        Some((port, baud)) => {
            let baud = baud.trim().parse::<u32>().map_err(|_| {
                IoError::configuration(format!("Invalid baud rate '{}' in channel '{}'", baud, channel))
            })?;
            (port.trim(), baud)
        }
        None => (channel, default_baud),
    };
    if port.is_empty() {
        return Err(IoError::configuration("channel must name a serial port"));
    }
    if baud == 0 {
        return Err(IoError::configuration("baud rate must be non-zero"));
    }
    Ok((port.to_string(), baud))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CanHackerConfig::new("/dev/ttyACM0");
        let v = config.validate().unwrap();
        assert_eq!(v.port, "/dev/ttyACM0");
        assert_eq!(v.baud_rate, 115_200);
        assert_eq!(v.timing, BusTiming::Default);
        assert_eq!(v.mode, ChannelMode::Normal);
        assert_eq!(v.read_timeout, Duration::from_millis(1));
        assert_eq!(v.response_timeout, Duration::from_millis(500));
        assert_eq!(v.sleep_after_open, Duration::ZERO);
        assert_eq!(v.channel, AdapterChannel::CH1);
        assert_eq!(v.transport, TransportOptions::default());
    }

    #[test]
    fn test_channel_with_baud_suffix() {
        let v = CanHackerConfig::new("COM3@9600").validate().unwrap();
        assert_eq!(v.port, "COM3");
        assert_eq!(v.baud_rate, 9600);

        assert!(CanHackerConfig::new("COM3@fast").validate().is_err());
        assert!(CanHackerConfig::new("@9600").validate().is_err());
        assert!(CanHackerConfig::new("  ").validate().is_err());
        assert!(CanHackerConfig::new("COM3@0").validate().is_err());
    }

    #[test]
    fn test_bitrate_and_btr_are_exclusive() {
        let err = CanHackerConfig::new("COM3")
            .bitrate(500_000)
            .btr("0x001C")
            .validate()
            .unwrap_err();
        assert!(matches!(err, IoError::Configuration(_)));
        assert!(err.to_string().contains("mutually exclusive"));

        let v = CanHackerConfig::new("COM3").btr("0x001C").validate().unwrap();
        assert_eq!(v.timing, BusTiming::Register("0x001C".to_string()));
        let v = CanHackerConfig::new("COM3").bitrate(125_000).validate().unwrap();
        assert_eq!(v.timing, BusTiming::Bitrate(125_000));
    }

    #[test]
    fn test_unsupported_bitrate_rejected() {
        let err = CanHackerConfig::new("COM3").bitrate(12_345).validate().unwrap_err();
        assert!(err.to_string().contains("Valid bitrates"));
    }

    #[test]
    fn test_can_channel_range() {
        assert!(CanHackerConfig::new("COM3").can_channel(0).validate().is_err());
        assert!(CanHackerConfig::new("COM3").can_channel(8).validate().is_err());
        let v = CanHackerConfig::new("COM3").can_channel(2).validate().unwrap();
        assert_eq!(v.channel.control_flags(), 0x40);
    }

    #[test]
    fn test_from_toml() {
        let config = CanHackerConfig::from_toml_str(
            r#"
            channel = "/dev/ttyUSB0@921600"
            bitrate = 250000
            mode = "loopback"
            rtscts = true

            [serial]
            parity = "even"

            [[filters]]
            can_id = 0x123
            can_mask = 0x7FF

            [[filters]]
            can_id = 0x18DAF100
            can_mask = 0x1FFFFF00
            extended = true
            "#,
        )
        .unwrap();

        assert_eq!(config.bitrate, Some(250_000));
        assert_eq!(config.mode, ChannelMode::Loopback);
        assert_eq!(config.response_timeout_ms, 500);
        assert_eq!(config.filters.len(), 2);
        assert!(config.filters[1].extended);

        let v = config.validate().unwrap();
        assert_eq!(v.baud_rate, 921_600);
        assert!(v.rtscts);
        assert_eq!(v.serial_options().line.parity, crate::io::serial::Parity::Even);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = CanHackerConfig::new("COM7")
            .bitrate(1_000_000)
            .mode(ChannelMode::Listen)
            .filter(CanFilter::new(0x100, 0x700))
            .filter(CanFilter::new_extended(0x1234, 0xFFFF));
        let text = config.to_toml_string().unwrap();
        assert_eq!(CanHackerConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(
            CanHackerConfig::from_toml_str("bitrate = 500000"),
            Err(IoError::Configuration(_))
        ));
        assert!(CanHackerConfig::from_file("/nonexistent/canhacker.toml").is_err());
    }

    #[test]
    fn test_parse_filter() {
        assert_eq!(CanFilter::parse("123:7FF").unwrap(), CanFilter::new(0x123, 0x7FF));
        assert_eq!(
            CanFilter::parse("0x18DAF110:0x1FFFFFFF:x").unwrap(),
            CanFilter::new_extended(0x18DA_F110, 0x1FFF_FFFF)
        );
        assert!(CanFilter::parse("800:7FF").is_err());
        assert!(CanFilter::parse("123").is_err());
        assert!(CanFilter::parse("zz:7FF").is_err());
        assert!(CanFilter::parse("123:7FF:y").is_err());
    }

    #[test]
    fn test_filter_range_checked_on_validate() {
        let config = CanHackerConfig::new("COM3").filter(CanFilter::new(0x800, 0x7FF));
        assert!(config.validate().is_err());
    }
}
