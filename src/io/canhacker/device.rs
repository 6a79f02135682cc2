// src/io/canhacker/device.rs
//
// CanHacker device controller: synchronous request/response on top of the
// transport, plus the session state machine.
//
// Every control request waits for exactly one control frame. The reply must
// carry the same command with the answer bit set; anything else fails the
// operation. Nothing is retried.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::codec::{
    self, command, config_item, encode_message_body, filter_type, AdapterChannel, Direction,
    Frame, FrameEncoder, FramePayload, HardwareInfo, SYNC_FRAME,
};
use super::config::CanFilter;
use super::transport::{DroppedFrames, Transport};
use crate::io::error::IoError;
use crate::io::CanFrame;

// ============================================================================
// Constants
// ============================================================================

/// Default wait for a control reply
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Supported CAN bitrates and their CHANNEL_CONFIG codes
const CANHACKER_BITRATES: [(u32, u8); 14] = [
    (10_000, 0x00),
    (20_000, 0x01),
    (33_300, 0x02),
    (50_000, 0x03),
    (62_500, 0x04),
    (83_300, 0x05),
    (95_000, 0x06),
    (100_000, 0x07),
    (125_000, 0x08),
    (250_000, 0x09),
    (400_000, 0x0A),
    (500_000, 0x0B),
    (800_000, 0x0C),
    (1_000_000, 0x0D),
];

/// Look up the CHANNEL_CONFIG code for a bitrate.
pub fn find_bitrate_code(bitrate: u32) -> Result<u8, IoError> {
    CANHACKER_BITRATES
        .iter()
        .find(|(rate, _)| *rate == bitrate)
        .map(|(_, code)| *code)
        .ok_or_else(|| {
            let valid: Vec<String> = CANHACKER_BITRATES.iter().map(|(r, _)| format!("{}", r)).collect();
            IoError::configuration(format!(
                "Invalid CAN bitrate {}. Valid bitrates: {}",
                bitrate,
                valid.join(", ")
            ))
        })
}

/// Supported bitrates, ascending.
pub fn supported_bitrates() -> Vec<u32> {
    CANHACKER_BITRATES.iter().map(|(r, _)| *r).collect()
}

// ============================================================================
// Types
// ============================================================================

/// Operating mode of the adapter's CAN controller
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    #[default]
    Normal,
    /// Receive only, no ACKs
    #[serde(alias = "listen-only", alias = "silent")]
    Listen,
    Loopback,
}

impl ChannelMode {
    /// CHANNEL_CONFIG mode payload byte
    pub fn code(self) -> u8 {
        match self {
            ChannelMode::Normal => 0x00,
            ChannelMode::Listen => 0x01,
            ChannelMode::Loopback => 0x02,
        }
    }
}

impl fmt::Display for ChannelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelMode::Normal => "normal",
            ChannelMode::Listen => "listen",
            ChannelMode::Loopback => "loopback",
        };
        f.write_str(name)
    }
}

impl FromStr for ChannelMode {
    type Err = IoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(ChannelMode::Normal),
            "listen" | "listen-only" | "silent" => Ok(ChannelMode::Listen),
            "loopback" => Ok(ChannelMode::Loopback),
            other => Err(IoError::configuration(format!(
                "Invalid mode '{}'. Valid modes: normal, listen, loopback",
                other
            ))),
        }
    }
}

/// Session lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Unsynced,
    Synced,
    DeviceOpen,
    /// Bitrate and/or mode programmed
    Configured,
    ChannelOpen,
    /// Filters applied, traffic flowing
    Running,
    ChannelClosed,
    PortClosed,
}

impl SessionState {
    /// Device is open and may be configured (filters, bitrate, mode).
    fn device_is_open(self) -> bool {
        matches!(
            self,
            SessionState::DeviceOpen
                | SessionState::Configured
                | SessionState::ChannelOpen
                | SessionState::Running
                | SessionState::ChannelClosed
        )
    }
}

// ============================================================================
// Device Controller
// ============================================================================

pub struct DeviceController {
    transport: Transport,
    encoder: FrameEncoder,
    channel: AdapterChannel,
    response_timeout: Duration,
    state: SessionState,
    hardware: Option<HardwareInfo>,
}

impl DeviceController {
    pub fn new(transport: Transport, channel: AdapterChannel, response_timeout: Duration) -> Self {
        Self {
            transport,
            encoder: FrameEncoder::new(),
            channel,
            response_timeout,
            state: SessionState::Unsynced,
            hardware: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn channel(&self) -> AdapterChannel {
        self.channel
    }

    pub fn device(&self) -> &str {
        self.transport.device()
    }

    /// Hardware reported by the last successful `query_hardware`.
    pub fn hardware(&self) -> Option<&HardwareInfo> {
        self.hardware.as_ref()
    }

    pub fn dropped_frames(&self) -> DroppedFrames {
        self.transport.dropped_frames()
    }

    // ------------------------------------------------------------------------
    // Request/response plumbing
    // ------------------------------------------------------------------------

    fn require(&self, allowed: &[SessionState], operation: &str) -> Result<(), IoError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(IoError::invalid_state(
                self.device(),
                format!("{} not allowed in state {:?}", operation, self.state),
            ))
        }
    }

    fn require_device_open(&self, operation: &str) -> Result<(), IoError> {
        if self.state.device_is_open() {
            Ok(())
        } else {
            Err(IoError::invalid_state(
                self.device(),
                format!("{} requires an open device (state {:?})", operation, self.state),
            ))
        }
    }

    /// Wait for the next control frame.
    fn read_reply(&self, operation: &str) -> Result<Frame, IoError> {
        match self.transport.read_control(Some(self.response_timeout)) {
            Some(raw) => codec::decode(Direction::Rx, raw.bytes()),
            None if !self.transport.reader_running() => {
                Err(IoError::read(self.device(), "reader stopped"))
            }
            None => Err(IoError::timeout(self.device(), operation)),
        }
    }

    /// Send one control command and require a positive answer to it.
    fn request(&self, cmd: u8, flags: u8, payload: &[u8]) -> Result<Frame, IoError> {
        let raw = self.encoder.encode(cmd, flags as u16, payload)?;
        self.transport.write(&raw)?;

        let name = command::name(cmd);
        let reply = self.read_reply(name)?;
        if reply.command() != cmd {
            return Err(IoError::protocol(
                self.device(),
                format!(
                    "{} answered with {} (0x{:02X})",
                    name,
                    command::name(reply.command()),
                    reply.command()
                ),
            ));
        }
        if !reply.is_positive_answer() {
            return Err(IoError::protocol(self.device(), format!("{} rejected by adapter", name)));
        }
        Ok(reply)
    }

    fn reply_text(&self, reply: Frame, operation: &str) -> Result<String, IoError> {
        match reply.payload {
            FramePayload::Text(text) => Ok(text),
            other => Err(IoError::protocol(
                self.device(),
                format!("{} returned unexpected payload {:?}", operation, other),
            )),
        }
    }

    // ------------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------------

    /// Sync handshake. Resets the sequence counter on success.
    pub fn sync(&mut self) -> Result<(), IoError> {
        self.require(&[SessionState::Unsynced, SessionState::Synced], "sync")?;
        self.encoder.reset_sequence();
        self.transport.write(&SYNC_FRAME)?;

        let reply = self.read_reply("SYNC")?;
        if reply.command() != command::SYNC_ANSWER || !reply.is_sync_ok() {
            return Err(IoError::protocol(
                self.device(),
                format!("bad sync answer {} (0x{:02X})", command::name(reply.command()), reply.command()),
            ));
        }
        self.encoder.reset_sequence();
        self.state = SessionState::Synced;
        tracing::debug!(device = %self.device(), "synced");
        Ok(())
    }

    pub fn device_open(&mut self) -> Result<(), IoError> {
        self.require(&[SessionState::Synced], "device open")?;
        self.request(command::DEVICE_OPEN, 0, &[])?;
        self.state = SessionState::DeviceOpen;
        tracing::debug!(device = %self.device(), "device open");
        Ok(())
    }

    pub fn device_close(&mut self) -> Result<(), IoError> {
        self.require(
            &[
                SessionState::DeviceOpen,
                SessionState::Configured,
                SessionState::ChannelClosed,
            ],
            "device close",
        )?;
        self.request(command::DEVICE_CLOSE, 0, &[])?;
        self.state = SessionState::Synced;
        tracing::debug!(device = %self.device(), "device closed");
        Ok(())
    }

    pub fn set_bitrate(&mut self, bitrate: u32) -> Result<(), IoError> {
        let code = find_bitrate_code(bitrate)?;
        self.require(&[SessionState::DeviceOpen, SessionState::Configured], "set bitrate")?;
        self.request(
            command::CHANNEL_CONFIG,
            self.channel.control_flags() | config_item::BUS_SPEED,
            &[code],
        )?;
        self.state = SessionState::Configured;
        tracing::info!(device = %self.device(), bitrate, "bitrate set");
        Ok(())
    }

    /// Raw bit-timing register programming is not supported by this driver.
    pub fn set_bitrate_from_register(&mut self, btr: &str) -> Result<(), IoError> {
        Err(IoError::unimplemented(format!(
            "bit timing register configuration (btr={})",
            btr
        )))
    }

    pub fn set_mode(&mut self, mode: ChannelMode) -> Result<(), IoError> {
        self.require(&[SessionState::DeviceOpen, SessionState::Configured], "set mode")?;
        self.request(
            command::CHANNEL_CONFIG,
            self.channel.control_flags() | config_item::MODE,
            &[mode.code()],
        )?;
        self.state = SessionState::Configured;
        tracing::debug!(device = %self.device(), %mode, "mode set");
        Ok(())
    }

    pub fn channel_open(&mut self) -> Result<(), IoError> {
        self.require(
            &[
                SessionState::DeviceOpen,
                SessionState::Configured,
                SessionState::ChannelClosed,
            ],
            "channel open",
        )?;
        self.request(command::CHANNEL_OPEN, self.channel.control_flags(), &[])?;
        self.state = SessionState::ChannelOpen;
        tracing::debug!(device = %self.device(), channel = self.channel.number(), "channel open");
        Ok(())
    }

    pub fn channel_close(&mut self) -> Result<(), IoError> {
        self.require(&[SessionState::ChannelOpen, SessionState::Running], "channel close")?;
        self.request(command::CHANNEL_CLOSE, self.channel.control_flags(), &[])?;
        self.state = SessionState::ChannelClosed;
        tracing::debug!(device = %self.device(), channel = self.channel.number(), "channel closed");
        Ok(())
    }

    /// Program one hardware acceptance filter.
    pub fn set_filter(&mut self, index: u32, filter: &CanFilter) -> Result<(), IoError> {
        self.require_device_open("set filter")?;
        let kind = if filter.extended {
            filter_type::EXTENDED_29BIT
        } else {
            filter_type::STANDARD_11BIT
        };

        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&index.to_le_bytes());
        payload.extend_from_slice(&kind.to_le_bytes());
        payload.extend_from_slice(&filter.can_id.to_le_bytes());
        payload.extend_from_slice(&filter.can_mask.to_le_bytes());
        self.request(command::FILTER_SET, self.channel.control_flags(), &payload)?;

        tracing::debug!(
            device = %self.device(),
            index,
            id = format_args!("0x{:X}", filter.can_id),
            mask = format_args!("0x{:X}", filter.can_mask),
            extended = filter.extended,
            "filter set"
        );
        Ok(())
    }

    /// Program `filters` at indices 0..n-1, stopping at the first failure.
    pub fn apply_filters(&mut self, filters: &[CanFilter]) -> Result<(), IoError> {
        self.require_device_open("apply filters")?;
        for (index, filter) in filters.iter().enumerate() {
            self.set_filter(index as u32, filter)?;
        }
        Ok(())
    }

    /// Channel open and configured: accept traffic.
    pub fn start(&mut self) -> Result<(), IoError> {
        self.require(&[SessionState::ChannelOpen], "start")?;
        self.state = SessionState::Running;
        tracing::info!(device = %self.device(), channel = self.channel.number(), "session running");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Device queries
    // ------------------------------------------------------------------------

    fn require_synced(&self, operation: &str) -> Result<(), IoError> {
        match self.state {
            SessionState::Unsynced | SessionState::PortClosed => Err(IoError::invalid_state(
                self.device(),
                format!("{} not allowed in state {:?}", operation, self.state),
            )),
            _ => Ok(()),
        }
    }

    pub fn query_hardware(&mut self) -> Result<HardwareInfo, IoError> {
        self.require_synced("hardware query")?;
        let reply = self.request(command::DEVICE_HW, 0, &[])?;
        match reply.payload {
            FramePayload::Hardware(info) => {
                tracing::info!(device = %self.device(), hw_id = info.id, "{}", info.name);
                self.hardware = Some(info.clone());
                Ok(info)
            }
            other => Err(IoError::protocol(
                self.device(),
                format!("DEVICE_HW returned unexpected payload {:?}", other),
            )),
        }
    }

    pub fn query_device_info(&mut self) -> Result<String, IoError> {
        self.require_synced("device info query")?;
        let reply = self.request(command::DEVICE_INFO, 0, &[])?;
        self.reply_text(reply, "DEVICE_INFO")
    }

    pub fn query_firmware(&mut self) -> Result<String, IoError> {
        self.require_synced("firmware query")?;
        let reply = self.request(command::DEVICE_FIRMWARE, 0, &[])?;
        self.reply_text(reply, "DEVICE_FIRMWARE")
    }

    pub fn query_serial_number(&mut self) -> Result<String, IoError> {
        self.require_synced("serial number query")?;
        let reply = self.request(command::DEVICE_SERIAL, 0, &[])?;
        self.reply_text(reply, "DEVICE_SERIAL")
    }

    // ------------------------------------------------------------------------
    // Traffic
    // ------------------------------------------------------------------------

    /// Queue one CAN frame for transmission. No answer is awaited.
    pub fn send_message(&self, frame: &CanFrame) -> Result<(), IoError> {
        self.require(&[SessionState::Running], "send")?;
        let body = encode_message_body(frame)?;
        let raw = self
            .encoder
            .encode(command::MESSAGE, self.channel.message_flags(), &body)?;
        self.transport.write(&raw)
    }

    /// Next received CAN frame, or `None` when `timeout` elapses.
    ///
    /// Frames with a DLC/data mismatch are returned with `is_error` set.
    pub fn next_message(&self, timeout: Option<Duration>) -> Result<Option<CanFrame>, IoError> {
        if self.state == SessionState::PortClosed {
            return Err(IoError::invalid_state(self.device(), "receive after shutdown"));
        }
        let raw = match self.transport.read_message(timeout) {
            Some(raw) => raw,
            None if !self.transport.reader_running() => {
                return Err(IoError::read(self.device(), "reader stopped"));
            }
            None => return Ok(None),
        };
        let frame = codec::decode(Direction::Rx, raw.bytes())?;
        Ok(frame.into_can_frame())
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Close the channel if open, then the port. Best-effort and idempotent:
    /// a failed channel close is logged and the port is closed anyway.
    pub fn shutdown(&mut self) -> Result<(), IoError> {
        if self.state == SessionState::PortClosed {
            return Ok(());
        }
        if matches!(self.state, SessionState::ChannelOpen | SessionState::Running) {
            if let Err(e) = self.channel_close() {
                tracing::warn!(device = %self.device(), error = %e, "channel close failed");
                self.state = SessionState::ChannelClosed;
            }
        }
        self.abort()
    }

    /// Close the port without any protocol exchange.
    pub fn abort(&mut self) -> Result<(), IoError> {
        self.state = SessionState::PortClosed;
        let result = self.transport.close_port();
        tracing::debug!(device = %self.device(), "port closed");
        result
    }
}

// ============================================================================
// Tests
// ============================================================================
