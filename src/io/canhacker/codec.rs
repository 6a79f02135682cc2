// src/io/canhacker/codec.rs
//
// CanHacker binary protocol codec.
//
// Control frame (4-byte header):
//   [Command][Sequence][Flags][Length][Payload: Length bytes]
//
// Message frame (6-byte header, command 0x40):
//   [0x40][Sequence][Flags-2bytes-LE][Length-2bytes-LE][Payload: Length bytes]
//
// Sync handshake (fixed, no length field):
//   host -> device: [A5 00 A5 00]    device -> host: [5A 00 5A 00]
//
// Responses set bit 7 of the command byte when the request succeeded.
//
// Message payload, device -> host (18-byte prefix):
//   [Flags-4][Timestamp-4][Reserved-4][FrameID-4][DLC-2][Data...]
// Message payload, host -> device (10-byte prefix):
//   [Flags-4][FrameID-4][DLC-2][Data...]

use std::sync::atomic::{AtomicU8, Ordering};

use crate::io::error::IoError;
use crate::io::{hex_dump, CanFrame};

const DEVICE: &str = "canhacker";

// ============================================================================
// Constants
// ============================================================================

/// Command codes
pub mod command {
    pub const DEVICE_INFO: u8 = 0x01;
    pub const DEVICE_FIRMWARE: u8 = 0x02;
    pub const DEVICE_SERIAL: u8 = 0x03;
    pub const DEVICE_MODE: u8 = 0x04;
    pub const DEVICE_HW: u8 = 0x05;
    pub const DEVICE_OPEN: u8 = 0x08;
    pub const DEVICE_CLOSE: u8 = 0x09;
    pub const DEVICE_STAT: u8 = 0x0A;
    pub const CHANNEL_CONFIG: u8 = 0x11;
    pub const CHANNEL_OPEN: u8 = 0x18;
    pub const CHANNEL_CLOSE: u8 = 0x19;
    pub const CHANNEL_RESET: u8 = 0x1F;
    pub const FILTER_SET: u8 = 0x21;
    pub const FILTER_CLEAR: u8 = 0x22;
    pub const GATEWAY_ON: u8 = 0x31;
    pub const GATEWAY_OFF: u8 = 0x32;
    pub const GATEWAY_FILTER_SET: u8 = 0x33;
    pub const GATEWAY_FILTER_CLEAR: u8 = 0x34;
    pub const GATEWAY_ALL_CLEAR: u8 = 0x35;
    pub const MESSAGE: u8 = 0x40;
    pub const BUS_ERROR: u8 = 0x48;
    pub const SLAVE_LIN_RESPONSE_SET: u8 = 0x4A;
    pub const SLAVE_LIN_RESPONSE_MODE: u8 = 0x4B;
    pub const SYNC: u8 = 0xA5;
    pub const SYNC_ANSWER: u8 = 0x5A;
    pub const COMMAND_ERROR: u8 = 0xFF;

    /// Mnemonic for logs and error messages.
    pub fn name(command: u8) -> &'static str {
        match command {
            DEVICE_INFO => "DEVICE_INFO",
            DEVICE_FIRMWARE => "DEVICE_FIRMWARE",
            DEVICE_SERIAL => "DEVICE_SERIAL",
            DEVICE_MODE => "DEVICE_MODE",
            DEVICE_HW => "DEVICE_HW",
            DEVICE_OPEN => "DEVICE_OPEN",
            DEVICE_CLOSE => "DEVICE_CLOSE",
            DEVICE_STAT => "DEVICE_STAT",
            CHANNEL_CONFIG => "CHANNEL_CONFIG",
            CHANNEL_OPEN => "CHANNEL_OPEN",
            CHANNEL_CLOSE => "CHANNEL_CLOSE",
            CHANNEL_RESET => "CHANNEL_RESET",
            FILTER_SET => "FILTER_SET",
            FILTER_CLEAR => "FILTER_CLEAR",
            GATEWAY_ON => "GATEWAY_ON",
            GATEWAY_OFF => "GATEWAY_OFF",
            GATEWAY_FILTER_SET => "GATEWAY_FILTER_SET",
            GATEWAY_FILTER_CLEAR => "GATEWAY_FILTER_CLEAR",
            GATEWAY_ALL_CLEAR => "GATEWAY_ALL_CLEAR",
            MESSAGE => "MESSAGE",
            BUS_ERROR => "BUS_ERROR",
            SLAVE_LIN_RESPONSE_SET => "SLAVE_LIN_RESPONSE_SET",
            SLAVE_LIN_RESPONSE_MODE => "SLAVE_LIN_RESPONSE_MODE",
            SYNC => "SYNC",
            SYNC_ANSWER => "SYNC_ANSWER",
            COMMAND_ERROR => "COMMAND_ERROR",
            _ => "UNKNOWN",
        }
    }
}

/// CHANNEL_CONFIG item selectors (low bits of the flags byte)
pub mod config_item {
    pub const BUS_SPEED: u8 = 0x00;
    pub const BUS_SPEED_FD: u8 = 0x01;
    pub const BUS_SPEED_M: u8 = 0x02;
    pub const BUS_SPEED_FD_M: u8 = 0x03;
    pub const TERMINATOR: u8 = 0x05;
    pub const PULL_UP: u8 = 0x06;
    pub const CRC_MODE: u8 = 0x07;
    pub const IDLE_DELAY: u8 = 0x08;
    pub const MODE: u8 = 0x09;
    pub const CAN_FRAME: u8 = 0x0A;
}

/// Bits of the 32-bit flag word inside a message payload
pub mod message_flags {
    /// 29-bit identifier
    pub const EXTID: u32 = 0x0000_0001;
    /// Remote frame
    pub const RTR: u32 = 0x0000_0002;
    /// CAN-FD frame
    pub const FDF: u32 = 0x0000_0004;
    /// CAN-FD bit rate switch
    pub const BRS: u32 = 0x0000_0008;
    /// CAN-FD error state indicator
    pub const ESI: u32 = 0x0000_0010;
    pub const BLOCK_TX: u32 = 0x3000_0000;
    /// Header flag asking the adapter to confirm a transmitted message
    pub const CONFIRM_REQUIRED: u16 = 0x0001;
}

/// Filter type field of FILTER_SET
pub mod filter_type {
    pub const STANDARD_11BIT: u32 = 0x00;
    pub const EXTENDED_29BIT: u32 = 0x01;
}

/// Bit 7 of a response command byte: request succeeded
pub const ANSWER_BIT: u8 = 0x80;
/// Header length of every frame except MESSAGE
pub const CONTROL_HEADER_LEN: usize = 4;
/// Header length of MESSAGE frames
pub const MESSAGE_HEADER_LEN: usize = 6;
/// Sync request, fixed
pub const SYNC_FRAME: [u8; 4] = [command::SYNC, 0x00, command::SYNC, 0x00];
/// Canonical sync answer
pub const SYNC_ANSWER_FRAME: [u8; 4] = [command::SYNC_ANSWER, 0x00, command::SYNC_ANSWER, 0x00];
/// Fixed prefix of a received message payload
pub const RX_MESSAGE_PREFIX_LEN: usize = 4 + 4 + 4 + 4 + 2;
/// Fixed prefix of a transmitted message payload
pub const TX_MESSAGE_PREFIX_LEN: usize = 4 + 4 + 2;
/// Classic CAN payload limit
pub const MAX_CAN_DATA_LEN: usize = 8;

const CAN_SFF_MASK: u32 = 0x0000_07FF;
const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

/// Header length implied by the first byte of a frame.
pub fn header_len_for(first_byte: u8) -> usize {
    if first_byte == command::MESSAGE {
        MESSAGE_HEADER_LEN
    } else {
        CONTROL_HEADER_LEN
    }
}

// ============================================================================
// Adapter Channels
// ============================================================================

/// Logical CAN channel of the adapter (1-7).
///
/// Control commands carry it in the top three bits of the 8-bit flags byte
/// (CH1 = 0x20), message frames in the top three bits of the 16-bit flags
/// word (CH1 = 0x2000).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdapterChannel(u8);

impl AdapterChannel {
    pub const CH1: AdapterChannel = AdapterChannel(1);

    pub fn new(number: u8) -> Result<Self, IoError> {
        if (1..=7).contains(&number) {
            Ok(AdapterChannel(number))
        } else {
            Err(IoError::configuration(format!(
                "adapter channel {} out of range 1..=7",
                number
            )))
        }
    }

    pub fn number(self) -> u8 {
        self.0
    }

    pub fn control_flags(self) -> u8 {
        self.0 << 5
    }

    pub fn message_flags(self) -> u16 {
        (self.0 as u16) << 13
    }

    /// Channel number carried by a message header's flags word (0 if none).
    pub fn number_from_message_flags(flags: u16) -> u8 {
        (flags >> 13) as u8
    }
}

// ============================================================================
// Hardware Identification
// ============================================================================

/// Adapter hardware reported by DEVICE_HW
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HardwareInfo {
    pub id: u8,
    pub name: &'static str,
}

/// Known CanHacker hardware ids.
pub fn hardware_name(id: u8) -> Option<&'static str> {
    let name = match id {
        0xFF => "CAN-Hacker on F105 mcu with dual CAN channels and single LIN channel (Old Id)",
        0x02 => "CAN-Hacker in ODB interface with single CAN channel and single LIN channel (Old Id)",
        0x01 => "CAN-Hacker 3.2 on F105 mcu with dual CAN channels and single LIN channel",
        0x04 => "CAN-Hacker in ODB interface on F105 mcu with single CAN channel and single LIN channel",
        0x03 => "CAN-Hacker CH-P on F105 mcu with dual CAN channels and single LIN channel",
        0x11 => "CAN-Hacker 3.3 on F407 mcu with dual CAN channels and single LIN channel",
        0x13 => "CAN-Hacker CH-P on F407 mcu with dual CAN channels and single LIN channel",
        0x14 => "CAN-Hacker in ODB interface on G431 mcu with single CAN channel and single LIN channel",
        0x06 => "CAN-Hacker CH-P on G473 mcu with dual CAN channels and single LIN channel",
        _ => return None,
    };
    Some(name)
}

// ============================================================================
// Types
// ============================================================================

/// Which side produced a frame. Only the message payload layout differs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Host -> adapter
    Tx,
    /// Adapter -> host
    Rx,
}

/// Decoded frame header
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// Command with the answer bit stripped
    pub command: u8,
    pub sequence: u8,
    /// 8-bit for control frames, 16-bit for MESSAGE
    pub flags: u16,
    /// Declared payload length
    pub data_len: u16,
    /// 4 or 6
    pub header_len: usize,
    pub is_positive_answer: bool,
}

/// Payload interpretation by command
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FramePayload {
    /// Sync request/answer; `ok` when the bytes match the canonical frame
    Sync { ok: bool },
    Hardware(HardwareInfo),
    /// DEVICE_INFO, DEVICE_FIRMWARE and DEVICE_SERIAL answers
    Text(String),
    /// CAN frame; `is_error` marks a DLC/data-length mismatch
    Message(CanFrame),
    Raw(Vec<u8>),
}

/// One complete frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: FramePayload,
}

impl Frame {
    pub fn command(&self) -> u8 {
        self.header.command
    }

    pub fn is_positive_answer(&self) -> bool {
        self.header.is_positive_answer
    }

    /// True for a sync answer carrying the canonical payload.
    pub fn is_sync_ok(&self) -> bool {
        matches!(self.payload, FramePayload::Sync { ok: true })
    }

    pub fn can_frame(&self) -> Option<&CanFrame> {
        match &self.payload {
            FramePayload::Message(frame) => Some(frame),
            _ => None,
        }
    }

    pub fn into_can_frame(self) -> Option<CanFrame> {
        match self.payload {
            FramePayload::Message(frame) => Some(frame),
            _ => None,
        }
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Host-side frame encoder. Owns the transmit sequence counter.
///
/// The counter is atomic so several writer threads can share one encoder.
#[derive(Debug, Default)]
pub struct FrameEncoder {
    sequence: AtomicU8,
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number the next non-sync frame will carry.
    pub fn sequence(&self) -> u8 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn reset_sequence(&self) {
        self.sequence.store(0, Ordering::SeqCst);
    }

    /// Encode one frame.
    ///
    /// SYNC ignores `flags` and `payload`, resets the sequence counter and
    /// returns the fixed sync frame. Other commands must be in 0x01..=0x7F;
    /// the length field is taken from `payload`.
    pub fn encode(&self, command: u8, flags: u16, payload: &[u8]) -> Result<Vec<u8>, IoError> {
        if command == command::SYNC {
            self.reset_sequence();
            return Ok(SYNC_FRAME.to_vec());
        }
        if !(0x01..=0x7F).contains(&command) {
            return Err(IoError::protocol(
                DEVICE,
                format!("command 0x{:02X} outside 0x01..0x7F", command),
            ));
        }

        let is_message = command == command::MESSAGE;
        let (max_len, max_flags) = if is_message {
            (u16::MAX as usize, u16::MAX)
        } else {
            (u8::MAX as usize, u8::MAX as u16)
        };
        if payload.len() > max_len {
            return Err(IoError::protocol(
                DEVICE,
                format!(
                    "{} payload too long: {} bytes (max {})",
                    command::name(command),
                    payload.len(),
                    max_len
                ),
            ));
        }
        if flags > max_flags {
            return Err(IoError::protocol(
                DEVICE,
                format!("flags 0x{:04X} do not fit a {} header", flags, command::name(command)),
            ));
        }

        // Post-increment; fetch_add wraps at 256.
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);

        let mut out = Vec::with_capacity(MESSAGE_HEADER_LEN + payload.len());
        out.push(command);
        out.push(seq);
        if is_message {
            out.extend_from_slice(&flags.to_le_bytes());
            out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        } else {
            out.push(flags as u8);
            out.push(payload.len() as u8);
        }
        out.extend_from_slice(payload);
        Ok(out)
    }
}

/// Build the host -> adapter message payload for a classic CAN frame.
pub fn encode_message_body(frame: &CanFrame) -> Result<Vec<u8>, IoError> {
    if frame.data.len() > MAX_CAN_DATA_LEN {
        return Err(IoError::protocol(
            DEVICE,
            format!(
                "classic CAN frame data too long: {} bytes (max {})",
                frame.data.len(),
                MAX_CAN_DATA_LEN
            ),
        ));
    }
    if !frame.is_rtr && frame.dlc as usize != frame.data.len() {
        return Err(IoError::protocol(
            DEVICE,
            format!(
                "DLC {} does not match {} data bytes",
                frame.dlc,
                frame.data.len()
            ),
        ));
    }
    let id_mask = if frame.is_extended { CAN_EFF_MASK } else { CAN_SFF_MASK };
    if frame.frame_id & !id_mask != 0 {
        return Err(IoError::protocol(
            DEVICE,
            format!(
                "frame id 0x{:X} exceeds the {} range",
                frame.frame_id,
                if frame.is_extended { "29-bit" } else { "11-bit" }
            ),
        ));
    }

    let mut flags = 0u32;
    if frame.is_rtr {
        flags |= message_flags::RTR;
    }
    if frame.is_extended {
        flags |= message_flags::EXTID;
    }

    let mut body = Vec::with_capacity(TX_MESSAGE_PREFIX_LEN + frame.data.len());
    body.extend_from_slice(&flags.to_le_bytes());
    body.extend_from_slice(&frame.frame_id.to_le_bytes());
    body.extend_from_slice(&(frame.dlc as u16).to_le_bytes());
    body.extend_from_slice(&frame.data);
    Ok(body)
}

// ============================================================================
// Decoding
// ============================================================================

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn is_sync_layout(direction: Direction, first: u8) -> bool {
    match direction {
        Direction::Rx => first == command::SYNC_ANSWER,
        Direction::Tx => first == command::SYNC,
    }
}

/// Decode the header at the start of `raw`.
pub fn decode_header(direction: Direction, raw: &[u8]) -> Result<Header, IoError> {
    let first = *raw
        .first()
        .ok_or_else(|| IoError::protocol(DEVICE, "empty frame"))?;
    if first == 0x00 {
        return Err(IoError::protocol(DEVICE, "frame starts with 0x00"));
    }

    let header_len = header_len_for(first);
    if raw.len() < header_len {
        return Err(IoError::protocol(
            DEVICE,
            format!(
                "frame too short: {} bytes, need at least {}",
                raw.len(),
                header_len
            ),
        ));
    }

    let sequence = raw[1];
    let (flags, data_len) = if header_len == MESSAGE_HEADER_LEN {
        (read_u16(raw, 2), read_u16(raw, 4))
    } else if is_sync_layout(direction, first) {
        // Fixed sync layout: no flags, no length.
        (0, 0)
    } else {
        (raw[2] as u16, raw[3] as u16)
    };

    let keyed = direction == Direction::Rx
        && first != command::SYNC_ANSWER
        && first != command::COMMAND_ERROR;
    let (command, is_positive_answer) = if keyed {
        (first & !ANSWER_BIT, first & ANSWER_BIT != 0)
    } else {
        (first, false)
    };

    Ok(Header {
        command,
        sequence,
        flags,
        data_len,
        header_len,
        is_positive_answer,
    })
}

/// Decode one complete frame.
///
/// Fails on empty input, a leading 0x00, input shorter than its header, or a
/// message payload shorter than its fixed prefix. A message whose DLC
/// disagrees with the trailing data is returned with `is_error` set.
pub fn decode(direction: Direction, raw: &[u8]) -> Result<Frame, IoError> {
    let header = decode_header(direction, raw)?;
    let body = &raw[header.header_len..];
    let declared = &body[..body.len().min(header.data_len as usize)];

    let payload = match header.command {
        command::SYNC_ANSWER if direction == Direction::Rx => FramePayload::Sync {
            ok: raw.len() >= 4 && raw[1] == 0x00 && raw[2] == command::SYNC_ANSWER && raw[3] == 0x00,
        },
        command::SYNC if direction == Direction::Tx => FramePayload::Sync {
            ok: raw.len() >= 4 && raw[..4] == SYNC_FRAME,
        },
        command::DEVICE_HW if !declared.is_empty() => {
            let id = declared[0];
            FramePayload::Hardware(HardwareInfo {
                id,
                name: hardware_name(id).unwrap_or("Unknown hardware"),
            })
        }
        command::DEVICE_INFO | command::DEVICE_FIRMWARE | command::DEVICE_SERIAL => {
            FramePayload::Text(String::from_utf8_lossy(declared).trim_end_matches('\0').to_string())
        }
        command::MESSAGE if header.header_len == MESSAGE_HEADER_LEN => {
            let frame = match direction {
                Direction::Rx => decode_received_message(header.flags, body)?,
                Direction::Tx => decode_transmitted_message(header.flags, body)?,
            };
            if frame.is_error {
                tracing::warn!(
                    dlc = frame.dlc,
                    data_len = frame.data.len(),
                    "ERR FRM: {}",
                    hex_dump(raw)
                );
            }
            FramePayload::Message(frame)
        }
        _ => FramePayload::Raw(declared.to_vec()),
    };

    Ok(Frame { header, payload })
}

fn decode_received_message(header_flags: u16, body: &[u8]) -> Result<CanFrame, IoError> {
    if body.len() < RX_MESSAGE_PREFIX_LEN {
        return Err(IoError::protocol(
            DEVICE,
            format!(
                "message payload too short: {} bytes, need at least {}",
                body.len(),
                RX_MESSAGE_PREFIX_LEN
            ),
        ));
    }
    let flags = read_u32(body, 0);
    let timestamp = read_u32(body, 4);
    // body[8..12] is reserved
    let frame_id = read_u32(body, 12);
    let dlc = read_u16(body, 16);
    let data = body[RX_MESSAGE_PREFIX_LEN..].to_vec();

    Ok(CanFrame {
        frame_id,
        dlc: dlc.min(u8::MAX as u16) as u8,
        is_error: dlc as usize != data.len(),
        data,
        is_extended: flags & message_flags::EXTID != 0,
        is_rtr: flags & message_flags::RTR != 0,
        timestamp,
        channel: AdapterChannel::number_from_message_flags(header_flags),
    })
}

fn decode_transmitted_message(header_flags: u16, body: &[u8]) -> Result<CanFrame, IoError> {
    if body.len() < TX_MESSAGE_PREFIX_LEN {
        return Err(IoError::protocol(
            DEVICE,
            format!(
                "message payload too short: {} bytes, need at least {}",
                body.len(),
                TX_MESSAGE_PREFIX_LEN
            ),
        ));
    }
    let flags = read_u32(body, 0);
    let frame_id = read_u32(body, 4);
    let dlc = read_u16(body, 8);
    let data = body[TX_MESSAGE_PREFIX_LEN..].to_vec();
    let is_rtr = flags & message_flags::RTR != 0;

    Ok(CanFrame {
        frame_id,
        dlc: dlc.min(u8::MAX as u16) as u8,
        // Remote frames carry a DLC but no data.
        is_error: !is_rtr && dlc as usize != data.len(),
        data,
        is_extended: flags & message_flags::EXTID != 0,
        is_rtr,
        timestamp: 0,
        channel: AdapterChannel::number_from_message_flags(header_flags),
    })
}

// ============================================================================
// Tests
// ============================================================================
