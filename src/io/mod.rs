// src/io/mod.rs
//
// IO layer for CanHacker serial CAN adapters.
// The serial module provides the byte channel, the canhacker module the
// protocol stack on top of it, and traits the bus interface callers use.

pub mod canhacker;
mod error;
pub mod serial;
pub mod traits;

pub use canhacker::{
    BusTiming, CanFilter, CanHackerBus, CanHackerConfig, ChannelMode, SessionState,
};
pub use error::IoError;
pub use serial::{SerialChannel, SerialPortChannel};
pub use traits::CanBus;

use serde::{Deserialize, Serialize};

// ============================================================================
// Shared Types
// ============================================================================

/// Classic CAN frame as exchanged with the bus interface.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFrame {
    /// CAN frame ID (11-bit standard or 29-bit extended)
    pub frame_id: u32,
    /// Data length code. Equals `data.len()` for well-formed data frames.
    pub dlc: u8,
    /// Frame data
    pub data: Vec<u8>,
    /// Extended (29-bit) frame ID
    pub is_extended: bool,
    /// Remote Transmission Request
    pub is_rtr: bool,
    /// Adapter timestamp of a received frame (0 for frames built locally)
    #[serde(default)]
    pub timestamp: u32,
    /// Adapter channel a received frame arrived on (1-based, 0 if unknown)
    #[serde(default)]
    pub channel: u8,
    /// Declared DLC disagreed with the data actually received
    #[serde(default)]
    pub is_error: bool,
}

impl CanFrame {
    /// Standard (11-bit) data frame. DLC follows the data length, saturating
    /// at 255; `send` rejects anything over 8 bytes regardless.
    pub fn new(frame_id: u32, data: &[u8]) -> Self {
        Self {
            frame_id,
            dlc: u8::try_from(data.len()).unwrap_or(u8::MAX),
            data: data.to_vec(),
            ..Default::default()
        }
    }

    /// Extended (29-bit) data frame.
    pub fn new_extended(frame_id: u32, data: &[u8]) -> Self {
        Self {
            is_extended: true,
            ..Self::new(frame_id, data)
        }
    }

    /// Remote frame requesting `dlc` bytes.
    pub fn new_remote(frame_id: u32, dlc: u8, is_extended: bool) -> Self {
        Self {
            frame_id,
            dlc,
            is_extended,
            is_rtr: true,
            ..Default::default()
        }
    }
}

/// Hex dump used in frame trace logs, e.g. `A5 00 A5 00`.
pub(crate) fn hex_dump(bytes: &[u8]) -> String {
    let encoded = hex::encode_upper(bytes);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / 2);
    for (i, pair) in encoded.as_bytes().chunks(2).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push(pair[0] as char);
        out.push(pair[1] as char);
    }
    out
}
