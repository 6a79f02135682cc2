// src/io/serial/utils.rs
//
// Serial line settings and their mapping onto the serialport crate's types.

use serde::{Deserialize, Serialize};
use serialport::{DataBits, FlowControl, Parity as SpParity, StopBits};

// ============================================================================
// Types
// ============================================================================

/// Parity setting for serial port configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Character framing of the serial line. CanHacker adapters run 8N1.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialLineSettings {
    /// Data bits (5, 6, 7, 8) - defaults to 8
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Stop bits (1, 2) - defaults to 1
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: Parity,
}

fn default_data_bits() -> u8 { 8 }
fn default_stop_bits() -> u8 { 1 }

impl Default for SerialLineSettings {
    fn default() -> Self {
        Self {
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::None,
        }
    }
}

// ============================================================================
// Conversion Functions
// ============================================================================

impl SerialLineSettings {
    /// Unsupported counts fall back to 8 data bits.
    pub fn serialport_data_bits(&self) -> DataBits {
        match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        }
    }

    pub fn serialport_stop_bits(&self) -> StopBits {
        match self.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        }
    }

    pub fn serialport_parity(&self) -> SpParity {
        match self.parity {
            Parity::None => SpParity::None,
            Parity::Odd => SpParity::Odd,
            Parity::Even => SpParity::Even,
        }
    }
}

/// RTS/CTS handshake flag to serialport flow control.
pub fn flow_control(rtscts: bool) -> FlowControl {
    if rtscts {
        FlowControl::Hardware
    } else {
        FlowControl::None
    }
}

// ============================================================================
// Tests
// ============================================================================
