// src/io/serial/mod.rs
//
// Serial byte channel used by the CanHacker transport.
//
// - SerialChannel: the blocking read/write/flush/close seam
// - SerialPortChannel: implementation over the serialport crate
// - line settings (data bits, stop bits, parity, RTS/CTS)

mod channel;
#[cfg(test)]
pub(crate) mod mock;
pub(crate) mod utils;

pub use channel::{list_serial_ports, SerialChannel, SerialPortChannel, SerialPortInfo, SerialPortOptions};
pub use utils::{Parity, SerialLineSettings};
