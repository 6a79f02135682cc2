// src/io/canhacker/mod.rs
//
// CanHacker binary-protocol driver.
//
// Layers, bottom up:
//   codec     - frame encode/decode, sequence counter
//   framer    - byte stream -> complete frames
//   transport - serial reader thread, control and message queues
//   device    - control requests and the session state machine
//   bus       - configuration-driven construction and the CanBus interface

mod bus;
pub mod codec;
mod config;
mod device;
#[cfg(test)]
mod fake;
pub mod framer;
pub mod transport;

pub use bus::CanHackerBus;
pub use codec::{AdapterChannel, Direction, Frame, FrameEncoder, FramePayload, HardwareInfo};
pub use config::{BusTiming, CanFilter, CanHackerConfig, ValidatedConfig};
pub use device::{
    find_bitrate_code, supported_bitrates, ChannelMode, DeviceController, SessionState,
    DEFAULT_RESPONSE_TIMEOUT,
};
pub use framer::{FrameAssembler, FrameClass, RawFrame};
pub use transport::{DroppedFrames, Transport, TransportOptions};
