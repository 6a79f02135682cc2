// src/lib.rs
//
// Driver for CanHacker serial CAN adapters.
//
// ```no_run
// use canhacker::{CanBus, CanFrame, CanHackerBus, CanHackerConfig};
// use std::time::Duration;
//
// let config = CanHackerConfig::new("/dev/ttyACM0").bitrate(500_000);
// let mut bus = CanHackerBus::open(&config)?;
// bus.send(&CanFrame::new(0x123, &[0xAA, 0xBB]), None)?;
// if let (Some(frame), _) = bus.recv(Some(Duration::from_secs(1)))? {
//     println!("{:X}", frame.frame_id);
// }
// bus.shutdown()?;
// # Ok::<(), canhacker::IoError>(())
// ```

pub mod io;
pub mod logging;

pub use io::{
    BusTiming, CanBus, CanFilter, CanFrame, CanHackerBus, CanHackerConfig, ChannelMode, IoError,
    SerialChannel, SerialPortChannel, SessionState,
};
pub use logging::{init_logging, LogConfig};
