// src/io/traits.rs
//
// Interface trait between CAN bus drivers and the code that uses them.

use std::time::Duration;

use super::{CanFrame, IoError};

/// A CAN bus session.
///
/// `recv` returns `(frame, filtered)`: `filtered` is true when the frame has
/// already passed the configured acceptance filters, so the caller does not
/// need to filter again. A timeout yields `(None, false)`.
pub trait CanBus {
    /// Transmit one frame. `timeout` bounds the wait for the adapter where it
    /// acknowledges transmissions.
    fn send(&self, frame: &CanFrame, timeout: Option<Duration>) -> Result<(), IoError>;

    /// Wait up to `timeout` (forever when `None`) for the next frame.
    fn recv(&self, timeout: Option<Duration>) -> Result<(Option<CanFrame>, bool), IoError>;

    /// Release the device. Calling it again is a no-op.
    fn shutdown(&mut self) -> Result<(), IoError>;
}
