// src/io/canhacker/bus.rs
//
// CanHacker bus: builds a running session from a configuration and exposes
// it through the `CanBus` interface.

use std::time::Duration;

use super::codec::HardwareInfo;
use super::config::{BusTiming, CanHackerConfig, ValidatedConfig};
use super::device::{DeviceController, SessionState};
use super::transport::{DroppedFrames, Transport};
use crate::io::error::IoError;
use crate::io::serial::{SerialChannel, SerialPortChannel};
use crate::io::traits::CanBus;
use crate::io::CanFrame;

pub struct CanHackerBus {
    controller: DeviceController,
}

impl CanHackerBus {
    /// Open the configured serial port and bring the session up.
    pub fn open(config: &CanHackerConfig) -> Result<Self, IoError> {
        let validated = config.validate().map_err(IoError::initialization)?;
        let channel =
            SerialPortChannel::open(&validated.serial_options()).map_err(IoError::initialization)?;
        if !validated.sleep_after_open.is_zero() {
            std::thread::sleep(validated.sleep_after_open);
        }
        Self::start(Box::new(channel), &validated)
    }

    /// Bring a session up over an already open channel. `config.channel`
    /// must still parse but no port is opened from it.
    pub fn with_channel(
        channel: Box<dyn SerialChannel>,
        config: &CanHackerConfig,
    ) -> Result<Self, IoError> {
        let validated = config.validate().map_err(IoError::initialization)?;
        Self::start(channel, &validated)
    }

    fn start(channel: Box<dyn SerialChannel>, config: &ValidatedConfig) -> Result<Self, IoError> {
        let transport = Transport::open(channel, &config.transport).map_err(IoError::initialization)?;
        let mut controller = DeviceController::new(transport, config.channel, config.response_timeout);

        if let Err(e) = Self::initialize(&mut controller, config) {
            tracing::error!(device = %controller.device(), error = %e, "initialization failed");
            if let Err(close_err) = controller.abort() {
                tracing::warn!(device = %controller.device(), error = %close_err, "close after failed init");
            }
            return Err(IoError::initialization(e));
        }
        Ok(Self { controller })
    }

    /// Fixed order: sync, device open, timing, mode, channel open, filters.
    fn initialize(controller: &mut DeviceController, config: &ValidatedConfig) -> Result<(), IoError> {
        controller.sync()?;
        controller.device_open()?;
        match &config.timing {
            BusTiming::Default => {}
            BusTiming::Bitrate(bitrate) => controller.set_bitrate(*bitrate)?,
            BusTiming::Register(btr) => controller.set_bitrate_from_register(btr)?,
        }
        controller.set_mode(config.mode)?;
        controller.channel_open()?;
        controller.apply_filters(&config.filters)?;
        controller.start()
    }

    pub fn state(&self) -> SessionState {
        self.controller.state()
    }

    pub fn dropped_frames(&self) -> DroppedFrames {
        self.controller.dropped_frames()
    }

    /// Hardware identified by `identify`, if it was called.
    pub fn hardware(&self) -> Option<&HardwareInfo> {
        self.controller.hardware()
    }

    /// Query the adapter's hardware id.
    pub fn identify(&mut self) -> Result<HardwareInfo, IoError> {
        self.controller.query_hardware()
    }

    pub fn controller(&self) -> &DeviceController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut DeviceController {
        &mut self.controller
    }
}

impl CanBus for CanHackerBus {
    /// Fire-and-forget; the adapter does not acknowledge messages, so
    /// `timeout` is not used.
    fn send(&self, frame: &CanFrame, _timeout: Option<Duration>) -> Result<(), IoError> {
        self.controller.send_message(frame)
    }

    /// Frames were filtered by the adapter, so `filtered` is always true.
    fn recv(&self, timeout: Option<Duration>) -> Result<(Option<CanFrame>, bool), IoError> {
        match self.controller.next_message(timeout)? {
            Some(frame) => Ok((Some(frame), true)),
            None => Ok((None, false)),
        }
    }

    fn shutdown(&mut self) -> Result<(), IoError> {
        self.controller.shutdown()
    }
}

impl Drop for CanHackerBus {
    fn drop(&mut self) {
        if self.controller.state() != SessionState::PortClosed {
            if let Err(e) = self.controller.shutdown() {
                tracing::warn!(device = %self.controller.device(), error = %e, "shutdown on drop failed");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
