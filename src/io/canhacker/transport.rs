// src/io/canhacker/transport.rs
//
// CanHacker transport: owns the serial channel, runs the background reader
// that reassembles frames, and fans them out to a control queue and a message
// queue. Writers share a mutex-guarded second handle to the same device.
//
// Shutdown order: stop flag -> join reader -> close channel. The reader is
// never running when the device is closed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self as std_mpsc, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::framer::{FrameAssembler, FrameClass, RawFrame};
use crate::io::error::IoError;
use crate::io::hex_dump;
use crate::io::serial::SerialChannel;
use crate::logging::TRANSPORT_TARGET;

// ============================================================================
// Constants
// ============================================================================

/// Control responses are consumed one at a time by the requester.
pub const DEFAULT_CONTROL_QUEUE_CAPACITY: usize = 10;
/// CAN traffic may burst while the consumer is busy.
pub const DEFAULT_MESSAGE_QUEUE_CAPACITY: usize = 10_000;

// ============================================================================
// Types
// ============================================================================

/// Queue sizing for a transport
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportOptions {
    pub control_queue_capacity: usize,
    pub message_queue_capacity: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            control_queue_capacity: DEFAULT_CONTROL_QUEUE_CAPACITY,
            message_queue_capacity: DEFAULT_MESSAGE_QUEUE_CAPACITY,
        }
    }
}

/// Frames discarded because their queue was full
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DroppedFrames {
    pub control: u64,
    pub message: u64,
}

/// State shared between the transport and its reader thread
#[derive(Default)]
struct ReaderShared {
    stop: AtomicBool,
    running: AtomicBool,
    dropped_control: AtomicU64,
    dropped_message: AtomicU64,
}

type ReaderHandle = JoinHandle<Box<dyn SerialChannel>>;

// ============================================================================
// Transport
// ============================================================================

pub struct Transport {
    device: String,
    writer: Mutex<Box<dyn SerialChannel>>,
    control_rx: Mutex<Receiver<RawFrame>>,
    message_rx: Mutex<Receiver<RawFrame>>,
    shared: Arc<ReaderShared>,
    reader: Mutex<Option<ReaderHandle>>,
    closed: AtomicBool,
}

impl Transport {
    /// Take ownership of `channel` and start the reader thread.
    pub fn open(channel: Box<dyn SerialChannel>, options: &TransportOptions) -> Result<Self, IoError> {
        let device = channel.name().to_string();
        if options.control_queue_capacity == 0 || options.message_queue_capacity == 0 {
            return Err(IoError::configuration("queue capacities must be at least 1"));
        }

        let reader_channel = channel.try_clone_channel()?;
        let (control_tx, control_rx) = std_mpsc::sync_channel(options.control_queue_capacity);
        let (message_tx, message_rx) = std_mpsc::sync_channel(options.message_queue_capacity);

        let shared = Arc::new(ReaderShared::default());
        shared.running.store(true, Ordering::SeqCst);

        let shared_clone = shared.clone();
        let handle = std::thread::Builder::new()
            .name("canhacker-rx".to_string())
            .spawn(move || run_reader(reader_channel, control_tx, message_tx, shared_clone))
            .map_err(|e| IoError::connection(&device, format!("spawn reader: {}", e)))?;

        tracing::debug!(
            device = %device,
            control_capacity = options.control_queue_capacity,
            message_capacity = options.message_queue_capacity,
            "transport started"
        );

        Ok(Self {
            device,
            writer: Mutex::new(channel),
            control_rx: Mutex::new(control_rx),
            message_rx: Mutex::new(message_rx),
            shared,
            reader: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Write one encoded frame and flush.
    pub fn write(&self, raw: &[u8]) -> Result<(), IoError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IoError::write(&self.device, "port is closed"));
        }
        tracing::trace!(target: TRANSPORT_TARGET, "-> {}", hex_dump(raw));

        let mut channel = self
            .writer
            .lock()
            .map_err(|_| IoError::write(&self.device, "writer lock poisoned"))?;
        channel.write_all(raw)?;
        channel.flush()
    }

    /// Next control frame. `None` when the timeout elapses or the reader has stopped.
    pub fn read_control(&self, timeout: Option<Duration>) -> Option<RawFrame> {
        Self::pop(&self.control_rx, timeout)
    }

    /// Next message frame. `None` when the timeout elapses or the reader has stopped.
    pub fn read_message(&self, timeout: Option<Duration>) -> Option<RawFrame> {
        Self::pop(&self.message_rx, timeout)
    }

    fn pop(queue: &Mutex<Receiver<RawFrame>>, timeout: Option<Duration>) -> Option<RawFrame> {
        let rx = queue.lock().ok()?;
        match timeout {
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(frame) => Some(frame),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
            },
            None => rx.recv().ok(),
        }
    }

    /// Whether the reader thread is still consuming bytes.
    pub fn reader_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn dropped_frames(&self) -> DroppedFrames {
        DroppedFrames {
            control: self.shared.dropped_control.load(Ordering::Relaxed),
            message: self.shared.dropped_message.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop and join the reader, then close the device. Safe to call twice.
    pub fn close_port(&self) -> Result<(), IoError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.stop.store(true, Ordering::SeqCst);

        let handle = self.reader.lock().ok().and_then(|mut guard| guard.take());
        let mut result = Ok(());
        if let Some(handle) = handle {
            match handle.join() {
                Ok(mut reader_channel) => {
                    if let Err(e) = reader_channel.close() {
                        result = Err(e);
                    }
                }
                Err(_) => {
                    tracing::error!(device = %self.device, "reader thread panicked");
                }
            }
        }

        match self.writer.lock() {
            Ok(mut channel) => {
                if let Err(e) = channel.close() {
                    result = result.and(Err(e));
                }
            }
            Err(_) => {
                result = result.and(Err(IoError::connection(&self.device, "writer lock poisoned")));
            }
        }

        tracing::debug!(device = %self.device, "transport closed");
        result
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Err(e) = self.close_port() {
                tracing::warn!(device = %self.device, error = %e, "close on drop failed");
            }
        }
    }
}

// ============================================================================
// Reader Loop
// ============================================================================

/// Byte-at-a-time reassembly loop. Returns the channel so the owner can close it.
fn run_reader(
    mut channel: Box<dyn SerialChannel>,
    control_tx: SyncSender<RawFrame>,
    message_tx: SyncSender<RawFrame>,
    shared: Arc<ReaderShared>,
) -> Box<dyn SerialChannel> {
    let device = channel.name().to_string();
    let mut assembler = FrameAssembler::new();
    let mut byte = [0u8; 1];

    while !shared.stop.load(Ordering::SeqCst) {
        match channel.read(&mut byte) {
            Ok(0) => continue,
            Ok(_) => {
                if let Some(frame) = assembler.push(byte[0]) {
                    dispatch(frame, &control_tx, &message_tx, &shared, &device);
                }
            }
            Err(e) => {
                tracing::error!(device = %device, error = %e, "serial read failed, reader stopped");
                break;
            }
        }
    }

    let discarded = assembler.reset();
    if discarded > 0 {
        tracing::debug!(device = %device, discarded, "partial frame discarded at reader exit");
    }
    shared.running.store(false, Ordering::SeqCst);
    channel
}

fn dispatch(
    frame: RawFrame,
    control_tx: &SyncSender<RawFrame>,
    message_tx: &SyncSender<RawFrame>,
    shared: &ReaderShared,
    device: &str,
) {
    let (tx, dropped, label) = match frame.class() {
        FrameClass::Message => (message_tx, &shared.dropped_message, "MSG"),
        FrameClass::Control => (control_tx, &shared.dropped_control, "CTRL"),
    };
    tracing::trace!(target: TRANSPORT_TARGET, "{} <- {}", label, hex_dump(frame.bytes()));

    // The reader never blocks on a full queue.
    match tx.try_send(frame) {
        Ok(()) => {}
        Err(TrySendError::Full(frame)) => {
            let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                device = %device,
                dropped = total,
                "{} queue full, dropping {}",
                label,
                hex_dump(frame.bytes())
            );
        }
        Err(TrySendError::Disconnected(_)) => {
            dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::serial::mock::MockChannel;
    use std::time::Instant;

    const WAIT: Option<Duration> = Some(Duration::from_secs(1));

    fn open(mock: &MockChannel, options: TransportOptions) -> Transport {
        Transport::open(Box::new(mock.clone()), &options).unwrap()
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_stray_zero_then_control_frame() {
        let mock = MockChannel::new();
        mock.inject(&[0x00, 0x88, 0x00, 0x00, 0x00]);
        let transport = open(&mock, TransportOptions::default());

        let frame = transport.read_control(WAIT).unwrap();
        assert_eq!(frame.bytes(), &[0x88, 0x00, 0x00, 0x00]);
        assert!(transport.read_control(Some(Duration::from_millis(20))).is_none());
        assert!(transport.read_message(Some(Duration::from_millis(20))).is_none());
        transport.close_port().unwrap();
    }

    #[test]
    fn test_message_frame_routed_to_message_queue() {
        let mock = MockChannel::new();
        let transport = open(&mock, TransportOptions::default());

        let mut raw = vec![0x40, 0x01, 0x00, 0x20, 0x03, 0x00];
        mock.inject(&raw);
        mock.inject(&[1, 2]);
        assert!(transport.read_message(Some(Duration::from_millis(50))).is_none());

        mock.inject(&[3]);
        raw.extend_from_slice(&[1, 2, 3]);
        let frame = transport.read_message(WAIT).unwrap();
        assert_eq!(frame.bytes(), raw.as_slice());
        assert!(transport.read_control(Some(Duration::from_millis(20))).is_none());
        transport.close_port().unwrap();
    }

    #[test]
    fn test_full_control_queue_drops_without_stalling() {
        let mock = MockChannel::new();
        for seq in 0..5u8 {
            mock.inject(&[0x88, seq, 0x00, 0x00]);
        }
        mock.inject(&[0x40, 0x00, 0x00, 0x20, 0x00, 0x00]);
        let transport = open(
            &mock,
            TransportOptions {
                control_queue_capacity: 2,
                message_queue_capacity: 4,
            },
        );

        // The message behind the overflowing control frames still arrives.
        assert!(transport.read_message(WAIT).is_some());
        assert!(wait_until(|| transport.dropped_frames().control == 3));
        assert_eq!(transport.dropped_frames().message, 0);

        assert_eq!(transport.read_control(WAIT).unwrap().bytes()[1], 0);
        assert_eq!(transport.read_control(WAIT).unwrap().bytes()[1], 1);
        assert!(transport.read_control(Some(Duration::from_millis(20))).is_none());
        transport.close_port().unwrap();
    }

    #[test]
    fn test_write_goes_to_channel() {
        let mock = MockChannel::new();
        let transport = open(&mock, TransportOptions::default());
        transport.write(&[0xA5, 0x00, 0xA5, 0x00]).unwrap();
        assert_eq!(mock.written(), vec![vec![0xA5, 0x00, 0xA5, 0x00]]);
        transport.close_port().unwrap();
    }

    #[test]
    fn test_close_joins_reader_then_closes_both_handles() {
        let mock = MockChannel::new();
        let transport = open(&mock, TransportOptions::default());
        assert!(transport.reader_running());

        transport.close_port().unwrap();
        assert!(!transport.reader_running());
        assert!(transport.is_closed());
        assert_eq!(mock.close_calls(), 2);

        // Second close is a no-op
        transport.close_port().unwrap();
        assert_eq!(mock.close_calls(), 2);
        assert!(transport.write(&[0x08, 0x00, 0x00, 0x00]).is_err());
    }

    #[test]
    fn test_close_error_is_reported_after_closing_both() {
        let mock = MockChannel::new();
        let transport = open(&mock, TransportOptions::default());
        mock.fail_close();
        assert!(matches!(transport.close_port(), Err(IoError::Connection { .. })));
        assert_eq!(mock.close_calls(), 2);
        assert!(!transport.reader_running());
    }

    #[test]
    fn test_drop_closes_port() {
        let mock = MockChannel::new();
        {
            let _transport = open(&mock, TransportOptions::default());
        }
        assert_eq!(mock.close_calls(), 2);
    }

    #[test]
    fn test_read_error_stops_reader() {
        let mock = MockChannel::new();
        let transport = open(&mock, TransportOptions::default());
        mock.fail_reads();
        assert!(wait_until(|| !transport.reader_running()));
        assert!(transport.read_control(Some(Duration::from_millis(10))).is_none());
        transport.close_port().unwrap();
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mock = MockChannel::new();
        let result = Transport::open(
            Box::new(mock),
            &TransportOptions {
                control_queue_capacity: 0,
                message_queue_capacity: 1,
            },
        );
        assert!(matches!(result, Err(IoError::Configuration(_))));
    }
}
