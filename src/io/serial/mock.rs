// src/io/serial/mock.rs
//
// Scripted in-memory serial channel for tests.
//
// Bytes queued with `inject` (or produced by the responder after each write)
// are handed out by `read`. An empty queue behaves like a read timeout.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::SerialChannel;
use crate::io::error::IoError;

/// Produces the adapter's reply bytes for one written chunk.
pub(crate) type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

#[derive(Default)]
struct MockState {
    rx: VecDeque<u8>,
    written: Vec<Vec<u8>>,
    responder: Option<Responder>,
    close_calls: usize,
    fail_reads: bool,
    fail_close: bool,
}

#[derive(Clone, Default)]
pub(crate) struct MockChannel {
    state: Arc<Mutex<MockState>>,
}

impl MockChannel {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        let channel = Self::new();
        channel.state.lock().unwrap().responder = Some(Box::new(responder));
        channel
    }

    /// Queue bytes as if the adapter had sent them.
    pub(crate) fn inject(&self, bytes: &[u8]) {
        self.state.lock().unwrap().rx.extend(bytes.iter().copied());
    }

    /// Every chunk passed to `write_all`, in order.
    pub(crate) fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().written.clone()
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.state.lock().unwrap().close_calls
    }

    pub(crate) fn fail_reads(&self) {
        self.state.lock().unwrap().fail_reads = true;
    }

    pub(crate) fn fail_close(&self) {
        self.state.lock().unwrap().fail_close = true;
    }
}

impl SerialChannel for MockChannel {
    fn name(&self) -> &str {
        "canhacker(mock)"
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        let n = {
            let mut state = self.state.lock().unwrap();
            if state.fail_reads {
                return Err(IoError::read(self.name(), "device unplugged"));
            }
            let mut n = 0;
            while n < buf.len() {
                match state.rx.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            n
        };
        if n == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), IoError> {
        let mut state = self.state.lock().unwrap();
        state.written.push(data.to_vec());
        let reply = match state.responder.as_mut() {
            Some(responder) => responder(data),
            None => Vec::new(),
        };
        state.rx.extend(reply);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), IoError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), IoError> {
        let mut state = self.state.lock().unwrap();
        state.close_calls += 1;
        if state.fail_close {
            return Err(IoError::connection(self.name(), "close failed"));
        }
        Ok(())
    }

    fn try_clone_channel(&self) -> Result<Box<dyn SerialChannel>, IoError> {
        Ok(Box::new(self.clone()))
    }
}
