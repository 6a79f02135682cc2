// src/io/canhacker/framer.rs
//
// Byte-stream reassembly for the CanHacker protocol.
//
// The stream has no delimiters. The first byte of a frame selects the header
// length (6 for MESSAGE, 4 otherwise), the header's length field selects the
// payload length. Zero bytes between frames are adapter padding and skipped.

use std::mem;

use super::codec::{command, header_len_for, MESSAGE_HEADER_LEN};

// =============================================================================
// Types
// =============================================================================

/// Queue a completed frame is routed to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameClass {
    /// Command responses and everything that is not a CAN message
    Control,
    /// CAN traffic (command byte 0x40)
    Message,
}

impl FrameClass {
    pub fn of(first_byte: u8) -> Self {
        if first_byte == command::MESSAGE {
            FrameClass::Message
        } else {
            FrameClass::Control
        }
    }
}

/// A delimited frame, detached from the assembler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawFrame {
    bytes: Vec<u8>,
    class: FrameClass,
}

impl RawFrame {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn class(&self) -> FrameClass {
        self.class
    }

}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AssemblerState {
    AwaitFirstByte,
    AwaitHeader { header_len: usize },
    AwaitPayload { total_len: usize },
}

// =============================================================================
// Frame Assembler
// =============================================================================

/// Stateful frame assembler, fed one byte at a time.
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    state: AssemblerState,
    skipped_padding: u64,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAssembler {
    pub fn new() -> Self {
        FrameAssembler {
            buffer: Vec::with_capacity(32),
            state: AssemblerState::AwaitFirstByte,
            skipped_padding: 0,
        }
    }

    /// Consume one byte. Returns the frame this byte completed, if any.
    pub fn push(&mut self, byte: u8) -> Option<RawFrame> {
        match self.state {
            AssemblerState::AwaitFirstByte => {
                if byte == 0x00 {
                    self.skipped_padding += 1;
                    return None;
                }
                self.buffer.push(byte);
                self.state = AssemblerState::AwaitHeader {
                    header_len: header_len_for(byte),
                };
                None
            }
            AssemblerState::AwaitHeader { header_len } => {
                self.buffer.push(byte);
                if self.buffer.len() < header_len {
                    return None;
                }
                let payload_len = self.declared_payload_len(header_len);
                if payload_len == 0 {
                    return Some(self.complete());
                }
                self.state = AssemblerState::AwaitPayload {
                    total_len: header_len + payload_len,
                };
                None
            }
            AssemblerState::AwaitPayload { total_len } => {
                self.buffer.push(byte);
                if self.buffer.len() < total_len {
                    None
                } else {
                    Some(self.complete())
                }
            }
        }
    }

    /// Feed a chunk of bytes. Returns every frame completed by it, in order.
    pub fn feed(&mut self, data: &[u8]) -> Vec<RawFrame> {
        data.iter().filter_map(|&b| self.push(b)).collect()
    }

    /// Bytes of the partially assembled frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// True between frames.
    pub fn is_idle(&self) -> bool {
        self.state == AssemblerState::AwaitFirstByte
    }

    /// Padding zero bytes skipped between frames so far.
    pub fn skipped_padding(&self) -> u64 {
        self.skipped_padding
    }

    /// Drop any partial frame. Returns the number of bytes discarded.
    pub fn reset(&mut self) -> usize {
        let discarded = self.buffer.len();
        self.buffer.clear();
        self.state = AssemblerState::AwaitFirstByte;
        discarded
    }

    fn declared_payload_len(&self, header_len: usize) -> usize {
        if header_len == MESSAGE_HEADER_LEN {
            u16::from_le_bytes([self.buffer[4], self.buffer[5]]) as usize
        } else if self.buffer[0] == command::SYNC_ANSWER {
            // The sync answer has no length field.
            0
        } else {
            self.buffer[3] as usize
        }
    }

    fn complete(&mut self) -> RawFrame {
        let bytes = mem::replace(&mut self.buffer, Vec::with_capacity(32));
        self.state = AssemblerState::AwaitFirstByte;
        let class = FrameClass::of(bytes[0]);
        RawFrame { bytes, class }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leading_zero_is_skipped() {
        let mut asm = FrameAssembler::new();
        let frames = asm.feed(&[0x00, 0x88, 0x00, 0x00, 0x00]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].class(), FrameClass::Control);
        assert_eq!(frames[0].bytes(), &[0x88, 0x00, 0x00, 0x00]);
        assert_eq!(asm.skipped_padding(), 1);
        assert!(asm.is_idle());
    }

    #[test]
    fn test_zero_inside_frame_is_kept() {
        let mut asm = FrameAssembler::new();
        // Sequence, flags and length are all zero here.
        let frames = asm.feed(&[0x98, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].bytes().len(), 4);
        assert_eq!(asm.skipped_padding(), 2);
    }

    #[test]
    fn test_control_frame_with_payload() {
        let mut asm = FrameAssembler::new();
        let raw = [0x81, 0x02, 0x00, 0x03, b'a', b'b', b'c'];
        for &b in &raw[..raw.len() - 1] {
            assert!(asm.push(b).is_none());
        }
        let frame = asm.push(raw[raw.len() - 1]).unwrap();
        assert_eq!(frame.bytes(), &raw);
        assert_eq!(frame.class(), FrameClass::Control);
    }

    #[test]
    fn test_sync_answer_has_no_length() {
        let mut asm = FrameAssembler::new();
        // Byte 3 of a sync answer is never a length, even when non-zero.
        let frames = asm.feed(&[0x5A, 0x00, 0x5A, 0x07, 0x88, 0x01, 0x00, 0x00]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].bytes(), &[0x5A, 0x00, 0x5A, 0x07]);
        assert_eq!(frames[1].bytes(), &[0x88, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_message_frame_completes_on_last_byte() {
        let mut asm = FrameAssembler::new();
        let payload_len = 20usize;
        let mut raw = vec![0x40, 0x05, 0x00, 0x20];
        raw.extend_from_slice(&(payload_len as u16).to_le_bytes());
        raw.extend((0..payload_len).map(|i| i as u8 + 1));

        for &b in &raw[..raw.len() - 1] {
            assert!(asm.push(b).is_none());
        }
        assert_eq!(asm.pending(), 6 + payload_len - 1);
        let frame = asm.push(*raw.last().unwrap()).unwrap();
        assert_eq!(frame.class(), FrameClass::Message);
        assert_eq!(frame.bytes().len(), 6 + payload_len);
        assert!(asm.is_idle());
    }

    #[test]
    fn test_zero_length_message() {
        let mut asm = FrameAssembler::new();
        let frames = asm.feed(&[0x40, 0x00, 0x00, 0x20, 0x00, 0x00]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].class(), FrameClass::Message);
    }

    #[test]
    fn test_long_message_length_is_little_endian() {
        let mut asm = FrameAssembler::new();
        let mut raw = vec![0x40, 0x00, 0x00, 0x20, 0x01, 0x01]; // 257 bytes
        raw.extend(std::iter::repeat(0xEE).take(256));
        assert!(asm.feed(&raw).is_empty());
        let frame = asm.push(0xEE).unwrap();
        assert_eq!(frame.bytes().len(), 6 + 257);
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut asm = FrameAssembler::new();
        let mut stream = vec![0x00, 0x00];
        stream.extend_from_slice(&[0x91, 0x01, 0x20, 0x00]);
        stream.extend_from_slice(&[0x40, 0x09, 0x00, 0x20, 0x02, 0x00, 0xDE, 0xAD]);
        stream.push(0x00);
        stream.extend_from_slice(&[0x98, 0x02, 0x20, 0x00]);

        let frames = asm.feed(&stream);
        let classes: Vec<FrameClass> = frames.iter().map(|f| f.class()).collect();
        assert_eq!(
            classes,
            vec![FrameClass::Control, FrameClass::Message, FrameClass::Control]
        );
        assert_eq!(frames[1].bytes(), &[0x40, 0x09, 0x00, 0x20, 0x02, 0x00, 0xDE, 0xAD]);
        assert_eq!(asm.skipped_padding(), 3);
    }

    #[test]
    fn test_answered_message_is_a_control_frame() {
        // 0xC0 is a positive answer to MESSAGE; only a raw 0x40 uses the long header.
        let mut asm = FrameAssembler::new();
        let frames = asm.feed(&[0xC0, 0x04, 0x20, 0x00]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].class(), FrameClass::Control);
    }

    #[test]
    fn test_reset_discards_partial_frame() {
        let mut asm = FrameAssembler::new();
        assert!(asm.feed(&[0x40, 0x00, 0x00]).is_empty());
        assert_eq!(asm.reset(), 3);
        assert!(asm.is_idle());
        let frames = asm.feed(&[0x88, 0x00, 0x00, 0x00]);
        assert_eq!(frames.len(), 1);
    }
}
