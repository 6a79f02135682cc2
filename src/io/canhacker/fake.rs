// src/io/canhacker/fake.rs
//
// Scripted CanHacker adapter for tests. Answers every control command
// positively unless one of the switches below says otherwise.

use super::codec::{command, ANSWER_BIT, SYNC_ANSWER_FRAME, SYNC_FRAME};
use crate::io::serial::mock::MockChannel;

#[derive(Clone, Debug)]
pub(crate) struct FakeAdapter {
    /// Answer this command negatively (answer bit clear)
    pub reject: Option<u8>,
    /// Never answer this command
    pub silent: Option<u8>,
    /// Answer the first command positively but under the second command's code
    pub answer_as: Option<(u8, u8)>,
    pub hardware_id: u8,
}

impl Default for FakeAdapter {
    fn default() -> Self {
        Self {
            reject: None,
            silent: None,
            answer_as: None,
            hardware_id: 0x11,
        }
    }
}

impl FakeAdapter {
    pub(crate) fn rejecting(cmd: u8) -> Self {
        Self {
            reject: Some(cmd),
            ..Self::default()
        }
    }

    pub(crate) fn silent_on(cmd: u8) -> Self {
        Self {
            silent: Some(cmd),
            ..Self::default()
        }
    }

    pub(crate) fn answering_as(cmd: u8, answer: u8) -> Self {
        Self {
            answer_as: Some((cmd, answer)),
            ..Self::default()
        }
    }

    pub(crate) fn into_channel(self) -> MockChannel {
        MockChannel::with_responder(move |written| self.reply(written))
    }

    fn reply(&self, written: &[u8]) -> Vec<u8> {
        if written == SYNC_FRAME {
            return match (self.silent, self.reject) {
                (Some(command::SYNC), _) => Vec::new(),
                (_, Some(command::SYNC)) => vec![command::SYNC_ANSWER, 0x00, command::SYNC_ANSWER, 0x01],
                _ => SYNC_ANSWER_FRAME.to_vec(),
            };
        }
        if written.len() < 4 || written[0] == command::MESSAGE {
            return Vec::new();
        }

        let (cmd, seq, flags) = (written[0], written[1], written[2]);
        if self.silent == Some(cmd) {
            return Vec::new();
        }
        if self.reject == Some(cmd) {
            return vec![cmd, seq, flags, 0x00];
        }

        let cmd = match self.answer_as {
            Some((from, to)) if from == cmd => to,
            _ => cmd,
        };
        let payload: Vec<u8> = match cmd {
            command::DEVICE_HW => vec![self.hardware_id],
            command::DEVICE_INFO => b"CAN-Hacker".to_vec(),
            command::DEVICE_FIRMWARE => b"3.3.1".to_vec(),
            command::DEVICE_SERIAL => b"0011AABB\0".to_vec(),
            _ => Vec::new(),
        };
        // Leading padding byte, as real adapters emit between frames.
        let mut out = vec![0x00, cmd | ANSWER_BIT, seq, flags, payload.len() as u8];
        out.extend_from_slice(&payload);
        out
    }
}
