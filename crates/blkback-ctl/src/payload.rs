//! The fixed-shape control message exchanged with the backend daemon.
//!
//! One frame both ways: a type tag, a reply code, and a zero-padded command
//! field, little-endian, always `MESSAGE_LEN` bytes on the wire.

/// Command field capacity, including the NUL-style padding.
pub const COMMAND_LEN: usize = 256;

/// Total frame size: type + reply code + command field.
pub const MESSAGE_LEN: usize = 8 + COMMAND_LEN;

/// Frame type for CLI-originated commands.
pub const TYPE_CLI: u32 = 4;

/// Reply code for an accepted command.
pub const REPLY_OK: u32 = 0;

/// One control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub kind: u32,
    pub reply: u32,
    pub command: String,
}

impl Payload {
    /// Builds a CLI command frame. `command` must fit the fixed field with
    /// room for padding.
    pub fn cli(command: &str) -> Self {
        assert!(command.len() < COMMAND_LEN, "command too long");
        Self { kind: TYPE_CLI, reply: 0, command: command.to_owned() }
    }

    pub fn encode(&self) -> [u8; MESSAGE_LEN] {
        let mut frame = [0u8; MESSAGE_LEN];
        frame[0..4].copy_from_slice(&self.kind.to_le_bytes());
        frame[4..8].copy_from_slice(&self.reply.to_le_bytes());
        frame[8..8 + self.command.len()].copy_from_slice(self.command.as_bytes());
        frame
    }

    pub fn decode(frame: &[u8; MESSAGE_LEN]) -> Self {
        let mut word = [0u8; 4];
        word.copy_from_slice(&frame[0..4]);
        let kind = u32::from_le_bytes(word);
        word.copy_from_slice(&frame[4..8]);
        let reply = u32::from_le_bytes(word);

        let field = &frame[8..];
        let end = field.iter().position(|&b| b == 0).unwrap_or(COMMAND_LEN);
        let command = String::from_utf8_lossy(&field[..end]).into_owned();
        Self { kind, reply, command }
    }
}
