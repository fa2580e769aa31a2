//! JHCMD command codec.
//!
//! # Datagram layout (7 bytes)
//!
//! ```text
//! [0..5]  magic       "JHCMD"
//! [5]     opcode      u8
//! [6]     sub-opcode  u8
//! ```
//!
//! The device never answers on the control port; frame traffic on the data
//! port is the only sign a command was accepted.

use std::fmt;

pub const MAGIC: &[u8; 5] = b"JHCMD";
pub const COMMAND_LEN: usize = 7;

/// One encoded control command.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command([u8; COMMAND_LEN]);

impl Command {
    pub const HANDSHAKE_1: Self = Self::encode(0x10, 0x00);
    pub const HANDSHAKE_2: Self = Self::encode(0x20, 0x00);
    pub const START_STREAM: Self = Self::encode(0xD0, 0x01);
    pub const STOP_STREAM: Self = Self::encode(0xD0, 0x02);

    pub const fn encode(opcode: u8, sub_opcode: u8) -> Self {
        Self([
            MAGIC[0], MAGIC[1], MAGIC[2], MAGIC[3], MAGIC[4], opcode, sub_opcode,
        ])
    }

    /// Recognises an encoded command. Anything that is not exactly seven
    /// bytes with the JHCMD magic yields `None`.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() != COMMAND_LEN || !buf.starts_with(MAGIC) {
            return None;
        }
        Some(Self::encode(buf[5], buf[6]))
    }

    pub fn as_bytes(&self) -> &[u8; COMMAND_LEN] {
        &self.0
    }

    pub fn opcode(&self) -> u8 {
        self.0[5]
    }

    pub fn sub_opcode(&self) -> u8 {
        self.0[6]
    }

    /// Symbolic name for the commands this engine issues.
    pub fn name(&self) -> Option<&'static str> {
        match (self.opcode(), self.sub_opcode()) {
            (0x10, 0x00) => Some("HANDSHAKE_1"),
            (0x20, 0x00) => Some("HANDSHAKE_2"),
            (0xD0, 0x01) => Some("START_STREAM"),
            (0xD0, 0x02) => Some("STOP_STREAM"),
            _ => None,
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command({self})")
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "JHCMD {:02X} {:02X}", self.opcode(), self.sub_opcode()),
        }
    }
}
