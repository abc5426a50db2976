//! Sequential command decoder.

use thiserror::Error;

use crate::command::{Command, Opcode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The stream ended before a complete command or the sentinel.
    #[error("command stream ended at byte {offset} without a sentinel")]
    UnexpectedEof { offset: usize },
    #[error("unknown opcode {opcode} at byte {offset}")]
    UnknownOpcode { opcode: u32, offset: usize },
    #[error("payload of {len} bytes at byte {offset} overruns the stream")]
    PayloadOverrun { len: usize, offset: usize },
}

impl DecodeError {
    /// Byte offset in the stream where decoding failed.
    pub fn offset(&self) -> usize {
        match *self {
            DecodeError::UnexpectedEof { offset }
            | DecodeError::UnknownOpcode { offset, .. }
            | DecodeError::PayloadOverrun { offset, .. } => offset,
        }
    }
}

/// Reads commands out of a submitted stream, one at a time.
///
/// There is no length prefix per command; the opcode alone determines how many operand
/// words follow.
#[derive(Debug, Clone)]
pub struct CommandReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> CommandReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn read_word(&mut self) -> Result<u32, DecodeError> {
        let end = self.pos + 4;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or(DecodeError::UnexpectedEof { offset: self.pos })?;
        self.pos = end;
        Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
    }

    pub fn read_float(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_bits(self.read_word()?))
    }

    /// Reads `len` bytes and skips the padding up to the next word boundary.
    pub fn read_padded(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let padded = len
            .checked_add(3)
            .map(|v| v & !3)
            .ok_or(DecodeError::PayloadOverrun {
                len,
                offset: self.pos,
            })?;
        if padded > self.remaining() {
            return Err(DecodeError::PayloadOverrun {
                len,
                offset: self.pos,
            });
        }
        let data = &self.bytes[self.pos..self.pos + len];
        self.pos += padded;
        Ok(data)
    }

    pub fn read_opcode(&mut self) -> Result<Opcode, DecodeError> {
        let offset = self.pos;
        let raw = self.read_word()?;
        Opcode::from_u32(raw).ok_or(DecodeError::UnknownOpcode {
            opcode: raw,
            offset,
        })
    }

    /// Decodes the next command. Returns `Ok(None)` once the sentinel is consumed.
    pub fn next_command(&mut self) -> Result<Option<Command>, DecodeError> {
        let opcode = self.read_opcode()?;
        Command::decode_operands(opcode, self)
    }

    /// Decodes everything up to the sentinel.
    pub fn collect_commands(&mut self) -> Result<Vec<Command>, DecodeError> {
        let mut out = Vec::new();
        while let Some(cmd) = self.next_command()? {
            out.push(cmd);
        }
        Ok(out)
    }
}
