//! Client-side command encoder.
//!
//! The push buffer accumulates a little-endian stream of 32-bit units between submits.
//! Byte-granular writes ([`PushBuffer::push_bytes`], [`PushBuffer::push_strided`]) can
//! leave the cursor unaligned; [`PushBuffer::realign`] pads back to a word boundary.

use thiserror::Error;

use crate::command::{Command, Opcode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// A strided copy would read past the end of the source slice.
    #[error("strided copy of {count} x {elem_size} bytes at stride {stride} needs {needed} bytes, source has {available}")]
    StridedOutOfBounds {
        elem_size: usize,
        count: usize,
        stride: usize,
        needed: usize,
        available: usize,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushBuffer {
    bytes: Vec<u8>,
}

impl PushBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(bytes),
        }
    }

    pub fn push_word(&mut self, word: u32) {
        self.bytes.extend_from_slice(&word.to_le_bytes());
    }

    pub fn push_float(&mut self, value: f32) {
        self.push_word(value.to_bits());
    }

    /// Copies tightly packed bytes. Does not realign.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Copies `elem_size` bytes from each of `count` elements spaced `stride` bytes
    /// apart in `src`, producing a tightly packed run. Does not realign.
    ///
    /// A `stride` of zero means tightly packed (`stride == elem_size`), as in GL.
    pub fn push_strided(
        &mut self,
        src: &[u8],
        elem_size: usize,
        count: usize,
        stride: usize,
    ) -> Result<(), EncodeError> {
        let stride = if stride == 0 { elem_size } else { stride };
        let needed = match count {
            0 => 0,
            n => (n - 1)
                .checked_mul(stride)
                .and_then(|v| v.checked_add(elem_size))
                .unwrap_or(usize::MAX),
        };
        if needed > src.len() {
            return Err(EncodeError::StridedOutOfBounds {
                elem_size,
                count,
                stride,
                needed,
                available: src.len(),
            });
        }

        self.bytes.reserve(elem_size * count);
        for i in 0..count {
            let start = i * stride;
            self.bytes.extend_from_slice(&src[start..start + elem_size]);
        }
        Ok(())
    }

    /// Pads with zero bytes to the next 4-byte boundary. Returns the number of padding
    /// bytes written.
    pub fn realign(&mut self) -> usize {
        let pad = (4 - self.bytes.len() % 4) % 4;
        self.bytes.resize(self.bytes.len() + pad, 0);
        pad
    }

    pub fn push_command(&mut self, cmd: &Command) {
        cmd.encode(self);
    }

    /// Terminates the stream with the sentinel opcode.
    pub fn finish(&mut self) {
        self.realign();
        self.push_word(Opcode::Sentinel as u32);
    }

    pub fn reset(&mut self) {
        self.bytes.clear();
    }

    /// Bytes written since the last reset.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The stream as 32-bit words. A trailing partial word is zero-padded.
    pub fn words(&self) -> Vec<u32> {
        self.bytes
            .chunks(4)
            .map(|chunk| {
                let mut word = [0u8; 4];
                word[..chunk.len()].copy_from_slice(chunk);
                u32::from_le_bytes(word)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_are_little_endian() {
        let mut buf = PushBuffer::new();
        buf.push_word(0x0403_0201);
        assert_eq!(buf.as_bytes(), &[1, 2, 3, 4]);
        buf.push_float(1.0);
        assert_eq!(&buf.as_bytes()[4..], &1.0f32.to_bits().to_le_bytes());
        assert_eq!(buf.words(), vec![0x0403_0201, 0x3F80_0000]);
    }

    #[test]
    fn realign_pads_with_zeros() {
        let mut buf = PushBuffer::new();
        assert_eq!(buf.realign(), 0);
        buf.push_bytes(&[0xFF; 5]);
        assert_eq!(buf.realign(), 3);
        assert_eq!(buf.size(), 8);
        assert_eq!(&buf.as_bytes()[5..], &[0, 0, 0]);
        assert_eq!(buf.realign(), 0);
    }

    #[test]
    fn strided_skips_gaps_between_elements() {
        // Three 2-byte elements spaced 3 bytes apart.
        let src = [1, 2, 0xAA, 3, 4, 0xBB, 5, 6];
        let mut buf = PushBuffer::new();
        buf.push_strided(&src, 2, 3, 3).unwrap();
        assert_eq!(buf.as_bytes(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn strided_rejects_short_source() {
        let mut buf = PushBuffer::new();
        let err = buf.push_strided(&[0u8; 10], 4, 3, 4).unwrap_err();
        assert_eq!(
            err,
            EncodeError::StridedOutOfBounds {
                elem_size: 4,
                count: 3,
                stride: 4,
                needed: 12,
                available: 10,
            }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn finish_appends_sentinel() {
        let mut buf = PushBuffer::new();
        buf.push_command(&Command::Clear { mask: 0x4100 });
        buf.finish();
        assert_eq!(buf.words(), vec![7, 0x4100, 0]);
    }
}
