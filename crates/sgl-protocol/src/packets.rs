//! Fixed-size network packets.
//!
//! Every packet is a packed little-endian struct with a fixed byte size. There is no
//! type tag: each channel carries a known packet type at each protocol step, so a
//! receiver always knows what to expect and how many bytes to read.
//!
//! | packet | channel | size |
//! |---|---|---|
//! | [`Connect`] | TCP, server → client, once | 24 |
//! | [`FifoUpload`] | TCP, client → server | 16 + 2048 |
//! | [`Retval`] | TCP, server → client | 264 |
//! | [`Sync`] | TCP, server → client | 4 |
//! | [`SwapRequest`] | UDP, client → server | 20 |
//! | [`SwapResult`] | UDP, server → client | 12 + 60000 |

use thiserror::Error;

use crate::registers::RETVAL_V_WORDS;
use crate::{SGL_FIFO_UPLOAD_COMMAND_BLOCK_COUNT, SGL_SWAPBUFFERS_RESULT_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("{packet} packet must be {expected} bytes, got {got}")]
    WrongSize {
        packet: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("{packet} packet declares {count} entries, at most {max} fit")]
    CountOutOfRange {
        packet: &'static str,
        count: usize,
        max: usize,
    },
}

/// A fixed-size wire packet.
pub trait Packet: Sized {
    const NAME: &'static str;
    const SIZE: usize;

    fn encode_into(&self, out: &mut Vec<u8>);
    fn decode(bytes: &[u8]) -> Result<Self, PacketError>;

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        self.encode_into(&mut out);
        debug_assert_eq!(out.len(), Self::SIZE);
        out
    }
}

fn check_size<P: Packet>(bytes: &[u8]) -> Result<Reader<'_>, PacketError> {
    if bytes.len() != P::SIZE {
        return Err(PacketError::WrongSize {
            packet: P::NAME,
            expected: P::SIZE,
            got: bytes.len(),
        });
    }
    Ok(Reader::new(bytes))
}

/// First packet on every accepted TCP stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connect {
    pub client_id: u32,
    pub fb_size: u32,
    pub fifo_size: u32,
    pub gl_major: u32,
    pub gl_minor: u32,
    pub schema_version: u32,
}

impl Packet for Connect {
    const NAME: &'static str = "Connect";
    const SIZE: usize = 24;

    fn encode_into(&self, out: &mut Vec<u8>) {
        push_u32(out, self.client_id);
        push_u32(out, self.fb_size);
        push_u32(out, self.fifo_size);
        push_u32(out, self.gl_major);
        push_u32(out, self.gl_minor);
        push_u32(out, self.schema_version);
    }

    fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut r = check_size::<Self>(bytes)?;
        Ok(Self {
            client_id: r.u32(),
            fb_size: r.u32(),
            fifo_size: r.u32(),
            gl_major: r.u32(),
            gl_minor: r.u32(),
            schema_version: r.u32(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapRequest {
    pub client_id: u32,
    pub width: u32,
    pub height: u32,
    pub vflip: u32,
    pub format: u32,
}

impl Packet for SwapRequest {
    const NAME: &'static str = "SwapRequest";
    const SIZE: usize = 20;

    fn encode_into(&self, out: &mut Vec<u8>) {
        push_u32(out, self.client_id);
        push_u32(out, self.width);
        push_u32(out, self.height);
        push_u32(out, self.vflip);
        push_u32(out, self.format);
    }

    fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut r = check_size::<Self>(bytes)?;
        Ok(Self {
            client_id: r.u32(),
            width: r.u32(),
            height: r.u32(),
            vflip: r.u32(),
            format: r.u32(),
        })
    }
}

/// One slice of a frame. `result` holds the `size` valid bytes of this slice; the wire
/// form is always zero-padded to [`SGL_SWAPBUFFERS_RESULT_SIZE`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapResult {
    pub client_id: u32,
    pub index: u32,
    pub result: Vec<u8>,
}

impl SwapResult {
    const HEADER: usize = 12;

    pub fn size(&self) -> usize {
        self.result.len()
    }
}

impl Packet for SwapResult {
    const NAME: &'static str = "SwapResult";
    const SIZE: usize = Self::HEADER + SGL_SWAPBUFFERS_RESULT_SIZE;

    fn encode_into(&self, out: &mut Vec<u8>) {
        let len = self.result.len().min(SGL_SWAPBUFFERS_RESULT_SIZE);
        push_u32(out, self.client_id);
        push_u32(out, self.index);
        push_u32(out, len as u32);
        out.extend_from_slice(&self.result[..len]);
        out.resize(out.len() + SGL_SWAPBUFFERS_RESULT_SIZE - len, 0);
    }

    fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut r = check_size::<Self>(bytes)?;
        let client_id = r.u32();
        let index = r.u32();
        let size = r.u32() as usize;
        if size > SGL_SWAPBUFFERS_RESULT_SIZE {
            return Err(PacketError::CountOutOfRange {
                packet: Self::NAME,
                count: size,
                max: SGL_SWAPBUFFERS_RESULT_SIZE,
            });
        }
        Ok(Self {
            client_id,
            index,
            result: r.bytes(size).to_vec(),
        })
    }
}

/// One slice of a submitted command stream. `commands.len()` is the wire `count`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FifoUpload {
    pub client_id: u32,
    pub expected_chunks: u32,
    pub index: u32,
    pub commands: Vec<u32>,
}

impl FifoUpload {
    const HEADER: usize = 16;

    pub fn count(&self) -> usize {
        self.commands.len()
    }
}

impl Packet for FifoUpload {
    const NAME: &'static str = "FifoUpload";
    const SIZE: usize = Self::HEADER + SGL_FIFO_UPLOAD_COMMAND_BLOCK_COUNT * 4;

    fn encode_into(&self, out: &mut Vec<u8>) {
        let count = self.commands.len().min(SGL_FIFO_UPLOAD_COMMAND_BLOCK_COUNT);
        push_u32(out, self.client_id);
        push_u32(out, self.expected_chunks);
        push_u32(out, self.index);
        push_u32(out, count as u32);
        for word in &self.commands[..count] {
            push_u32(out, *word);
        }
        out.resize(out.len() + (SGL_FIFO_UPLOAD_COMMAND_BLOCK_COUNT - count) * 4, 0);
    }

    fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut r = check_size::<Self>(bytes)?;
        let client_id = r.u32();
        let expected_chunks = r.u32();
        let index = r.u32();
        let count = r.u32() as usize;
        if count > SGL_FIFO_UPLOAD_COMMAND_BLOCK_COUNT {
            return Err(PacketError::CountOutOfRange {
                packet: Self::NAME,
                count,
                max: SGL_FIFO_UPLOAD_COMMAND_BLOCK_COUNT,
            });
        }
        let commands = (0..count).map(|_| r.u32()).collect();
        Ok(Self {
            client_id,
            expected_chunks,
            index,
            commands,
        })
    }
}

/// Return values of the last submit: the `RETVAL` scalar and the `RETVAL_V` vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retval {
    pub value: u64,
    pub vector: [u32; RETVAL_V_WORDS],
}

impl Default for Retval {
    fn default() -> Self {
        Self {
            value: 0,
            vector: [0; RETVAL_V_WORDS],
        }
    }
}

impl Retval {
    pub fn scalar(value: u64) -> Self {
        Self {
            value,
            ..Self::default()
        }
    }

    /// Low and high 32-bit halves of the scalar.
    pub fn halves(&self) -> (u32, u32) {
        (self.value as u32, (self.value >> 32) as u32)
    }

    /// Packs `bytes` into the vector, truncated to 256 bytes, zero-filled.
    pub fn from_bytes(value: u64, bytes: &[u8]) -> Self {
        let mut vector = [0u32; RETVAL_V_WORDS];
        for (word, chunk) in vector.iter_mut().zip(bytes.chunks(4)) {
            let mut raw = [0u8; 4];
            raw[..chunk.len()].copy_from_slice(chunk);
            *word = u32::from_le_bytes(raw);
        }
        Self { value, vector }
    }

    pub fn vector_bytes(&self) -> Vec<u8> {
        self.vector.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Reads the vector as a NUL-terminated string (e.g. a `glGetString` reply).
    pub fn string(&self) -> String {
        let bytes = self.vector_bytes();
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    }
}

impl Packet for Retval {
    const NAME: &'static str = "Retval";
    const SIZE: usize = 8 + RETVAL_V_WORDS * 4;

    fn encode_into(&self, out: &mut Vec<u8>) {
        let (lo, hi) = self.halves();
        push_u32(out, lo);
        push_u32(out, hi);
        for word in &self.vector {
            push_u32(out, *word);
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut r = check_size::<Self>(bytes)?;
        let lo = r.u32() as u64;
        let hi = r.u32() as u64;
        let mut vector = [0u32; RETVAL_V_WORDS];
        for word in &mut vector {
            *word = r.u32();
        }
        Ok(Self {
            value: lo | (hi << 32),
            vector,
        })
    }
}

/// Barrier sent before a frame's pixels go out over UDP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sync {
    pub sync: u32,
}

impl Packet for Sync {
    const NAME: &'static str = "Sync";
    const SIZE: usize = 4;

    fn encode_into(&self, out: &mut Vec<u8>) {
        push_u32(out, self.sync);
    }

    fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut r = check_size::<Self>(bytes)?;
        Ok(Self { sync: r.u32() })
    }
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Cursor over a buffer whose length was already checked against the packet size.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn u32(&mut self) -> u32 {
        let b = &self.bytes[self.pos..self.pos + 4];
        self.pos += 4;
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    fn bytes(&mut self, len: usize) -> &'a [u8] {
        let out = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sizes_match_the_wire_table() {
        assert_eq!(Connect::SIZE, 24);
        assert_eq!(SwapRequest::SIZE, 20);
        assert_eq!(SwapResult::SIZE, 60_012);
        assert_eq!(FifoUpload::SIZE, 2_064);
        assert_eq!(Retval::SIZE, 264);
        assert_eq!(Sync::SIZE, 4);
    }

    #[test]
    fn connect_layout_is_packed_le() {
        let pkt = Connect {
            client_id: 1,
            fb_size: 2,
            fifo_size: 3,
            gl_major: 4,
            gl_minor: 5,
            schema_version: 6,
        };
        let bytes = pkt.encode();
        assert_eq!(&bytes[..8], &[1, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(Connect::decode(&bytes), Ok(pkt));
    }

    #[test]
    fn wrong_size_is_rejected() {
        assert_eq!(
            Sync::decode(&[0; 3]),
            Err(PacketError::WrongSize {
                packet: "Sync",
                expected: 4,
                got: 3
            })
        );
    }

    #[test]
    fn fifo_upload_pads_and_trims() {
        let pkt = FifoUpload {
            client_id: 7,
            expected_chunks: 1,
            index: 0,
            commands: vec![1, 2, 3],
        };
        let bytes = pkt.encode();
        assert_eq!(bytes.len(), FifoUpload::SIZE);
        assert_eq!(&bytes[12..16], &3u32.to_le_bytes());
        assert_eq!(FifoUpload::decode(&bytes), Ok(pkt));
    }

    #[test]
    fn fifo_upload_count_is_bounded() {
        let mut bytes = FifoUpload {
            client_id: 7,
            expected_chunks: 1,
            index: 0,
            commands: vec![],
        }
        .encode();
        bytes[12..16].copy_from_slice(&513u32.to_le_bytes());
        assert_eq!(
            FifoUpload::decode(&bytes),
            Err(PacketError::CountOutOfRange {
                packet: "FifoUpload",
                count: 513,
                max: 512
            })
        );
    }

    #[test]
    fn swap_result_keeps_only_valid_bytes() {
        let pkt = SwapResult {
            client_id: 2,
            index: 5,
            result: vec![9; 100],
        };
        let decoded = SwapResult::decode(&pkt.encode()).unwrap();
        assert_eq!(decoded.size(), 100);
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn retval_splits_scalar_into_halves() {
        let r = Retval::scalar(0x1122_3344_5566_7788);
        assert_eq!(r.halves(), (0x5566_7788, 0x1122_3344));
        let bytes = r.encode();
        assert_eq!(&bytes[..4], &0x5566_7788u32.to_le_bytes());
        assert_eq!(Retval::decode(&bytes), Ok(r));
    }

    #[test]
    fn retval_string_stops_at_nul() {
        let r = Retval::from_bytes(0, b"4.6 sgl\0garbage");
        assert_eq!(r.string(), "4.6 sgl");
    }
}
