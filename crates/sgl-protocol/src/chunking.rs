//! Splitting command streams and frames into fixed-size packets, and putting them back
//! together.
//!
//! Command streams travel over TCP as [`FifoUpload`] packets and must arrive complete
//! and in order; any inconsistency is a protocol error. Frames travel over UDP as
//! [`SwapResult`] datagrams where loss and reordering are expected; missing slices
//! simply leave the previous frame's pixels in place.

use thiserror::Error;

use crate::packets::{FifoUpload, SwapResult};
use crate::{SGL_FIFO_UPLOAD_COMMAND_BLOCK_COUNT, SGL_SWAPBUFFERS_RESULT_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("chunk announces zero expected chunks")]
    ZeroChunks,
    #[error("chunk from client {got} while reassembling for client {expected}")]
    ClientMismatch { expected: u32, got: u32 },
    #[error("chunk {got} arrived, expected chunk {expected}")]
    OutOfOrder { expected: u32, got: u32 },
    #[error("expected chunk count changed from {was} to {now}")]
    ExpectedChunksChanged { was: u32, now: u32 },
    #[error("chunk index {index} is outside {expected_chunks} expected chunks")]
    IndexOutOfRange { index: u32, expected_chunks: u32 },
    #[error("non-final chunk {index} carries {count} words")]
    ShortChunk { index: u32, count: usize },
}

/// Number of [`FifoUpload`] packets needed for `words` command words.
pub fn fifo_chunk_count(words: usize) -> usize {
    words.div_ceil(SGL_FIFO_UPLOAD_COMMAND_BLOCK_COUNT)
}

/// Slices a command stream into [`FifoUpload`] packets in index order.
pub fn split_fifo(client_id: u32, words: &[u32]) -> Vec<FifoUpload> {
    let expected_chunks = fifo_chunk_count(words.len()) as u32;
    words
        .chunks(SGL_FIFO_UPLOAD_COMMAND_BLOCK_COUNT)
        .enumerate()
        .map(|(index, chunk)| FifoUpload {
            client_id,
            expected_chunks,
            index: index as u32,
            commands: chunk.to_vec(),
        })
        .collect()
}

/// Server-side reassembly of one client's command stream.
///
/// Any error resets the reassembler so the next stream starts clean.
#[derive(Debug, Clone)]
pub struct FifoReassembler {
    client_id: u32,
    expected_chunks: Option<u32>,
    next_index: u32,
    words: Vec<u32>,
}

impl FifoReassembler {
    pub fn new(client_id: u32) -> Self {
        Self {
            client_id,
            expected_chunks: None,
            next_index: 0,
            words: Vec::new(),
        }
    }

    /// True while a stream is partially received.
    pub fn in_progress(&self) -> bool {
        self.expected_chunks.is_some()
    }

    pub fn reset(&mut self) {
        self.expected_chunks = None;
        self.next_index = 0;
        self.words.clear();
    }

    /// Feeds one packet. Returns the full stream once the last chunk arrives.
    pub fn accept(&mut self, pkt: FifoUpload) -> Result<Option<Vec<u32>>, ChunkError> {
        let res = self.accept_inner(pkt);
        if res.is_err() {
            self.reset();
        }
        res
    }

    fn accept_inner(&mut self, pkt: FifoUpload) -> Result<Option<Vec<u32>>, ChunkError> {
        if pkt.client_id != self.client_id {
            return Err(ChunkError::ClientMismatch {
                expected: self.client_id,
                got: pkt.client_id,
            });
        }
        if pkt.expected_chunks == 0 {
            return Err(ChunkError::ZeroChunks);
        }
        if pkt.index >= pkt.expected_chunks {
            return Err(ChunkError::IndexOutOfRange {
                index: pkt.index,
                expected_chunks: pkt.expected_chunks,
            });
        }
        match self.expected_chunks {
            Some(was) if was != pkt.expected_chunks => {
                return Err(ChunkError::ExpectedChunksChanged {
                    was,
                    now: pkt.expected_chunks,
                });
            }
            _ => {}
        }
        if pkt.index != self.next_index {
            return Err(ChunkError::OutOfOrder {
                expected: self.next_index,
                got: pkt.index,
            });
        }
        let last = pkt.index + 1 == pkt.expected_chunks;
        if !last && pkt.count() != SGL_FIFO_UPLOAD_COMMAND_BLOCK_COUNT {
            return Err(ChunkError::ShortChunk {
                index: pkt.index,
                count: pkt.count(),
            });
        }

        self.expected_chunks = Some(pkt.expected_chunks);
        self.next_index += 1;
        self.words.extend_from_slice(&pkt.commands);

        if last {
            let words = std::mem::take(&mut self.words);
            self.reset();
            Ok(Some(words))
        } else {
            Ok(None)
        }
    }
}

/// Bytes in a `width` x `height` frame at 4 bytes per pixel.
pub fn frame_bytes(width: u32, height: u32) -> usize {
    width as usize * height as usize * 4
}

/// Number of [`SwapResult`] datagrams that carry a `width` x `height` frame.
pub fn swap_chunk_count(width: u32, height: u32) -> usize {
    frame_bytes(width, height).div_ceil(SGL_SWAPBUFFERS_RESULT_SIZE)
}

/// Slices `pixels` into [`SwapResult`] datagrams in index order.
pub fn split_frame(client_id: u32, pixels: &[u8]) -> Vec<SwapResult> {
    pixels
        .chunks(SGL_SWAPBUFFERS_RESULT_SIZE)
        .enumerate()
        .map(|(index, chunk)| SwapResult {
            client_id,
            index: index as u32,
            result: chunk.to_vec(),
        })
        .collect()
}

/// Client-side frame mirror fed by [`SwapResult`] datagrams.
///
/// The pixel buffer persists across frames: slices lost in transit keep the bytes of
/// whatever frame last delivered them.
#[derive(Debug, Clone, Default)]
pub struct FrameAssembler {
    client_id: u32,
    frame: Vec<u8>,
    received: Vec<bool>,
    missing: usize,
}

impl FrameAssembler {
    pub fn new(client_id: u32) -> Self {
        Self {
            client_id,
            ..Self::default()
        }
    }

    /// Starts a new frame of the given size.
    pub fn begin(&mut self, width: u32, height: u32) {
        self.frame.resize(frame_bytes(width, height), 0);
        let chunks = swap_chunk_count(width, height);
        self.received.clear();
        self.received.resize(chunks, false);
        self.missing = chunks;
    }

    /// Copies one datagram into place. Returns `false` for foreign, out-of-range or
    /// duplicate datagrams.
    pub fn accept(&mut self, pkt: &SwapResult) -> bool {
        if pkt.client_id != self.client_id {
            return false;
        }
        let index = pkt.index as usize;
        match self.received.get(index) {
            Some(false) => {}
            _ => return false,
        }
        let start = index * SGL_SWAPBUFFERS_RESULT_SIZE;
        let end = (start + pkt.result.len()).min(self.frame.len());
        if start >= end {
            return false;
        }
        self.frame[start..end].copy_from_slice(&pkt.result[..end - start]);
        self.received[index] = true;
        self.missing -= 1;
        true
    }

    pub fn is_complete(&self) -> bool {
        self.missing == 0
    }

    /// Number of datagrams of the current frame not yet received.
    pub fn missing(&self) -> usize {
        self.missing
    }

    /// Datagrams the current frame is split into.
    pub fn expected(&self) -> usize {
        self.received.len()
    }

    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    pub fn frame_mut(&mut self) -> &mut [u8] {
        &mut self.frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_counts() {
        assert_eq!(fifo_chunk_count(0), 0);
        assert_eq!(fifo_chunk_count(1), 1);
        assert_eq!(fifo_chunk_count(512), 1);
        assert_eq!(fifo_chunk_count(513), 2);
        assert_eq!(swap_chunk_count(100, 150), 1);
        assert_eq!(swap_chunk_count(100, 151), 2);
    }

    #[test]
    fn reassembler_rejects_out_of_order_and_resets() {
        let words: Vec<u32> = (0..1200).collect();
        let mut chunks = split_fifo(4, &words);
        let mut r = FifoReassembler::new(4);
        assert_eq!(r.accept(chunks.remove(0)), Ok(None));
        assert!(r.in_progress());
        // skip chunk 1
        assert_eq!(
            r.accept(chunks.remove(1)),
            Err(ChunkError::OutOfOrder {
                expected: 1,
                got: 2
            })
        );
        assert!(!r.in_progress());
    }

    #[test]
    fn reassembler_rejects_changed_count_and_foreign_client() {
        let mut r = FifoReassembler::new(1);
        let first = FifoUpload {
            client_id: 1,
            expected_chunks: 2,
            index: 0,
            commands: vec![0; 512],
        };
        r.accept(first).unwrap();
        let changed = FifoUpload {
            client_id: 1,
            expected_chunks: 3,
            index: 1,
            commands: vec![0; 512],
        };
        assert_eq!(
            r.accept(changed),
            Err(ChunkError::ExpectedChunksChanged { was: 2, now: 3 })
        );

        let foreign = FifoUpload {
            client_id: 9,
            expected_chunks: 1,
            index: 0,
            commands: vec![0],
        };
        assert_eq!(
            r.accept(foreign),
            Err(ChunkError::ClientMismatch {
                expected: 1,
                got: 9
            })
        );
    }

    #[test]
    fn reassembler_rejects_short_middle_chunk() {
        let mut r = FifoReassembler::new(1);
        let short = FifoUpload {
            client_id: 1,
            expected_chunks: 2,
            index: 0,
            commands: vec![0; 10],
        };
        assert_eq!(
            r.accept(short),
            Err(ChunkError::ShortChunk {
                index: 0,
                count: 10
            })
        );
    }

    #[test]
    fn frame_assembler_filters_and_tracks_missing() {
        let mut a = FrameAssembler::new(3);
        a.begin(200, 100); // 80_000 bytes, 2 datagrams
        assert_eq!(a.expected(), 2);

        let pixels = vec![0x5A; 80_000];
        let parts = split_frame(3, &pixels);
        assert!(!a.accept(&SwapResult {
            client_id: 4,
            ..parts[0].clone()
        }));
        assert!(!a.accept(&SwapResult {
            index: 7,
            ..parts[0].clone()
        }));
        assert!(a.accept(&parts[1]));
        assert!(!a.accept(&parts[1]));
        assert_eq!(a.missing(), 1);
        assert!(a.accept(&parts[0]));
        assert!(a.is_complete());
        assert_eq!(a.frame(), &pixels[..]);
    }

    #[test]
    fn lost_slices_keep_previous_frame() {
        let mut a = FrameAssembler::new(1);
        a.begin(200, 100);
        for p in split_frame(1, &vec![1; 80_000]) {
            a.accept(&p);
        }
        a.begin(200, 100);
        let second = split_frame(1, &vec![2; 80_000]);
        a.accept(&second[0]);
        assert_eq!(a.missing(), 1);
        assert_eq!(a.frame()[0], 2);
        assert_eq!(a.frame()[79_999], 1);
    }
}
