#![forbid(unsafe_code)]

//! SGL remote GL command protocol.
//!
//! Both ends of an SGL link (the client that records GL calls and the server that
//! replays them against a real driver) must agree on everything defined here:
//!
//! - the register file offsets used for the handshake and for return values
//! - the command schema (opcodes and operand layouts)
//! - the push-buffer encoder and the sequential decoder
//! - the fixed-size network packets and the chunking rules that carry a command
//!   stream over TCP and a frame over UDP
//!
//! The crate performs no I/O; transports live in `sgl-shm`, `sgl-client` and
//! `sgl-server`.

pub mod chunking;
pub mod command;
pub mod decode;
pub mod packets;
pub mod push_buffer;
pub mod registers;

use core::fmt;

pub use chunking::{
    fifo_chunk_count, frame_bytes, split_fifo, split_frame, swap_chunk_count, ChunkError,
    FifoReassembler, FrameAssembler,
};
pub use command::{Command, Opcode, Payload};
pub use decode::{CommandReader, DecodeError};
pub use packets::{
    Connect, FifoUpload, Packet, PacketError, Retval, SwapRequest, SwapResult, Sync,
};
pub use push_buffer::{EncodeError, PushBuffer};
pub use registers::{Register, RegisterError, RegisterFile, RegisterMirror};

/// Version of the command schema in [`command`].
///
/// Published by the server (shared-memory `SCHEMA` register, network `Connect` packet)
/// and checked by clients before they submit anything. Bump whenever an opcode's
/// operand layout changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Number of 32-bit command words carried by one [`FifoUpload`] packet.
pub const SGL_FIFO_UPLOAD_COMMAND_BLOCK_COUNT: usize = 512;

/// Number of pixel bytes carried by one [`SwapResult`] datagram.
pub const SGL_SWAPBUFFERS_RESULT_SIZE: usize = 60_000;

/// Clients attempt this many receives per expected swap datagram before giving up.
pub const SWAP_RESULT_OVERPROVISION: usize = 4;

/// Default TCP/UDP port of the network transport.
pub const DEFAULT_PORT: u16 = 3000;

/// Identifier the server assigns to a connected client.
///
/// `0` is reserved for "no client" (e.g. an idle `CONNECT` register).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u32);

impl ClientId {
    pub const NONE: ClientId = ClientId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
