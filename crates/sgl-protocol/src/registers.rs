//! Register file contract.
//!
//! The register file is a block of fixed-offset scalars at the start of the shared
//! region. Shared-memory transports access it in place; network transports keep a
//! [`RegisterMirror`] that only covers the registers a client can observe.

use thiserror::Error;

use crate::packets::Retval;

/// Byte offset where the FIFO area starts. Everything below is register space.
pub const COMMAND_START: usize = 0x1000;

/// Number of 32-bit words in `RETVAL_V`.
pub const RETVAL_V_WORDS: usize = 64;

/// `b"SGL1"` as a little-endian `u32`, stored in `MAGIC` once a server initialized the
/// region.
pub const SHM_MAGIC: u32 = 0x314C_4753;

/// Byte offsets of every register.
pub mod offset {
    pub const MAGIC: usize = 0x00;
    pub const SCHEMA: usize = 0x04;
    pub const LOCK: usize = 0x08;
    pub const CLAIM_ID: usize = 0x0C;
    pub const CONNECT: usize = 0x10;
    pub const READY_HINT: usize = 0x14;
    pub const SUBMIT: usize = 0x18;
    pub const FBSTART: usize = 0x1C;
    pub const MEMSIZE: usize = 0x20;
    pub const GLMAJ: usize = 0x24;
    pub const GLMIN: usize = 0x28;
    pub const SWAP_SYNC: usize = 0x2C;
    pub const RETVAL: usize = 0x30; // 8 bytes
    pub const RETVAL_V: usize = 0x40;
    pub const END: usize = RETVAL_V + super::RETVAL_V_WORDS * 4;
}

/// Values of the `SUBMIT` register.
pub mod submit_state {
    /// No stream pending; also the server's acknowledgement.
    pub const IDLE: u32 = 0;
    /// A client copied a stream into the FIFO and waits for the server.
    pub const PENDING: u32 = 1;
    /// The server refused the stream (undecodable) and dropped the connection.
    pub const REJECTED: u32 = 2;
    /// The server took the stream and is executing it.
    pub const RUNNING: u32 = 3;
    /// The submitter stopped waiting. The server discards the stream and drops that
    /// connection, then stores `IDLE`.
    pub const ABANDONED: u32 = 4;

    /// Whether the FIFO still belongs to a submitted stream.
    pub fn in_flight(state: u32) -> bool {
        matches!(state, PENDING | RUNNING | ABANDONED)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Magic,
    Schema,
    Lock,
    ClaimId,
    Connect,
    ReadyHint,
    Submit,
    FbStart,
    MemSize,
    GlMajor,
    GlMinor,
    SwapSync,
    /// 64-bit scalar return value.
    Retval,
    /// One word of the vector return value.
    RetvalV(u8),
}

impl Register {
    pub const fn offset(self) -> usize {
        match self {
            Register::Magic => offset::MAGIC,
            Register::Schema => offset::SCHEMA,
            Register::Lock => offset::LOCK,
            Register::ClaimId => offset::CLAIM_ID,
            Register::Connect => offset::CONNECT,
            Register::ReadyHint => offset::READY_HINT,
            Register::Submit => offset::SUBMIT,
            Register::FbStart => offset::FBSTART,
            Register::MemSize => offset::MEMSIZE,
            Register::GlMajor => offset::GLMAJ,
            Register::GlMinor => offset::GLMIN,
            Register::SwapSync => offset::SWAP_SYNC,
            Register::Retval => offset::RETVAL,
            Register::RetvalV(i) => offset::RETVAL_V + (i as usize) * 4,
        }
    }

    /// Width in bytes.
    pub const fn width(self) -> usize {
        match self {
            Register::Retval => 8,
            _ => 4,
        }
    }

    pub fn from_offset(off: usize) -> Option<Register> {
        let reg = match off {
            offset::MAGIC => Register::Magic,
            offset::SCHEMA => Register::Schema,
            offset::LOCK => Register::Lock,
            offset::CLAIM_ID => Register::ClaimId,
            offset::CONNECT => Register::Connect,
            offset::READY_HINT => Register::ReadyHint,
            offset::SUBMIT => Register::Submit,
            offset::FBSTART => Register::FbStart,
            offset::MEMSIZE => Register::MemSize,
            offset::GLMAJ => Register::GlMajor,
            offset::GLMIN => Register::GlMinor,
            offset::SWAP_SYNC => Register::SwapSync,
            offset::RETVAL => Register::Retval,
            off if (offset::RETVAL_V..offset::END).contains(&off) && off % 4 == 0 => {
                Register::RetvalV(((off - offset::RETVAL_V) / 4) as u8)
            }
            _ => return None,
        };
        Some(reg)
    }

    /// Checks that `self` is a valid register accessed with `width` bytes.
    pub fn expect_width(self, width: usize) -> Result<(), RegisterError> {
        if let Register::RetvalV(i) = self {
            if i as usize >= RETVAL_V_WORDS {
                return Err(RegisterError::VectorIndex(i));
            }
        }
        if self.width() != width {
            return Err(RegisterError::WidthMismatch {
                reg: self,
                width: self.width(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("register {0:?} is not available on this transport")]
    Unsupported(Register),
    #[error("register {reg:?} is {width} bytes wide")]
    WidthMismatch { reg: Register, width: usize },
    #[error("RETVAL_V index {0} out of range")]
    VectorIndex(u8),
}

/// Scalar access to the register file.
pub trait RegisterFile {
    fn read(&self, reg: Register) -> Result<u32, RegisterError>;
    fn read64(&self, reg: Register) -> Result<u64, RegisterError>;
    fn write(&mut self, reg: Register, value: u32) -> Result<(), RegisterError>;
    fn write64(&mut self, reg: Register, value: u64) -> Result<(), RegisterError>;

    /// Writes `words` to the start of `RETVAL_V`. Extra words are dropped.
    fn write_vector(&mut self, words: &[u32]) -> Result<(), RegisterError> {
        for (i, word) in words.iter().take(RETVAL_V_WORDS).enumerate() {
            self.write(Register::RetvalV(i as u8), *word)?;
        }
        Ok(())
    }

    fn read_vector(&self) -> Result<[u32; RETVAL_V_WORDS], RegisterError> {
        let mut out = [0u32; RETVAL_V_WORDS];
        for (i, word) in out.iter_mut().enumerate() {
            *word = self.read(Register::RetvalV(i as u8))?;
        }
        Ok(out)
    }

    /// Snapshot of `RETVAL` and `RETVAL_V`.
    fn retval(&self) -> Result<Retval, RegisterError> {
        Ok(Retval {
            value: self.read64(Register::Retval)?,
            vector: self.read_vector()?,
        })
    }
}

/// Private register copy used by the network transport.
///
/// Only the registers a network client can observe are backed; everything else
/// reports [`RegisterError::Unsupported`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMirror {
    retval: u64,
    retval_v: [u32; RETVAL_V_WORDS],
    gl_major: u32,
    gl_minor: u32,
    swap_sync: u32,
}

impl Default for RegisterMirror {
    fn default() -> Self {
        Self {
            retval: 0,
            retval_v: [0; RETVAL_V_WORDS],
            gl_major: 0,
            gl_minor: 0,
            swap_sync: 0,
        }
    }
}

impl RegisterMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_retval(&mut self, retval: &Retval) {
        self.retval = retval.value;
        self.retval_v = retval.vector;
    }

    pub fn clear_retval(&mut self) {
        self.retval = 0;
        self.retval_v = [0; RETVAL_V_WORDS];
    }
}

impl RegisterFile for RegisterMirror {
    fn read(&self, reg: Register) -> Result<u32, RegisterError> {
        reg.expect_width(4)?;
        match reg {
            Register::GlMajor => Ok(self.gl_major),
            Register::GlMinor => Ok(self.gl_minor),
            Register::SwapSync => Ok(self.swap_sync),
            Register::RetvalV(i) => Ok(self.retval_v[i as usize]),
            other => Err(RegisterError::Unsupported(other)),
        }
    }

    fn read64(&self, reg: Register) -> Result<u64, RegisterError> {
        reg.expect_width(8)?;
        Ok(self.retval)
    }

    fn write(&mut self, reg: Register, value: u32) -> Result<(), RegisterError> {
        reg.expect_width(4)?;
        match reg {
            Register::GlMajor => self.gl_major = value,
            Register::GlMinor => self.gl_minor = value,
            Register::SwapSync => self.swap_sync = value,
            Register::RetvalV(i) => self.retval_v[i as usize] = value,
            other => return Err(RegisterError::Unsupported(other)),
        }
        Ok(())
    }

    fn write64(&mut self, reg: Register, value: u64) -> Result<(), RegisterError> {
        reg.expect_width(8)?;
        self.retval = value;
        Ok(())
    }
}
