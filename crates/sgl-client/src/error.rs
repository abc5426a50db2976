use std::io;
use std::time::Duration;

use sgl_protocol::{EncodeError, PacketError, RegisterError};
use sgl_shm::ShmError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Shm(#[from] ShmError),
    #[error("network I/O failed")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Register(#[from] RegisterError),
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: &'static str, waited: Duration },
    #[error("server speaks command schema {server}, this client speaks {client}")]
    SchemaMismatch { server: u32, client: u32 },
    #[error("server rejected the command stream and dropped the connection")]
    Rejected,
    #[error("connection already closed")]
    Closed,
    #[error("command stream of {len} bytes exceeds the {capacity}-byte FIFO")]
    FifoOverflow { len: usize, capacity: usize },
}

impl TransportError {
    /// Maps read timeouts on sockets with a deadline to [`TransportError::Timeout`].
    pub(crate) fn from_io(err: io::Error, what: &'static str, waited: Duration) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                TransportError::Timeout { what, waited }
            }
            _ => TransportError::Io(err),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout { .. } | TransportError::Shm(ShmError::Timeout { .. })
        )
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Register(#[from] RegisterError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("command of {size} bytes does not fit the {capacity}-byte FIFO")]
    CommandTooLarge { size: usize, capacity: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is not a host:port address")]
    InvalidAddress { var: &'static str, value: String },
    #[error("{var}={value:?} is not a number of milliseconds")]
    InvalidTimeout { var: &'static str, value: String },
    #[error("{var}={value:?} is not a shared memory object name")]
    InvalidShmName { var: &'static str, value: String },
}
