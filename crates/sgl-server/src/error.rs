use sgl_protocol::{ClientId, DecodeError, RegisterError};
use sgl_shm::ShmError;
use thiserror::Error;

/// Failure reported by a [`crate::GlBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("GL {major}.{minor} contexts are not available")]
    UnsupportedVersion { major: u32, minor: u32 },
    #[error("context creation failed: {0}")]
    ContextCreation(String),
    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),
    #[error("GL driver error: {0}")]
    Driver(String),
}

/// Failure while executing one client's command stream. The dispatcher drops the
/// offending connection; other clients are unaffected.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("client {0} has no connection")]
    UnknownClient(ClientId),
    #[error("client {client} sent an undecodable stream")]
    Decode {
        client: ClientId,
        #[source]
        source: DecodeError,
    },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Register(#[from] RegisterError),
    #[error("frame of {len} bytes does not fit the {capacity}-byte framebuffer area")]
    FramebufferOverflow { len: usize, capacity: usize },
    #[error(transparent)]
    Shm(#[from] ShmError),
}

/// Failure bringing up or running a server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Shm(#[from] ShmError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("network I/O failed")]
    Io(#[from] std::io::Error),
}
