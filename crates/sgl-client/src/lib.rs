//! Client side of SGL.
//!
//! A [`Client`] records GL calls into a push buffer and hands finished streams to a
//! [`Transport`]: [`ShmTransport`] over a shared region, or [`NetTransport`] over
//! TCP/UDP. [`ClientConfig::from_env`] picks one the way the hook layers expect.

pub mod client;
pub mod config;
pub mod error;
pub mod net;
pub mod shm;
pub mod transport;

pub use client::Client;
pub use config::{AnyTransport, ClientConfig, TransportKind, DEFAULT_TIMEOUT};
pub use error::{ClientError, ConfigError, TransportError};
pub use net::NetTransport;
pub use shm::ShmTransport;
pub use transport::{SwapParams, Transport};
