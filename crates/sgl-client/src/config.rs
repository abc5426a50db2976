//! Client configuration from the environment.
//!
//! | variable | meaning | default |
//! |---|---|---|
//! | `SGL_NET_OVER_SHARED` | `host:port` of a network server; selects the network transport | unset (shared memory) |
//! | `SGL_SHM_NAME` | POSIX shared memory object name | `/sglshm` |
//! | `SGL_TIMEOUT_MS` | bound on every blocking wait | `5000` |

use std::time::Duration;

use sgl_protocol::{ClientId, PushBuffer, RegisterFile, Retval};
use sgl_shm::DEFAULT_SHM_NAME;

use crate::client::Client;
use crate::error::{ClientError, ConfigError, TransportError};
use crate::net::NetTransport;
use crate::shm::ShmTransport;
use crate::transport::{SwapParams, Transport};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

const ENV_NET: &str = "SGL_NET_OVER_SHARED";
const ENV_SHM_NAME: &str = "SGL_SHM_NAME";
const ENV_TIMEOUT: &str = "SGL_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportKind {
    SharedMemory { name: String },
    Network { addr: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub transport: TransportKind,
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::SharedMemory {
                name: DEFAULT_SHM_NAME.to_owned(),
            },
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let timeout = match get(ENV_TIMEOUT) {
            None => DEFAULT_TIMEOUT,
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => Duration::from_millis(ms),
                _ => {
                    return Err(ConfigError::InvalidTimeout {
                        var: ENV_TIMEOUT,
                        value: raw,
                    })
                }
            },
        };

        let transport = if let Some(addr) = get(ENV_NET) {
            let addr = addr.trim().to_owned();
            let valid = addr
                .rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
            if !valid {
                return Err(ConfigError::InvalidAddress {
                    var: ENV_NET,
                    value: addr,
                });
            }
            TransportKind::Network { addr }
        } else {
            let name = get(ENV_SHM_NAME).unwrap_or_else(|| DEFAULT_SHM_NAME.to_owned());
            if !name.starts_with('/') || name[1..].contains('/') || name.len() < 2 {
                return Err(ConfigError::InvalidShmName {
                    var: ENV_SHM_NAME,
                    value: name,
                });
            }
            TransportKind::SharedMemory { name }
        };

        Ok(Self { transport, timeout })
    }

    pub fn connect(&self) -> Result<Client<AnyTransport>, ClientError> {
        let transport = match &self.transport {
            TransportKind::SharedMemory { name } => {
                AnyTransport::Shm(ShmTransport::open(name, self.timeout)?)
            }
            TransportKind::Network { addr } => {
                AnyTransport::Net(NetTransport::connect(addr.as_str(), self.timeout)?)
            }
        };
        Ok(Client::new(transport))
    }
}

impl Client<AnyTransport> {
    /// Reads [`ClientConfig::from_env`] and connects.
    pub fn from_env() -> Result<Self, ClientError> {
        ClientConfig::from_env()?.connect()
    }
}

/// Either transport, chosen at runtime.
#[derive(Debug)]
pub enum AnyTransport {
    Shm(ShmTransport),
    Net(NetTransport),
}

macro_rules! delegate {
    ($self:ident, $t:ident => $e:expr) => {
        match $self {
            AnyTransport::Shm($t) => $e,
            AnyTransport::Net($t) => $e,
        }
    };
}

impl Transport for AnyTransport {
    fn client_id(&self) -> ClientId {
        delegate!(self, t => t.client_id())
    }

    fn gl_version(&self) -> (u32, u32) {
        delegate!(self, t => t.gl_version())
    }

    fn capacity(&self) -> usize {
        delegate!(self, t => t.capacity())
    }

    fn submit(&mut self, stream: &[u8]) -> Result<Retval, TransportError> {
        delegate!(self, t => t.submit(stream))
    }

    fn goodbye(&mut self, stream: &[u8]) -> Result<(), TransportError> {
        delegate!(self, t => t.goodbye(stream))
    }

    fn swap_buffers(
        &mut self,
        pending: &mut PushBuffer,
        params: SwapParams,
    ) -> Result<(), TransportError> {
        delegate!(self, t => t.swap_buffers(pending, params))
    }

    fn framebuffer(&mut self) -> &[u8] {
        delegate!(self, t => t.framebuffer())
    }

    fn framebuffer_address(&self) -> *const u8 {
        delegate!(self, t => t.framebuffer_address())
    }

    fn registers(&self) -> &dyn RegisterFile {
        delegate!(self, t => t.registers())
    }

    fn is_closed(&self) -> bool {
        delegate!(self, t => t.is_closed())
    }
}
