//! SGL server: executes command streams recorded by `sgl-client` against a GL backend.
//!
//! - [`GlBackend`] is the seam to a real driver; [`SoftwareBackend`] is the bundled
//!   headless implementation.
//! - [`Dispatcher`] decodes and runs one client's stream at a time, with per-client
//!   contexts kept in a [`ConnectionRegistry`].
//! - [`ShmServer`] serves a shared memory region by polling its registers;
//!   [`net_server::start_server`] serves TCP/UDP clients.

pub mod backend;
#[cfg(not(target_arch = "wasm32"))]
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gl;
#[cfg(not(target_arch = "wasm32"))]
pub mod net_server;
pub mod registry;
pub mod shm_server;
pub mod software;

pub use backend::{GlBackend, ReadbackRequest, Reply};
#[cfg(not(target_arch = "wasm32"))]
pub use config::{Mode, ServerConfig};
pub use dispatcher::{DispatchSink, Dispatcher, StreamOutcome};
pub use error::{BackendError, DispatchError, ServerError};
#[cfg(not(target_arch = "wasm32"))]
pub use net_server::{start_server, NetConfig, ServerHandle};
pub use registry::{Connection, ConnectionRegistry, PendingUpload};
pub use shm_server::ShmServer;
pub use software::{SoftwareBackend, SoftwareContext};
