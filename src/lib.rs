//! SGL: OpenGL command streams executed by a remote server.
//!
//! A client records GL calls into a push buffer and submits them either through a
//! POSIX shared-memory region or over TCP/UDP. The server owns one GL context per
//! client, replays the stream and hands back return values and frames.
//!
//! The pieces live in their own crates:
//!
//! - [`protocol`]: command schema, push buffer, register map, network packets.
//! - [`shm`]: the shared region, its layout and the submit lock.
//! - [`client`]: the recording client and both transports.
//! - [`server`]: dispatcher, connection registry, backends and both servers.

pub use sgl_client as client;
pub use sgl_protocol as protocol;
pub use sgl_server as server;
pub use sgl_shm as shm;
