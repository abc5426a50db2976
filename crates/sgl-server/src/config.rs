use std::net::SocketAddr;

use clap::{Parser, ValueEnum};
use sgl_shm::{ShmError, ShmLayout, DEFAULT_SHM_NAME};
use thiserror::Error;

use crate::net_server::NetConfig;
use crate::software::MAX_VERSION;

const MIB: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Serve a POSIX shared memory region.
    Shm,
    /// Serve TCP/UDP clients.
    Net,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "sgl-server", version, about = "Executes remote SGL command streams")]
pub struct Args {
    /// Transport to serve.
    ///
    /// Environment variable: `SGL_MODE`.
    #[arg(long, env = "SGL_MODE", value_enum, default_value_t = Mode::Shm)]
    pub mode: Mode,

    /// POSIX shared memory object name.
    ///
    /// Environment variable: `SGL_SHM_NAME`.
    #[arg(long, env = "SGL_SHM_NAME", default_value = DEFAULT_SHM_NAME)]
    pub shm_name: String,

    /// Size of the shared region in MiB (registers, FIFO and framebuffer).
    ///
    /// Environment variable: `SGL_MEMORY_MB`.
    #[arg(long, env = "SGL_MEMORY_MB", default_value_t = 32)]
    pub memory_mb: usize,

    /// Bytes of the region reserved for command streams, in MiB.
    ///
    /// Environment variable: `SGL_FIFO_MB`.
    #[arg(long, env = "SGL_FIFO_MB", default_value_t = 8)]
    pub fifo_mb: usize,

    /// Address TCP and UDP listen on in network mode.
    ///
    /// Environment variable: `SGL_LISTEN_ADDR`.
    #[arg(long, env = "SGL_LISTEN_ADDR", default_value = "0.0.0.0:3000")]
    pub listen_addr: SocketAddr,

    /// GL major version requested for client contexts.
    ///
    /// Environment variable: `SGL_GL_MAJOR`.
    #[arg(long, env = "SGL_GL_MAJOR", default_value_t = 3)]
    pub gl_major: u32,

    /// GL minor version requested for client contexts.
    ///
    /// Environment variable: `SGL_GL_MINOR`.
    #[arg(long, env = "SGL_GL_MINOR", default_value_t = 3)]
    pub gl_minor: u32,

    /// Log filter (tracing-subscriber EnvFilter syntax), used when `RUST_LOG` is unset.
    ///
    /// Environment variable: `SGL_LOG_LEVEL`.
    #[arg(long, env = "SGL_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid region layout ({memory_mb} MiB region, {fifo_mb} MiB FIFO)")]
    Layout {
        memory_mb: usize,
        fifo_mb: usize,
        #[source]
        source: ShmError,
    },
    #[error("GL {major}.{minor} is not available (newest is {}.{})", MAX_VERSION.0, MAX_VERSION.1)]
    GlVersion { major: u32, minor: u32 },
    #[error("shared memory name {0:?} must start with '/' and contain no other '/'")]
    ShmName(String),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub mode: Mode,
    pub shm_name: String,
    pub layout: ShmLayout,
    pub listen_addr: SocketAddr,
    pub gl_version: (u32, u32),
    pub log_level: String,
}

impl ServerConfig {
    /// Parses the process arguments and environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let layout_err = |source: ShmError| ConfigError::Layout {
            memory_mb: args.memory_mb,
            fifo_mb: args.fifo_mb,
            source,
        };
        let memsize = args.memory_mb.saturating_mul(MIB);
        let fifo_size = args.fifo_mb.saturating_mul(MIB);
        let layout = ShmLayout::new(memsize, fifo_size).map_err(layout_err)?;

        let gl_version = (args.gl_major, args.gl_minor);
        if gl_version > MAX_VERSION || args.gl_major == 0 {
            return Err(ConfigError::GlVersion {
                major: args.gl_major,
                minor: args.gl_minor,
            });
        }

        let name = args.shm_name.trim();
        if !name.starts_with('/') || name.len() < 2 || name[1..].contains('/') {
            return Err(ConfigError::ShmName(args.shm_name));
        }

        Ok(Self {
            mode: args.mode,
            shm_name: name.to_owned(),
            layout,
            listen_addr: args.listen_addr,
            gl_version,
            log_level: args.log_level,
        })
    }

    /// Settings for [`crate::net_server::start_server`].
    pub fn net(&self) -> NetConfig {
        NetConfig {
            listen: self.listen_addr,
            gl_version: self.gl_version,
            fifo_size: self.layout.fifo_size() as u32,
            fb_size: self.layout.framebuffer_size() as u32,
        }
    }
}
