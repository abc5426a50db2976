use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("failed to open shared memory object {name:?}")]
    Open {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to size shared memory object {name:?} to {len} bytes")]
    Resize {
        name: String,
        len: usize,
        #[source]
        source: io::Error,
    },
    #[error("failed to map {len} bytes of shared memory")]
    Map {
        len: usize,
        #[source]
        source: io::Error,
    },
    #[error("shared memory objects are not supported on this platform")]
    Unsupported,
    #[error("region of {len} bytes is too small, need at least {min}")]
    TooSmall { len: usize, min: usize },
    #[error("invalid region layout: memsize {memsize:#x}, fifo {fifo_size:#x}")]
    Layout { memsize: usize, fifo_size: usize },
    #[error("access at {offset:#x}+{len} is outside the {region_len}-byte region")]
    OutOfBounds {
        offset: usize,
        len: usize,
        region_len: usize,
    },
    #[error("region is not initialized by a server (magic {found:#010x})")]
    BadMagic { found: u32 },
    #[error("server speaks command schema {server}, this client speaks {client}")]
    SchemaMismatch { server: u32, client: u32 },
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: &'static str, waited: Duration },
}
