//! Shared-memory plumbing for SGL.
//!
//! A shared region holds the register file, the command FIFO and the framebuffer
//! (see [`ShmLayout`]). This crate maps the region, views its registers atomically and
//! provides the `LOCK` spinlock and the bounded polling used by both ends of the
//! handshake. The handshake itself lives in `sgl-client` and `sgl-server`.

pub mod error;
pub mod layout;
pub mod poll;
pub mod region;
pub mod registers;
pub mod spinlock;

pub use error::ShmError;
pub use layout::ShmLayout;
pub use poll::{wait_until, Backoff};
pub use region::SharedRegion;
pub use registers::ShmRegisters;
pub use spinlock::{SpinGuard, SpinLock};

/// Default POSIX shared memory object name.
pub const DEFAULT_SHM_NAME: &str = "/sglshm";
