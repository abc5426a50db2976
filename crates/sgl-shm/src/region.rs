//! The mapped memory block shared by client and server.
//!
//! Two providers exist:
//! - POSIX shared memory objects (`shm_open` + `mmap`), used across processes. The
//!   server creates and sizes the object; clients open it by name. The creator
//!   unlinks the name when its mapping is dropped.
//! - A zeroed heap allocation, used in tests and when client and server live in the
//!   same process.
//!
//! All control words are accessed through atomics. Bulk FIFO and framebuffer copies are
//! plain memory copies; the register handshake orders them.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicU64};

use crate::error::ShmError;

enum Backing {
    Heap(#[allow(dead_code)] Box<[AtomicU64]>),
    #[cfg(unix)]
    Posix { name: String, owner: bool },
}

pub struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
}

// SAFETY: the region is plain shared memory. Control words are only touched through
// atomics and bulk copies are serialized by the LOCK/SUBMIT handshake.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl core::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut s = f.debug_struct("SharedRegion");
        s.field("len", &self.len);
        match &self.backing {
            Backing::Heap(_) => s.field("backing", &"heap"),
            #[cfg(unix)]
            Backing::Posix { name, owner } => s.field("name", name).field("owner", owner),
        };
        s.finish()
    }
}

impl SharedRegion {
    /// Allocates a zeroed, 8-byte aligned in-process region.
    pub fn heap(len: usize) -> Self {
        let words = len.div_ceil(8).max(1);
        let storage: Box<[AtomicU64]> = (0..words).map(|_| AtomicU64::new(0)).collect();
        let ptr = NonNull::from(&*storage).cast::<u8>();
        Self {
            ptr,
            len,
            backing: Backing::Heap(storage),
        }
    }

    /// Creates (or reuses) the named POSIX shared memory object, sizes it to `len` and
    /// maps it. The name is unlinked when the returned region is dropped.
    #[cfg(unix)]
    pub fn create(name: &str, len: usize) -> Result<Self, ShmError> {
        use nix::fcntl::OFlag;
        use nix::sys::stat::Mode;

        let fd = nix::sys::mman::shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| ShmError::Open {
            name: name.to_owned(),
            source: e.into(),
        })?;
        let file = std::fs::File::from(fd);
        file.set_len(len as u64).map_err(|source| ShmError::Resize {
            name: name.to_owned(),
            len,
            source,
        })?;
        let ptr = map_shared(&file, len)?;
        tracing::debug!(name, len, "created shared memory region");
        Ok(Self {
            ptr,
            len,
            backing: Backing::Posix {
                name: name.to_owned(),
                owner: true,
            },
        })
    }

    /// Opens and maps an existing POSIX shared memory object created by a server.
    #[cfg(unix)]
    pub fn open(name: &str) -> Result<Self, ShmError> {
        use nix::fcntl::OFlag;
        use nix::sys::stat::Mode;

        let fd = nix::sys::mman::shm_open(name, OFlag::O_RDWR, Mode::empty()).map_err(|e| {
            ShmError::Open {
                name: name.to_owned(),
                source: e.into(),
            }
        })?;
        let file = std::fs::File::from(fd);
        let len = file
            .metadata()
            .map_err(|source| ShmError::Open {
                name: name.to_owned(),
                source,
            })?
            .len() as usize;
        if len < sgl_protocol::registers::COMMAND_START {
            return Err(ShmError::TooSmall {
                len,
                min: sgl_protocol::registers::COMMAND_START,
            });
        }
        let ptr = map_shared(&file, len)?;
        tracing::debug!(name, len, "opened shared memory region");
        Ok(Self {
            ptr,
            len,
            backing: Backing::Posix {
                name: name.to_owned(),
                owner: false,
            },
        })
    }

    #[cfg(not(unix))]
    pub fn create(_name: &str, _len: usize) -> Result<Self, ShmError> {
        Err(ShmError::Unsupported)
    }

    #[cfg(not(unix))]
    pub fn open(_name: &str) -> Result<Self, ShmError> {
        Err(ShmError::Unsupported)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Atomic view of the aligned 32-bit word at `offset`.
    ///
    /// # Panics
    /// If `offset` is misaligned or out of bounds.
    pub fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        assert!(offset % 4 == 0 && offset + 4 <= self.len, "bad u32 offset {offset:#x}");
        // SAFETY: in bounds, aligned (the base is page or 8-byte aligned) and the region
        // outlives the returned reference.
        unsafe { &*(self.ptr.as_ptr().add(offset) as *const AtomicU32) }
    }

    /// Atomic view of the aligned 64-bit word at `offset`.
    ///
    /// # Panics
    /// If `offset` is misaligned or out of bounds.
    pub fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        assert!(offset % 8 == 0 && offset + 8 <= self.len, "bad u64 offset {offset:#x}");
        // SAFETY: as for `atomic_u32`.
        unsafe { &*(self.ptr.as_ptr().add(offset) as *const AtomicU64) }
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), ShmError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(ShmError::OutOfBounds {
                offset,
                len,
                region_len: self.len,
            }),
        }
    }

    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<(), ShmError> {
        self.check(offset, out.len())?;
        // SAFETY: bounds checked above; `out` cannot alias the mapping mutably.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(offset),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        Ok(())
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<(), ShmError> {
        self.check(offset, data.len())?;
        // SAFETY: bounds checked above.
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    pub fn fill(&self, offset: usize, len: usize, byte: u8) -> Result<(), ShmError> {
        self.check(offset, len)?;
        // SAFETY: bounds checked above.
        unsafe {
            core::ptr::write_bytes(self.ptr.as_ptr().add(offset), byte, len);
        }
        Ok(())
    }

    /// Raw address of `offset` inside the mapping, for handing the framebuffer to a
    /// presentation layer.
    pub fn address_of(&self, offset: usize) -> Result<*const u8, ShmError> {
        self.check(offset, 0)?;
        // SAFETY: `offset <= len`.
        Ok(unsafe { self.ptr.as_ptr().add(offset) as *const u8 })
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        match &self.backing {
            Backing::Heap(_) => {}
            #[cfg(unix)]
            Backing::Posix { name, owner } => {
                // SAFETY: `ptr`/`len` came from a successful `mmap` and no references
                // into the mapping outlive `self`.
                if let Err(err) = unsafe { nix::sys::mman::munmap(self.ptr.cast(), self.len) } {
                    tracing::warn!(%err, "munmap failed");
                }
                if *owner {
                    if let Err(err) = nix::sys::mman::shm_unlink(name.as_str()) {
                        tracing::warn!(name = %name, %err, "shm_unlink failed");
                    }
                }
            }
        }
    }
}

#[cfg(unix)]
fn map_shared(file: &std::fs::File, len: usize) -> Result<NonNull<u8>, ShmError> {
    use core::num::NonZeroUsize;
    use nix::sys::mman::{mmap, MapFlags, ProtFlags};

    let size = NonZeroUsize::new(len).ok_or(ShmError::TooSmall { len, min: 1 })?;
    // SAFETY: mapping a fresh shared file mapping does not alias any Rust object.
    let ptr = unsafe {
        mmap(
            None,
            size,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            file,
            0,
        )
    }
    .map_err(|e| ShmError::Map {
        len,
        source: e.into(),
    })?;
    Ok(ptr.cast())
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::Ordering;

    #[test]
    fn heap_region_starts_zeroed() {
        let region = SharedRegion::heap(64);
        let mut buf = [0xFFu8; 64];
        region.read_bytes(0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 64]);
    }

    #[test]
    fn atomics_and_bytes_share_storage() {
        let region = SharedRegion::heap(16);
        region.atomic_u32(4).store(0x0403_0201, Ordering::Release);
        let mut buf = [0u8; 4];
        region.read_bytes(4, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);

        region.write_bytes(8, &7u64.to_le_bytes()).unwrap();
        assert_eq!(region.atomic_u64(8).load(Ordering::Acquire), 7);
    }

    #[test]
    fn out_of_bounds_is_an_error() {
        let region = SharedRegion::heap(16);
        assert!(matches!(
            region.write_bytes(12, &[0; 8]),
            Err(ShmError::OutOfBounds {
                offset: 12,
                len: 8,
                region_len: 16
            })
        ));
        assert!(region.fill(usize::MAX, 2, 0).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn posix_region_is_visible_through_a_second_mapping() {
        let name = format!("/sgl-test-{}", std::process::id());
        let server = SharedRegion::create(&name, 0x2000).unwrap();
        let client = SharedRegion::open(&name).unwrap();
        assert_eq!(client.len(), 0x2000);

        server.atomic_u32(0x10).store(42, Ordering::Release);
        assert_eq!(client.atomic_u32(0x10).load(Ordering::Acquire), 42);

        drop(client);
        drop(server);
        assert!(SharedRegion::open(&name).is_err());
    }
}
