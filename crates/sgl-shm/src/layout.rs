//! Region layout: `[register file][FIFO][framebuffer]`.
//!
//! The server sizes the region and publishes `MEMSIZE` and `FBSTART`; clients derive
//! the same layout from those registers.

use core::ops::Range;
use core::sync::atomic::Ordering;

use sgl_protocol::registers::{offset, COMMAND_START, SHM_MAGIC};
use sgl_protocol::SCHEMA_VERSION;

use crate::error::ShmError;
use crate::region::SharedRegion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmLayout {
    memsize: usize,
    fifo_size: usize,
}

impl ShmLayout {
    /// `memsize` is the whole region; `fifo_size` the bytes reserved for commands.
    pub fn new(memsize: usize, fifo_size: usize) -> Result<Self, ShmError> {
        let valid = fifo_size >= 4
            && fifo_size % 4 == 0
            && memsize <= u32::MAX as usize
            && COMMAND_START
                .checked_add(fifo_size)
                .is_some_and(|fb| fb <= memsize);
        if !valid {
            return Err(ShmError::Layout { memsize, fifo_size });
        }
        Ok(Self { memsize, fifo_size })
    }

    pub fn memsize(&self) -> usize {
        self.memsize
    }

    pub fn fifo_size(&self) -> usize {
        self.fifo_size
    }

    pub fn fifo(&self) -> Range<usize> {
        COMMAND_START..self.framebuffer_start()
    }

    pub fn framebuffer_start(&self) -> usize {
        COMMAND_START + self.fifo_size
    }

    pub fn framebuffer(&self) -> Range<usize> {
        self.framebuffer_start()..self.memsize
    }

    pub fn framebuffer_size(&self) -> usize {
        self.memsize - self.framebuffer_start()
    }

    /// Resets every register and publishes this layout, then writes `MAGIC` last.
    pub fn initialize(
        &self,
        region: &SharedRegion,
        gl_major: u32,
        gl_minor: u32,
    ) -> Result<(), ShmError> {
        if region.len() < self.memsize {
            return Err(ShmError::TooSmall {
                len: region.len(),
                min: self.memsize,
            });
        }
        region.atomic_u32(offset::MAGIC).store(0, Ordering::Release);
        region.fill(0, COMMAND_START, 0)?;
        region.fill(COMMAND_START, self.fifo_size, 0)?;

        let store = |off: usize, v: u32| region.atomic_u32(off).store(v, Ordering::Release);
        store(offset::SCHEMA, SCHEMA_VERSION);
        store(offset::FBSTART, self.framebuffer_start() as u32);
        store(offset::MEMSIZE, self.memsize as u32);
        store(offset::GLMAJ, gl_major);
        store(offset::GLMIN, gl_minor);
        store(offset::MAGIC, SHM_MAGIC);
        Ok(())
    }

    /// Reads the layout a server published, checking `MAGIC` and `SCHEMA` first.
    pub fn discover(region: &SharedRegion) -> Result<Self, ShmError> {
        if region.len() < COMMAND_START {
            return Err(ShmError::TooSmall {
                len: region.len(),
                min: COMMAND_START,
            });
        }
        let load = |off: usize| region.atomic_u32(off).load(Ordering::Acquire);

        let magic = load(offset::MAGIC);
        if magic != SHM_MAGIC {
            return Err(ShmError::BadMagic { found: magic });
        }
        let schema = load(offset::SCHEMA);
        if schema != SCHEMA_VERSION {
            return Err(ShmError::SchemaMismatch {
                server: schema,
                client: SCHEMA_VERSION,
            });
        }

        let memsize = load(offset::MEMSIZE) as usize;
        let fbstart = load(offset::FBSTART) as usize;
        let layout = Self::new(memsize, fbstart.saturating_sub(COMMAND_START))?;
        if layout.memsize > region.len() {
            return Err(ShmError::TooSmall {
                len: region.len(),
                min: layout.memsize,
            });
        }
        Ok(layout)
    }
}
