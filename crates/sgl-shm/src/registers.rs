use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use sgl_protocol::{Register, RegisterError, RegisterFile};

use crate::region::SharedRegion;
use crate::spinlock::SpinLock;

/// The register file living at the start of a shared region.
///
/// Loads are acquire and stores are release, so a value published in a register
/// orders every FIFO or framebuffer copy made before it.
#[derive(Debug, Clone)]
pub struct ShmRegisters {
    region: Arc<SharedRegion>,
}

impl ShmRegisters {
    pub fn new(region: Arc<SharedRegion>) -> Self {
        Self { region }
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    /// The atomic word behind a 32-bit register.
    pub fn word(&self, reg: Register) -> &AtomicU32 {
        debug_assert_eq!(reg.width(), 4, "{reg:?} is not a 32-bit register");
        self.region.atomic_u32(reg.offset())
    }

    pub fn load(&self, reg: Register) -> u32 {
        self.word(reg).load(Ordering::Acquire)
    }

    pub fn store(&self, reg: Register, value: u32) {
        self.word(reg).store(value, Ordering::Release);
    }

    /// Atomically replaces a 32-bit register when `f` returns a new value.
    pub fn fetch_update(
        &self,
        reg: Register,
        f: impl FnMut(u32) -> Option<u32>,
    ) -> Result<u32, u32> {
        self.word(reg)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, f)
    }

    pub fn compare_exchange(&self, reg: Register, current: u32, new: u32) -> Result<u32, u32> {
        self.word(reg)
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    pub fn load_retval(&self) -> u64 {
        self.region
            .atomic_u64(Register::Retval.offset())
            .load(Ordering::Acquire)
    }

    pub fn store_retval(&self, value: u64) {
        self.region
            .atomic_u64(Register::Retval.offset())
            .store(value, Ordering::Release);
    }

    /// The `LOCK` register as a spinlock.
    pub fn lock(&self) -> SpinLock<'_> {
        SpinLock::new(self.word(Register::Lock))
    }
}

impl RegisterFile for ShmRegisters {
    fn read(&self, reg: Register) -> Result<u32, RegisterError> {
        reg.expect_width(4)?;
        Ok(self.load(reg))
    }

    fn read64(&self, reg: Register) -> Result<u64, RegisterError> {
        reg.expect_width(8)?;
        Ok(self.load_retval())
    }

    fn write(&mut self, reg: Register, value: u32) -> Result<(), RegisterError> {
        reg.expect_width(4)?;
        self.store(reg, value);
        Ok(())
    }

    fn write64(&mut self, reg: Register, value: u64) -> Result<(), RegisterError> {
        reg.expect_width(8)?;
        self.store_retval(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sgl_protocol::registers::{offset, COMMAND_START};

    #[test]
    fn registers_land_at_their_offsets() {
        let region = Arc::new(SharedRegion::heap(COMMAND_START));
        let mut regs = ShmRegisters::new(region.clone());

        regs.write(Register::Connect, 5).unwrap();
        regs.write64(Register::Retval, u64::MAX - 1).unwrap();
        regs.write_vector(&[1, 2, 3]).unwrap();

        assert_eq!(region.atomic_u32(offset::CONNECT).load(Ordering::Acquire), 5);
        assert_eq!(region.atomic_u64(offset::RETVAL).load(Ordering::Acquire), u64::MAX - 1);
        assert_eq!(region.atomic_u32(offset::RETVAL_V + 8).load(Ordering::Acquire), 3);

        let retval = regs.retval().unwrap();
        assert_eq!(retval.value, u64::MAX - 1);
        assert_eq!(&retval.vector[..4], &[1, 2, 3, 0]);
    }

    #[test]
    fn every_register_is_backed() {
        let region = Arc::new(SharedRegion::heap(COMMAND_START));
        let mut regs = ShmRegisters::new(region);
        for reg in [Register::Lock, Register::Submit, Register::SwapSync, Register::MemSize] {
            regs.write(reg, 9).unwrap();
            assert_eq!(regs.read(reg), Ok(9));
        }
        assert_eq!(
            regs.read(Register::RetvalV(64)),
            Err(RegisterError::VectorIndex(64))
        );
    }
}
