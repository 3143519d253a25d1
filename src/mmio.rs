//! Memory-mapped I/O bus abstraction.
//!
//! Every register block the crate touches (the PLIC, each virtio-mmio slot)
//! is reached through [`MmioBus`] rather than through hardcoded addresses.
//! On hardware this is [`PhysMmio`], a volatile view of a physical register
//! block; tests substitute mock buses that model device behavior.

/// A 32-bit register block at some base address.
///
/// Offsets are relative to the block's base. All virtio-mmio and PLIC
/// registers are 32 bits wide, so this is the only access width the bus
/// needs to provide.
pub trait MmioBus: Send + Sync {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
}

/// Volatile access to a physical register block mapped at `base`.
///
/// The base address must map the device's registers for the lifetime of
/// the value; establishing that mapping is the memory manager's job.
pub struct PhysMmio {
    base: usize,
}

impl PhysMmio {
    pub const fn new(base: usize) -> Self {
        Self { base }
    }

    pub fn base(&self) -> usize {
        self.base
    }
}

impl MmioBus for PhysMmio {
    fn read32(&self, offset: usize) -> u32 {
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    fn write32(&self, offset: usize, value: u32) {
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }
}
