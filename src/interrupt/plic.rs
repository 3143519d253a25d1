//! Platform-Level Interrupt Controller (PLIC) driver.
//!
//! The PLIC arbitrates external interrupt sources and presents the highest
//! priority pending one through a claim/complete handshake. This driver
//! programs per-source priorities and the supervisor enable bitmap, and
//! performs the handshake on behalf of the dispatcher.
//!
//! Register block, offsets from the PLIC base:
//! - `0x0000_0000 + 4 * irq`: per-source priority
//! - `0x0000_1000`: pending bitmap
//! - `0x0000_2080`: supervisor enable bitmap (hart 0)
//! - `0x0020_0000`: machine priority threshold (hart 0)
//! - `0x0020_1000`: supervisor priority threshold (hart 0)
//! - `0x0020_1004`: supervisor claim/complete (hart 0)

use alloc::sync::Arc;

use crate::mmio::MmioBus;

const PRIORITY_BASE: usize = 0x0000_0000;
#[allow(dead_code)]
const PENDING_BASE: usize = 0x0000_1000;
const S_ENABLE_BASE: usize = 0x0000_2080;
const M_THRESHOLD: usize = 0x0020_0000;
const S_THRESHOLD: usize = 0x0020_1000;
const S_CLAIM: usize = 0x0020_1004;

/// The PLIC supports up to 1024 sources; this kernel only ever programs
/// the first 64, which covers every device QEMU's virt machine wires up.
pub const PLIC_SOURCE_LIMIT: u32 = 64;

/// PLIC driver bound to one register block.
pub struct Plic {
    bus: Arc<dyn MmioBus>,
}

impl Plic {
    pub fn new(bus: Arc<dyn MmioBus>) -> Self {
        Self { bus }
    }

    /// Program the thresholds and clear the supervisor enable bitmap.
    ///
    /// The supervisor threshold is 0 so any source with nonzero priority
    /// can interrupt; the machine threshold is 1 so PLIC sources never
    /// reach machine mode. Individual sources are enabled later through
    /// [`Plic::register`].
    pub fn init(&self) {
        self.bus.write32(S_THRESHOLD, 0);
        self.bus.write32(M_THRESHOLD, 1);
        for word in 0..(PLIC_SOURCE_LIMIT as usize / 32) {
            self.bus.write32(S_ENABLE_BASE + word * 4, 0);
        }
    }

    /// Set `irq`'s priority and enable it for supervisor mode.
    ///
    /// Priority 0 is reserved by the PLIC to mean "never interrupt", so a
    /// source registered with priority 0 stays permanently disabled.
    pub fn register(&self, irq: u32, priority: u32) {
        assert!(irq < PLIC_SOURCE_LIMIT, "irq {} out of range", irq);

        self.bus
            .write32(PRIORITY_BASE + irq as usize * 4, priority);

        // The enable bitmap is packed 32 sources per word.
        let word = irq as usize / 32;
        let bit = irq % 32;
        let addr = S_ENABLE_BASE + word * 4;
        self.bus.write32(addr, self.bus.read32(addr) | (1 << bit));
    }

    /// Claim the highest-priority pending source.
    ///
    /// Returns 0 when nothing is pending. A successful claim atomically
    /// clears the source's pending bit in the controller.
    pub fn claim(&self) -> u32 {
        self.bus.read32(S_CLAIM)
    }

    /// Acknowledge a claimed source.
    ///
    /// The PLIC silently ignores a completion id that does not match an
    /// enabled source, so completing an already-completed id is harmless.
    pub fn complete(&self, irq: u32) {
        assert!(irq < PLIC_SOURCE_LIMIT, "irq {} out of range", irq);
        self.bus.write32(S_CLAIM, irq);
    }
}
