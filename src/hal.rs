//! Collaborator interfaces provided by the kernel proper.
//!
//! The drivers in this crate do not own memory management, scheduling or
//! timekeeping. Whatever kernel hosts them supplies those services through
//! [`Hal`]; the drivers only assume the narrow contracts documented here.

use alloc::sync::Arc;

/// Size of the pages handed out by [`Hal::dma_alloc_pages`].
pub const PAGE_SIZE: usize = 4096;

/// Number of pages needed to hold `bytes`.
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

/// A completion signal shared between a waiting thread and an interrupt
/// handler.
///
/// Semaphore semantics: a `signal` that happens before the corresponding
/// `wait` is not lost. The primitive itself provides whatever
/// synchronization the handoff needs; callers add no extra locking around
/// it.
pub trait Completion: Send + Sync {
    /// Block the calling thread until signalled.
    fn wait(&self);
    /// Release one waiter. Safe to call from interrupt context.
    fn signal(&self);
}

/// Services the hosting kernel provides to the drivers.
pub trait Hal: Send + Sync {
    /// Allocate `count` physically contiguous, page-aligned, zeroed pages
    /// and return their virtual address. DMA memory is never freed by this
    /// crate; the queues it backs live for the kernel's lifetime.
    ///
    /// Exhaustion during boot is not survivable, so implementations panic
    /// rather than return an error.
    fn dma_alloc_pages(&self, count: usize) -> usize;

    /// Translate a kernel virtual address to the physical address a device
    /// sees.
    fn virt_to_phys(&self, vaddr: usize) -> u64;

    /// Sleep the calling thread for at least `ms` milliseconds. Used only
    /// by the descriptor allocation retry loop.
    fn sleep_ms(&self, ms: u64);

    /// Yield the CPU to the scheduler. Called at the tail of external
    /// interrupt dispatch when a handler requested it.
    fn yield_now(&self);

    /// Whether interrupts are currently enabled on this hart. The
    /// dispatcher asserts they are off for the whole of an external
    /// interrupt.
    fn interrupts_enabled(&self) -> bool;

    /// Create a fresh completion signal.
    fn make_completion(&self) -> Arc<dyn Completion>;
}
