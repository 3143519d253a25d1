//! Split virtqueue.
//!
//! One virtqueue is three pieces of DMA memory shared with the device: the
//! descriptor table, the driver-written available ring and the
//! device-written used ring. The driver chains descriptors, posts the
//! chain's head on the available ring and, unless the device asked for
//! notification suppression, kicks the queue notify register. The device
//! reports finished chains on the used ring.
//!
//! Descriptor bookkeeping is a plain circular allocator: chains occupy
//! consecutive slots, so a free counter and a next-slot cursor are enough.

use core::mem::size_of;
use core::ptr::{addr_of, addr_of_mut, read_volatile, write_volatile};
use core::sync::atomic::{Ordering, fence};

use bitflags::bitflags;

use crate::hal::{Hal, pages_for};
use crate::mmio::MmioBus;

use super::{DeviceMode, Register, read_reg, write_reg};

/// Number of descriptors per queue. Must be a power of two.
pub const QUEUE_SIZE: usize = 16;

bitflags! {
    /// Descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u16 {
        /// The chain continues at `next`.
        const NEXT = 1;
        /// The device writes to this buffer, the driver only reads it.
        const WRITE = 2;
    }
}

/// Available ring flag: the driver does not want completion interrupts.
pub const AVAIL_F_NO_INTERRUPT: u16 = 1;
/// Used ring flag: the device does not want queue notifications.
pub const USED_F_NO_NOTIFY: u16 = 1;

/// One entry of the descriptor table.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

#[repr(C, align(2))]
pub struct VirtqAvail {
    pub flags: u16,
    pub idx: u16,
    pub ring: [u16; QUEUE_SIZE],
    pub used_event: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqUsedElem {
    /// Head descriptor index of the completed chain.
    pub id: u32,
    /// Bytes the device wrote into the chain.
    pub len: u32,
}

#[repr(C, align(4))]
pub struct VirtqUsed {
    pub flags: u16,
    pub idx: u16,
    pub ring: [VirtqUsedElem; QUEUE_SIZE],
    pub avail_event: u16,
}

/// Driver-side state of one virtqueue.
///
/// The rings live in DMA memory owned by this struct for the lifetime of
/// the device; all accesses to them are volatile because the device reads
/// and writes them behind the compiler's back.
pub struct VirtQueue {
    desc: *mut VirtqDesc,
    avail: *mut VirtqAvail,
    used: *const VirtqUsed,
    /// Where the circular descriptor allocator hands out the next chain.
    next_desc_idx: u16,
    /// The used ring index up to which completions have been consumed.
    last_seen_used: u16,
    /// Descriptors currently lent to the device.
    in_used: u16,
}

// The queue is only ever driven under the owning device's lock, and the
// device side of the shared memory is accessed exclusively through
// volatile reads of the used ring.
unsafe impl Send for VirtQueue {}

impl VirtQueue {
    /// Allocate the rings, select and configure queue 0, and mark it ready.
    ///
    /// In [`DeviceMode::Poll`] the available ring's NO_INTERRUPT flag is
    /// raised before the device learns the ring addresses, so the device
    /// never sends a completion interrupt.
    ///
    /// # Panics
    ///
    /// Panics if queue 0 is already live or advertises fewer than
    /// [`QUEUE_SIZE`] descriptors.
    pub fn setup(bus: &dyn MmioBus, hal: &dyn Hal, mode: DeviceMode, name: &str) -> Self {
        write_reg(bus, Register::QueueSel, 0);
        if read_reg(bus, Register::QueueReady) != 0 {
            panic!("{}: queue 0 is already in use", name);
        }
        let max = read_reg(bus, Register::QueueNumMax);
        if (max as usize) < QUEUE_SIZE {
            panic!("{}: queue 0 supports only {} descriptors", name, max);
        }

        let desc_bytes = QUEUE_SIZE * size_of::<VirtqDesc>();
        let avail_bytes = size_of::<VirtqAvail>();

        // Driver-written area (descriptor table plus available ring) and
        // device-written area (used ring) on separate page runs.
        let desc_va = hal.dma_alloc_pages(pages_for(desc_bytes + avail_bytes));
        let avail_va = desc_va + desc_bytes;
        let used_va = hal.dma_alloc_pages(pages_for(size_of::<VirtqUsed>()));

        let queue = Self {
            desc: desc_va as *mut VirtqDesc,
            avail: avail_va as *mut VirtqAvail,
            used: used_va as *const VirtqUsed,
            next_desc_idx: 0,
            last_seen_used: 0,
            in_used: 0,
        };

        if mode == DeviceMode::Poll {
            unsafe {
                write_volatile(addr_of_mut!((*queue.avail).flags), AVAIL_F_NO_INTERRUPT);
            }
            // The flag must be visible before the device can look at the
            // ring.
            fence(Ordering::SeqCst);
        }

        write_reg(bus, Register::QueueNum, QUEUE_SIZE as u32);

        let desc_pa = hal.virt_to_phys(desc_va);
        write_reg(bus, Register::QueueDescLow, desc_pa as u32);
        write_reg(bus, Register::QueueDescHigh, (desc_pa >> 32) as u32);
        let avail_pa = hal.virt_to_phys(avail_va);
        write_reg(bus, Register::DriverDescLow, avail_pa as u32);
        write_reg(bus, Register::DriverDescHigh, (avail_pa >> 32) as u32);
        let used_pa = hal.virt_to_phys(used_va);
        write_reg(bus, Register::DeviceDescLow, used_pa as u32);
        write_reg(bus, Register::DeviceDescHigh, (used_pa >> 32) as u32);

        write_reg(bus, Register::QueueReady, 1);

        queue
    }

    /// Reserve `count` consecutive descriptor slots and return the head
    /// index, or `None` if the pool cannot cover the chain right now.
    pub fn allocate(&mut self, count: u16) -> Option<u16> {
        if self.in_used > QUEUE_SIZE as u16 - count {
            return None;
        }
        let head = self.next_desc_idx;
        self.next_desc_idx = (self.next_desc_idx + count) % QUEUE_SIZE as u16;
        self.in_used += count;
        Some(head)
    }

    /// Fill one descriptor table entry.
    pub fn write_desc(&mut self, index: u16, addr: u64, len: u32, flags: DescFlags, next: u16) {
        debug_assert!((index as usize) < QUEUE_SIZE);
        unsafe {
            let entry = self.desc.add(index as usize);
            write_volatile(addr_of_mut!((*entry).addr), addr);
            write_volatile(addr_of_mut!((*entry).len), len);
            write_volatile(addr_of_mut!((*entry).flags), flags.bits());
            write_volatile(addr_of_mut!((*entry).next), next);
        }
    }

    /// Post a chain on the available ring and notify the device unless it
    /// has suppressed notifications.
    pub fn publish(&mut self, bus: &dyn MmioBus, head: u16) {
        unsafe {
            let idx = read_volatile(addr_of!((*self.avail).idx));
            write_volatile(
                addr_of_mut!((*self.avail).ring[idx as usize % QUEUE_SIZE]),
                head,
            );
            // The ring entry must land before the index moves, and the
            // index must land before the notify.
            fence(Ordering::SeqCst);
            write_volatile(addr_of_mut!((*self.avail).idx), idx.wrapping_add(1));
        }
        fence(Ordering::SeqCst);

        let used_flags = unsafe { read_volatile(addr_of!((*self.used).flags)) };
        if used_flags & USED_F_NO_NOTIFY == 0 {
            write_reg(bus, Register::QueueNotify, 0);
        }
    }

    /// Return a completed chain's descriptors to the pool.
    ///
    /// Walks the chain from `head` following NEXT links, clearing the
    /// address and link fields of each slot as it goes.
    pub fn recycle(&mut self, head: u16) {
        let mut index = head;
        loop {
            let entry = unsafe { self.desc.add(index as usize % QUEUE_SIZE) };
            let flags = unsafe { read_volatile(addr_of!((*entry).flags)) };
            let next = unsafe { read_volatile(addr_of!((*entry).next)) };
            unsafe {
                write_volatile(addr_of_mut!((*entry).addr), 0);
                write_volatile(addr_of_mut!((*entry).flags), 0);
                write_volatile(addr_of_mut!((*entry).next), 0);
            }
            self.in_used -= 1;
            if flags & DescFlags::NEXT.bits() != 0 {
                index = next;
            } else {
                break;
            }
        }
    }

    /// Whether the device has published completions we have not consumed.
    pub fn has_completion(&self) -> bool {
        fence(Ordering::SeqCst);
        let used_idx = unsafe { read_volatile(addr_of!((*self.used).idx)) };
        self.last_seen_used != used_idx
    }

    /// The used ring entry at ring position `idx`.
    pub fn used_elem(&self, idx: u16) -> VirtqUsedElem {
        unsafe { read_volatile(addr_of!((*self.used).ring[idx as usize % QUEUE_SIZE])) }
    }

    /// The completion cursor, a free-running counter into the used ring.
    pub fn last_seen_used(&self) -> u16 {
        self.last_seen_used
    }

    /// Consume one completion by advancing the cursor.
    pub fn advance_used(&mut self) {
        self.last_seen_used = self.last_seen_used.wrapping_add(1);
    }

    /// Descriptors currently lent to the device.
    pub fn in_used(&self) -> u16 {
        self.in_used
    }

    /// Driver-side snapshot of the available index.
    pub fn avail_idx(&self) -> u16 {
        unsafe { read_volatile(addr_of!((*self.avail).idx)) }
    }
}
