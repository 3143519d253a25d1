//! Shared test fixtures: a host-side HAL and a register-level model of a
//! virtio-mmio block device.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use vermilion::drivers::virtio::queue::{
    QUEUE_SIZE, VirtqAvail, VirtqDesc, VirtqUsed, VirtqUsedElem,
};
use vermilion::hal::{Completion, Hal, PAGE_SIZE};
use vermilion::mmio::MmioBus;

/// HAL backed by the host: real allocations, identity address translation,
/// counted (not slept) delays, condvar-based completions.
pub struct HostHal {
    slept_ms: AtomicU64,
}

impl HostHal {
    pub fn new() -> Self {
        Self {
            slept_ms: AtomicU64::new(0),
        }
    }

    pub fn slept_ms(&self) -> u64 {
        self.slept_ms.load(Ordering::Relaxed)
    }
}

impl Hal for HostHal {
    fn dma_alloc_pages(&self, count: usize) -> usize {
        let layout = std::alloc::Layout::from_size_align(count * PAGE_SIZE, PAGE_SIZE).unwrap();
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        ptr as usize
    }

    fn virt_to_phys(&self, vaddr: usize) -> u64 {
        vaddr as u64
    }

    fn sleep_ms(&self, ms: u64) {
        self.slept_ms.fetch_add(ms, Ordering::Relaxed);
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }

    fn interrupts_enabled(&self) -> bool {
        false
    }

    fn make_completion(&self) -> Arc<dyn Completion> {
        Arc::new(SemCompletion::default())
    }
}

/// Counting semaphore on a condvar; signals before the first wait are not
/// lost.
#[derive(Default)]
pub struct SemCompletion {
    count: Mutex<u32>,
    cv: Condvar,
}

impl Completion for SemCompletion {
    fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cv.wait(count).unwrap();
        }
        *count -= 1;
    }

    fn signal(&self) {
        *self.count.lock().unwrap() += 1;
        self.cv.notify_one();
    }
}

/// What the mock device does with submitted chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Process every chain during the notify write, status OK.
    CompleteImmediately,
    /// Ignore notifies; the used ring never advances.
    Never,
    /// Process chains but report an I/O error status.
    BadStatus,
}

/// The byte the mock device stores at offset `i` of a read of `sector`.
pub fn fill_byte(sector: u64, i: usize) -> u8 {
    (sector as u8) ^ (i as u8)
}

#[derive(Default)]
struct MockState {
    status: u32,
    status_writes: Vec<u32>,
    driver_features: u32,
    queue_ready: u32,
    desc_pa: u64,
    avail_pa: u64,
    used_pa: u64,
    processed: u16,
    intr_status: u32,
    writes: Vec<(u64, Vec<u8>)>,
}

/// Register-level model of one virtio-mmio block device slot.
///
/// Ring processing happens synchronously inside the queue-notify write,
/// reading and writing the shared ring memory through the addresses the
/// driver programmed (the test HAL's address translation is identity).
pub struct MockVirtioDevice {
    behavior: Behavior,
    capacity: u64,
    state: Mutex<MockState>,
}

impl MockVirtioDevice {
    pub fn new(behavior: Behavior, capacity: u64) -> Self {
        Self {
            behavior,
            capacity,
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn interrupt_pending(&self) -> bool {
        self.state.lock().unwrap().intr_status != 0
    }

    pub fn captured_writes(&self) -> Vec<(u64, Vec<u8>)> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn status_writes(&self) -> Vec<u32> {
        self.state.lock().unwrap().status_writes.clone()
    }

    fn process(&self, st: &mut MockState) {
        if self.behavior == Behavior::Never {
            return;
        }
        let desc = st.desc_pa as *const VirtqDesc;
        let avail = st.avail_pa as *const VirtqAvail;
        let used = st.used_pa as *mut VirtqUsed;
        unsafe {
            use std::ptr::{addr_of, addr_of_mut, read_volatile, write_volatile};
            use std::sync::atomic::fence;

            let avail_idx = read_volatile(addr_of!((*avail).idx));
            while st.processed != avail_idx {
                let head =
                    read_volatile(addr_of!((*avail).ring[st.processed as usize % QUEUE_SIZE]));

                let d0 = read_volatile(desc.add(head as usize % QUEUE_SIZE));
                let header = read_volatile(d0.addr as *const [u8; 16]);
                let req_type = u32::from_le_bytes(header[0..4].try_into().unwrap());
                let sector = u64::from_le_bytes(header[8..16].try_into().unwrap());

                let d1 = read_volatile(desc.add(d0.next as usize % QUEUE_SIZE));
                let d2 = read_volatile(desc.add(d1.next as usize % QUEUE_SIZE));

                let data =
                    std::slice::from_raw_parts_mut(d1.addr as *mut u8, d1.len as usize);
                let mut written = 1u32;
                if req_type == 0 {
                    for (i, b) in data.iter_mut().enumerate() {
                        *b = fill_byte(sector, i);
                    }
                    written += d1.len;
                } else {
                    st.writes.push((sector, data.to_vec()));
                }

                let status: u8 = if self.behavior == Behavior::BadStatus { 1 } else { 0 };
                write_volatile(d2.addr as *mut u8, status);

                fence(Ordering::SeqCst);
                let used_idx = read_volatile(addr_of!((*used).idx));
                write_volatile(
                    addr_of_mut!((*used).ring[used_idx as usize % QUEUE_SIZE]),
                    VirtqUsedElem {
                        id: head as u32,
                        len: written,
                    },
                );
                fence(Ordering::SeqCst);
                write_volatile(addr_of_mut!((*used).idx), used_idx.wrapping_add(1));

                st.processed = st.processed.wrapping_add(1);
            }
            st.intr_status |= 1;
        }
    }
}

impl MmioBus for MockVirtioDevice {
    fn read32(&self, offset: usize) -> u32 {
        let st = self.state.lock().unwrap();
        match offset {
            0x00 => 0x7472_6976, // "virt"
            0x04 => 2,
            0x08 => 2, // block device
            0x0c => 0x554d_4551, // "QEMU"
            0x10 => 0,
            0x34 => QUEUE_SIZE as u32,
            0x44 => st.queue_ready,
            0x60 => st.intr_status,
            0x70 => st.status,
            0x100 => self.capacity as u32,
            0x104 => (self.capacity >> 32) as u32,
            _ => 0,
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut st = self.state.lock().unwrap();
        match offset {
            0x20 => st.driver_features = value,
            0x44 => st.queue_ready = value,
            0x50 => self.process(&mut st),
            0x64 => st.intr_status &= !value,
            0x70 => {
                st.status = value;
                st.status_writes.push(value);
            }
            0x80 => st.desc_pa = (st.desc_pa & !0xffff_ffff) | value as u64,
            0x84 => st.desc_pa = (st.desc_pa & 0xffff_ffff) | ((value as u64) << 32),
            0x90 => st.avail_pa = (st.avail_pa & !0xffff_ffff) | value as u64,
            0x94 => st.avail_pa = (st.avail_pa & 0xffff_ffff) | ((value as u64) << 32),
            0xa0 => st.used_pa = (st.used_pa & !0xffff_ffff) | value as u64,
            0xa4 => st.used_pa = (st.used_pa & 0xffff_ffff) | ((value as u64) << 32),
            _ => {}
        }
    }
}

/// MMIO slot with nothing behind it; every register reads as zero.
pub struct InertBus;

impl MmioBus for InertBus {
    fn read32(&self, _offset: usize) -> u32 {
        0
    }
    fn write32(&self, _offset: usize, _value: u32) {}
}

/// PLIC transport stub for driving dispatch: claim always returns the
/// configured source id.
pub struct StubPlicBus {
    claim: u32,
}

impl StubPlicBus {
    pub fn new(claim: u32) -> Self {
        Self { claim }
    }
}

impl MmioBus for StubPlicBus {
    fn read32(&self, offset: usize) -> u32 {
        if offset == 0x0020_1004 { self.claim } else { 0 }
    }
    fn write32(&self, _offset: usize, _value: u32) {}
}
