//! Virtio block device driver.
//!
//! Each request is a chain of three descriptors: a 16-byte header the
//! device reads, one sector of data, and a single status byte the device
//! writes last. The driver publishes the chain and waits for completion,
//! either by spinning on the used ring or by blocking on a completion
//! signal released from the device's interrupt handler.
//!
//! Request headers and status bytes live in per-device scratch arrays
//! indexed by the descriptor slot that points at them, so a request's
//! scratch stays untouched for as long as its chain is outstanding.

use alloc::boxed::Box;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::device::block::{
    BLOCK_SECTOR_SIZE, BlockDriver, BlockOp, BlockRegistry, BlockSector, PartitionScanner,
};
use crate::drivers::virtio::queue::{DescFlags, QUEUE_SIZE, VirtQueue};
use crate::drivers::virtio::{
    DeviceMode, NegotiationProfile, Register, id_string, initialize, probe_block_device,
    read_config_u64, read_reg, write_reg,
};
use crate::hal::{Completion, Hal};
use crate::interrupt::{InterruptHandler, InterruptTable, IntrContext, Trapframe};
use crate::mmio::MmioBus;
use crate::retry::{RetryOutcome, RetryPolicy};

/// Request type: read one sector.
const VIRTIO_BLK_T_IN: u32 = 0;
/// Request type: write one sector.
const VIRTIO_BLK_T_OUT: u32 = 1;
/// Status byte reported by the device for a successful request.
const VIRTIO_BLK_S_OK: u8 = 0;

/// Disks of this many sectors (1 GiB) or more are rejected at discovery;
/// anything that big is assumed to be a host disk attached by mistake.
pub const CAPACITY_CEILING_SECTORS: u64 = (1 << 30) / BLOCK_SECTOR_SIZE as u64;

/// Number of candidate virtio-mmio slots scanned at boot.
pub const VIRTIO_SLOT_COUNT: usize = 8;

static SLOT_NAMES: [&str; VIRTIO_SLOT_COUNT] =
    ["hda", "hdb", "hdc", "hdd", "hde", "hdf", "hdg", "hdh"];

/// Request header, read by the device through the chain's first
/// descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct VirtioBlkReq {
    req_type: u32,
    reserved: u32,
    sector: u64,
}

struct Inner {
    queue: VirtQueue,
    /// Request headers, indexed by the header descriptor's slot.
    req: [VirtioBlkReq; QUEUE_SIZE],
    /// Status bytes, indexed by the status descriptor's slot.
    resp: [u8; QUEUE_SIZE],
}

/// One live virtio block device.
pub struct VirtioBlkDevice {
    name: &'static str,
    bus: Arc<dyn MmioBus>,
    hal: Arc<dyn Hal>,
    mode: DeviceMode,
    irq: u32,
    capacity: BlockSector,
    inner: Mutex<Inner>,
    completion: Arc<dyn Completion>,
}

impl VirtioBlkDevice {
    pub fn new(
        bus: Arc<dyn MmioBus>,
        hal: Arc<dyn Hal>,
        queue: VirtQueue,
        mode: DeviceMode,
        irq: u32,
        name: &'static str,
        capacity: BlockSector,
    ) -> Arc<Self> {
        let completion = hal.make_completion();
        Arc::new(Self {
            name,
            bus,
            hal,
            mode,
            irq,
            capacity,
            inner: Mutex::new(Inner {
                queue,
                req: [VirtioBlkReq::default(); QUEUE_SIZE],
                resp: [0; QUEUE_SIZE],
            }),
            completion,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> BlockSector {
        self.capacity
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }

    /// Descriptors currently lent to the device.
    pub fn in_flight(&self) -> u16 {
        self.inner.lock().queue.in_used()
    }

    /// Submit one sector transfer and wait for it to finish.
    ///
    /// # Panics
    ///
    /// Panics on any protocol violation: no descriptors for ~30 s, a
    /// completion for the wrong chain head, or a non-OK status byte.
    fn transfer(&self, sector: BlockSector, buf_addr: usize, op: BlockOp) {
        let direction = match op {
            BlockOp::Read => "read",
            BlockOp::Write => "write",
        };

        let mut inner = self.inner.lock();

        let mut head = None;
        let policy = RetryPolicy::default();
        let outcome = policy.run(
            self.hal.as_ref(),
            || {
                head = inner.queue.allocate(3);
                head.is_some()
            },
            || log::warn!("{}: waiting for free descriptors", self.name),
        );
        let head = match (outcome, head) {
            (RetryOutcome::Completed, Some(head)) => head,
            _ => panic!(
                "{}: {} of sector {}: descriptor pool still exhausted after retrying",
                self.name, direction, sector
            ),
        };
        let data_idx = (head + 1) % QUEUE_SIZE as u16;
        let status_idx = (head + 2) % QUEUE_SIZE as u16;

        inner.req[head as usize] = VirtioBlkReq {
            req_type: match op {
                BlockOp::Read => VIRTIO_BLK_T_IN,
                BlockOp::Write => VIRTIO_BLK_T_OUT,
            },
            reserved: 0,
            sector,
        };
        // Poison the status byte; the device must overwrite it.
        inner.resp[status_idx as usize] = !VIRTIO_BLK_S_OK;

        let req_pa = self
            .hal
            .virt_to_phys(&inner.req[head as usize] as *const VirtioBlkReq as usize);
        let data_pa = self.hal.virt_to_phys(buf_addr);
        let resp_pa = self
            .hal
            .virt_to_phys(&inner.resp[status_idx as usize] as *const u8 as usize);

        let data_flags = match op {
            BlockOp::Read => DescFlags::NEXT | DescFlags::WRITE,
            BlockOp::Write => DescFlags::NEXT,
        };
        inner.queue.write_desc(
            head,
            req_pa,
            size_of::<VirtioBlkReq>() as u32,
            DescFlags::NEXT,
            data_idx,
        );
        inner.queue.write_desc(
            data_idx,
            data_pa,
            BLOCK_SECTOR_SIZE as u32,
            data_flags,
            status_idx,
        );
        inner
            .queue
            .write_desc(status_idx, resp_pa, 1, DescFlags::WRITE, 0);

        inner.queue.publish(self.bus.as_ref(), head);

        match self.mode {
            DeviceMode::Poll => {
                while !inner.queue.has_completion() {
                    core::hint::spin_loop();
                }
            }
            DeviceMode::Interrupt => {
                self.completion.wait();
                assert!(
                    inner.queue.has_completion(),
                    "{}: completion signal with no used ring progress",
                    self.name
                );
            }
        }

        let elem = inner.queue.used_elem(inner.queue.last_seen_used());
        assert_eq!(
            elem.id, head as u32,
            "{}: device completed chain {} while {} was outstanding",
            self.name, elem.id, head
        );
        let status = inner.resp[status_idx as usize];
        assert_eq!(
            status, VIRTIO_BLK_S_OK,
            "{}: {} of sector {} failed with device status {:#x}",
            self.name, direction, sector, status
        );

        inner.queue.recycle(head);
        inner.queue.advance_used();
    }
}

impl BlockDriver for VirtioBlkDevice {
    fn read_sector(&self, sector: BlockSector, buf: &mut [u8]) {
        assert_eq!(buf.len(), BLOCK_SECTOR_SIZE);
        self.transfer(sector, buf.as_mut_ptr() as usize, BlockOp::Read);
    }

    fn write_sector(&self, sector: BlockSector, buf: &[u8]) {
        assert_eq!(buf.len(), BLOCK_SECTOR_SIZE);
        self.transfer(sector, buf.as_ptr() as usize, BlockOp::Write);
    }
}

/// Per-device interrupt handler.
///
/// Runs in external-interrupt context, so it only acknowledges the device
/// and releases the completion signal; the waiting thread does all queue
/// bookkeeping after it wakes.
pub struct VirtioBlkIntrHandler {
    device: Arc<VirtioBlkDevice>,
}

impl VirtioBlkIntrHandler {
    pub fn new(device: Arc<VirtioBlkDevice>) -> Self {
        Self { device }
    }
}

impl InterruptHandler for VirtioBlkIntrHandler {
    fn handle(&mut self, _frame: &mut Trapframe, _intr: &IntrContext) {
        let bus = self.device.bus.as_ref();
        let status = read_reg(bus, Register::InterruptStatus);
        assert!(status != 0, "{}: spurious interrupt", self.device.name);
        write_reg(bus, Register::InterruptAck, status);
        self.device.completion.signal();
    }
}

/// One candidate virtio-mmio slot.
pub struct SlotConfig {
    pub bus: Arc<dyn MmioBus>,
    pub irq: u32,
}

/// Scan the candidate slots and bring up every block device found.
///
/// A slot that does not identify as a virtio block device is skipped
/// silently; a disk at or above [`CAPACITY_CEILING_SECTORS`] is skipped
/// with a warning. Accepted devices are brought to DRIVER_OK, wired to their
/// interrupt vector, registered with the block layer and handed to the
/// partition scanner.
pub fn probe_slots(
    hal: Arc<dyn Hal>,
    profile: NegotiationProfile,
    mode: DeviceMode,
    slots: &[SlotConfig],
    intr: &mut InterruptTable,
    registry: &mut BlockRegistry,
    scanner: &dyn PartitionScanner,
) -> Vec<Arc<VirtioBlkDevice>> {
    assert!(slots.len() <= VIRTIO_SLOT_COUNT);

    let mut devices = Vec::new();
    for (slot, config) in slots.iter().enumerate() {
        let name = SLOT_NAMES[slot];
        let bus = config.bus.as_ref();

        if !probe_block_device(bus) {
            log::debug!("virtio slot {}: no block device", slot);
            continue;
        }

        let capacity = read_config_u64(bus, 0);
        if capacity >= CAPACITY_CEILING_SECTORS {
            log::warn!(
                "virtio slot {}: capacity {} sectors reaches the {} sector ceiling, ignoring device",
                slot,
                capacity,
                CAPACITY_CEILING_SECTORS
            );
            continue;
        }

        let queue = initialize(bus, hal.as_ref(), profile, mode, name);
        let device = VirtioBlkDevice::new(
            config.bus.clone(),
            hal.clone(),
            queue,
            mode,
            config.irq,
            name,
            capacity,
        );

        intr.register_external(
            config.irq as u8,
            Box::new(VirtioBlkIntrHandler::new(device.clone())),
            name,
        );

        let extra_info = format!(
            "virtio-mmio, vendor {}",
            id_string(read_reg(bus, Register::VendorId))
        );
        let registered = registry.register(name, capacity, extra_info, device.clone());
        scanner.scan(&registered);

        devices.push(device);
    }
    devices
}
