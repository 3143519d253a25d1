//! Virtio-mmio transport.
//!
//! Register map and device status handling for virtio over MMIO,
//! following the virtio 1.2 specification. The transport side here covers
//! what every virtio device needs before it is usable: identification of
//! the MMIO slot, the status-bit bring-up sequence and feature
//! negotiation. The split virtqueue itself lives in [`queue`].

pub mod queue;

use bitflags::bitflags;
use core::sync::atomic::{Ordering, fence};

use crate::hal::Hal;
use crate::mmio::MmioBus;
use queue::VirtQueue;

/// Virtio-mmio register offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    MagicValue = 0x00,
    Version = 0x04,
    DeviceId = 0x08,
    VendorId = 0x0c,
    DeviceFeatures = 0x10,
    DriverFeatures = 0x20,
    QueueSel = 0x30,
    QueueNumMax = 0x34,
    QueueNum = 0x38,
    QueueReady = 0x44,
    QueueNotify = 0x50,
    InterruptStatus = 0x60,
    InterruptAck = 0x64,
    Status = 0x70,
    QueueDescLow = 0x80,
    QueueDescHigh = 0x84,
    DriverDescLow = 0x90,
    DriverDescHigh = 0x94,
    DeviceDescLow = 0xa0,
    DeviceDescHigh = 0xa4,
    /// Start of the device-specific configuration space.
    DeviceConfig = 0x100,
}

impl Register {
    pub fn offset(&self) -> usize {
        *self as usize
    }
}

pub fn read_reg(bus: &dyn MmioBus, reg: Register) -> u32 {
    bus.read32(reg.offset())
}

pub fn write_reg(bus: &dyn MmioBus, reg: Register, value: u32) {
    bus.write32(reg.offset(), value);
}

/// Read a 64-bit field from the device configuration space as two 32-bit
/// halves. The bus is 32 bits wide, so this is how virtio-mmio exposes
/// wide config fields.
pub fn read_config_u64(bus: &dyn MmioBus, offset: usize) -> u64 {
    let lo = bus.read32(Register::DeviceConfig.offset() + offset) as u64;
    let hi = bus.read32(Register::DeviceConfig.offset() + offset + 4) as u64;
    (hi << 32) | lo
}

bitflags! {
    /// Device status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus: u32 {
        const ACKNOWLEDGE = 1;
        const DRIVER = 2;
        const DRIVER_OK = 4;
        const FEATURES_OK = 8;
        const DEVICE_NEEDS_RESET = 0x40;
        const FAILED = 0x80;
    }
}

/// "virt" in little-endian byte order.
pub const MMIO_MAGIC: u32 = 0x7472_6976;
/// Only the non-legacy interface is supported.
pub const MMIO_VERSION: u32 = 2;
/// Device id of a block device.
pub const DEVICE_ID_BLOCK: u32 = 2;
/// "QEMU" in little-endian byte order. Hardcoded for now; relax if virtio
/// devices from another implementation ever need to be driven.
pub const VENDOR_ID_QEMU: u32 = 0x554d_4551;

/// Disk is read-only.
pub const FEATURE_RO: u32 = 1 << 5;
/// Writeback cache mode is configurable; we must not use write-back.
pub const FEATURE_CONFIG_WCE: u32 = 1 << 11;
/// used_event/avail_event suppression.
pub const FEATURE_EVENT_IDX: u32 = 1 << 29;

/// How a device signals request completion to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    /// The driver spins on the used ring; device interrupts are
    /// suppressed at queue setup.
    Poll,
    /// The driver blocks on a completion signal released by the device's
    /// interrupt handler.
    Interrupt,
}

/// Which feature bits to refuse during negotiation.
///
/// The sets differ between the early-boot environment, which has no
/// paging or scheduler yet, and the supervisor kernel proper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationProfile {
    EarlyBoot,
    Supervisor,
}

impl NegotiationProfile {
    /// Feature bits this profile will never accept.
    pub fn excluded_features(&self) -> u32 {
        match self {
            NegotiationProfile::EarlyBoot => FEATURE_CONFIG_WCE | FEATURE_EVENT_IDX,
            NegotiationProfile::Supervisor => FEATURE_RO | FEATURE_CONFIG_WCE | FEATURE_EVENT_IDX,
        }
    }
}

/// Check whether the slot behind `bus` hosts a virtio block device.
///
/// A mismatch on any of magic, version, device id or vendor id just means
/// the slot is empty or hosts something else; callers treat that as an
/// inert slot, not an error.
pub fn probe_block_device(bus: &dyn MmioBus) -> bool {
    read_reg(bus, Register::MagicValue) == MMIO_MAGIC
        && read_reg(bus, Register::Version) == MMIO_VERSION
        && read_reg(bus, Register::DeviceId) == DEVICE_ID_BLOCK
        && read_reg(bus, Register::VendorId) == VENDOR_ID_QEMU
}

/// Decode a 4-byte identification register into a printable string.
pub fn id_string(raw: u32) -> alloc::string::String {
    alloc::string::String::from_utf8_lossy(&raw.to_le_bytes()).into_owned()
}

/// Bring a device from reset to DRIVER_OK.
///
/// This is the initialization sequence the virtio standard requires: reset,
/// ACKNOWLEDGE, DRIVER, feature negotiation, virtqueue setup, DRIVER_OK.
/// The status bits are strictly monotonic; there is no downgrade path and
/// any refusal by the device is fatal.
///
/// Returns the device's queue 0, ready for use.
///
/// # Panics
///
/// Panics if the device rejects the negotiated feature subset or if queue
/// setup finds the queue unusable (see [`VirtQueue::setup`]).
pub fn initialize(
    bus: &dyn MmioBus,
    hal: &dyn Hal,
    profile: NegotiationProfile,
    mode: DeviceMode,
    name: &'static str,
) -> VirtQueue {
    // Reset, then make sure the device observed it before raising any
    // status bit.
    write_reg(bus, Register::Status, 0);
    fence(Ordering::SeqCst);

    let mut status = DeviceStatus::ACKNOWLEDGE;
    write_reg(bus, Register::Status, status.bits());

    status |= DeviceStatus::DRIVER;
    write_reg(bus, Register::Status, status.bits());

    let features = read_reg(bus, Register::DeviceFeatures) & !profile.excluded_features();
    write_reg(bus, Register::DriverFeatures, features);

    status |= DeviceStatus::FEATURES_OK;
    write_reg(bus, Register::Status, status.bits());

    // The device clears FEATURES_OK if it cannot live with our subset.
    let confirmed = DeviceStatus::from_bits_truncate(read_reg(bus, Register::Status));
    if !confirmed.contains(DeviceStatus::FEATURES_OK) {
        panic!("{}: device rejected the negotiated feature set", name);
    }

    let queue = VirtQueue::setup(bus, hal, mode, name);

    status |= DeviceStatus::DRIVER_OK;
    write_reg(bus, Register::Status, status.bits());

    queue
}
