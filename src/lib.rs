//! Vermilion - trap dispatch and virtio block I/O core for a RISC-V kernel.
//!
//! This crate provides the interrupt plumbing and the virtio-mmio block
//! driver of a single-hart RISC-V kernel:
//!
//! - [`interrupt`]: the trap vector table and dispatcher, plus the
//!   Platform-Level Interrupt Controller (PLIC) driver it claims external
//!   interrupts from.
//! - [`drivers::virtio`]: the virtio-mmio transport (device status state
//!   machine, feature negotiation) and the split virtqueue.
//! - [`drivers::block`]: the virtio block request engine and MMIO slot
//!   discovery.
//! - [`device::block`]: the block device registry the discovered disks are
//!   registered with.
//!
//! Hardware access goes through the [`mmio::MmioBus`] trait and everything
//! the kernel proper provides (DMA memory, address translation, sleeping,
//! the completion signal) through the [`hal::Hal`] trait, so the protocol
//! logic itself has no hidden dependency on a particular machine.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod device;
pub mod drivers;
pub mod hal;
pub mod interrupt;
pub mod mmio;
pub mod retry;
