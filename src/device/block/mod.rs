//! Block device abstraction and registry.
//!
//! Drivers expose sector-granular storage through [`BlockDriver`] and hand
//! finished devices to a [`BlockRegistry`], where filesystem and partition
//! code looks them up by name.

use alloc::string::String;
use alloc::sync::Arc;
use hashbrown::HashMap;

/// Sector size of every block device in the system, in bytes.
pub const BLOCK_SECTOR_SIZE: usize = 512;

/// Index of a sector within a device.
pub type BlockSector = u64;

/// Direction of a block transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOp {
    Read,
    Write,
}

/// Sector-granular storage.
///
/// Implementations transfer exactly [`BLOCK_SECTOR_SIZE`] bytes per call
/// and block until the transfer is complete.
pub trait BlockDriver: Send + Sync {
    fn read_sector(&self, sector: BlockSector, buf: &mut [u8]);
    fn write_sector(&self, sector: BlockSector, buf: &[u8]);
}

/// A block device as seen by the rest of the kernel.
pub struct RegisteredBlock {
    pub name: String,
    /// Device size in sectors.
    pub capacity: BlockSector,
    /// Free-form description shown in device listings, e.g. the transport
    /// and vendor behind the device.
    pub extra_info: String,
    pub driver: Arc<dyn BlockDriver>,
}

impl RegisteredBlock {
    pub fn read_sector(&self, sector: BlockSector, buf: &mut [u8]) {
        assert!(sector < self.capacity, "{}: sector {} out of range", self.name, sector);
        self.driver.read_sector(sector, buf);
    }

    pub fn write_sector(&self, sector: BlockSector, buf: &[u8]) {
        assert!(sector < self.capacity, "{}: sector {} out of range", self.name, sector);
        self.driver.write_sector(sector, buf);
    }
}

/// Discovers partitions on a freshly registered device.
///
/// Hooked in by the partition code so that device drivers do not need to
/// know anything about partition tables.
pub trait PartitionScanner: Send + Sync {
    fn scan(&self, device: &Arc<RegisteredBlock>);
}

/// Name-keyed collection of the block devices in the system.
#[derive(Default)]
pub struct BlockRegistry {
    devices: HashMap<String, Arc<RegisteredBlock>>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device and return the shared handle.
    ///
    /// # Panics
    ///
    /// Panics if a device of the same name is already registered.
    pub fn register(
        &mut self,
        name: &str,
        capacity: BlockSector,
        extra_info: String,
        driver: Arc<dyn BlockDriver>,
    ) -> Arc<RegisteredBlock> {
        let device = Arc::new(RegisteredBlock {
            name: String::from(name),
            capacity,
            extra_info,
            driver,
        });
        let prev = self.devices.insert(String::from(name), device.clone());
        assert!(prev.is_none(), "block device {} registered twice", name);
        log::info!(
            "{}: {} sectors ({} kB), {}",
            device.name,
            device.capacity,
            device.capacity * BLOCK_SECTOR_SIZE as u64 / 1024,
            device.extra_info
        );
        device
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegisteredBlock>> {
        self.devices.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
