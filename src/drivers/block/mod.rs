//! Block device drivers.

pub mod virtio_blk;
