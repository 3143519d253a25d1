//! Device drivers.

pub mod block;
pub mod virtio;
