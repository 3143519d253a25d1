//! Device abstraction layer.

pub mod block;
