//! Public URL allocation for tunnel sessions
//!
//! Builds collision-free public URLs from owner and project identifiers.
//! The allocation table is private to this crate; the registry and the
//! forwarder never touch it directly.

pub mod allocator;

pub use allocator::{AllocatorConfig, AllocatorError, UrlAllocator};
