//! Per-address nonce serialization

pub mod allocator;
pub mod lanes;

pub use allocator::{NonceAllocator, NonceLock};
pub use lanes::{LaneGuard, LaneStats, NonceLanes};
