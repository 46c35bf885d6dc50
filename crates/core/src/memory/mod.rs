//! Memory Management - Hierarchical Pools over Pluggable Allocators
//!
//! Implements the memory tree with:
//! - Preferred allocation sizes on a `2^k` / `1.5 * 2^k` series
//! - Heap and page-mapped allocator backends behind one trait
//! - Named, optionally capped pools arranged in a tree with per-node locking
//! - Chained usage trackers and a process-wide quota per manager
//! - One lazily created process-default manager per allocator variant

pub mod allocator;
pub mod manager;
pub mod mapped;
pub mod pool;
pub mod size_policy;
pub mod tracker;

pub use allocator::{AllocResult, AllocatorKind, HeapAllocator, MemoryAllocator};
pub use manager::{
    default_memory_pool, process_default_memory_manager, MemoryManager, MemoryQuota,
};
pub use mapped::{MappedAllocator, MappedMemory, SystemPageMapper};
pub use pool::{MemoryPool, PoolSnapshot};
pub use size_policy::{preferred_size, MIN_PREFERRED_SIZE};
pub use tracker::{UsageSnapshot, UsageTracker};
