//! `memtree` Core Prelude
//!
//! Common imports for working with pools and allocators.

pub use crate::config::{configure_process, process_config, MemoryConfig};
pub use crate::error::{MemoryError, MemoryResult};
pub use crate::memory::{
    default_memory_pool, preferred_size, process_default_memory_manager, AllocResult,
    AllocatorKind, HeapAllocator, MappedAllocator, MappedMemory, MemoryAllocator,
    MemoryManager, MemoryPool, MemoryQuota, PoolSnapshot, UsageTracker,
};

pub use std::sync::Arc;
