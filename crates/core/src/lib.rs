//! `memtree` Core - Hierarchical Memory Pools
//!
//! This crate provides a tree of named, optionally capped memory pools that
//! account for every byte they hand out, on top of interchangeable allocator
//! backends.
//!
//! # Features
//!
//! - **Size policy**: requests are rounded onto a `2^k` / `1.5 * 2^k` series
//! - **Two backends**: C heap and anonymous page mappings, one trait
//! - **Pool tree**: per-node reader/writer locks, non-owning back links
//! - **Budgets**: numeric caps per subtree, propagating manual caps and a
//!   process quota per manager
//! - **Process defaults**: one lazily created manager per backend
//!
//! # Architecture
//!
//! - [`memory::size_policy`] - preferred allocation sizes
//! - [`memory::allocator`] / [`memory::mapped`] - allocator backends
//! - [`memory::pool`] - the pool tree
//! - [`memory::manager`] - process-default managers and quotas
//! - [`config`] - validated configuration from TOML and the environment
//!
//! # Example
//!
//! ```rust
//! use memtree_core::{MemoryManager, MemoryResult, AllocatorKind};
//!
//! fn main() -> MemoryResult<()> {
//!     let manager = MemoryManager::process_default(AllocatorKind::Heap);
//!     let query = manager.get_child(Some(1 << 20))?;
//!     let operator = query.add_child("hash_join", None)?;
//!
//!     let block = operator.allocate(1000)?;
//!     assert_eq!(operator.local_bytes(), 1024);
//!     unsafe { operator.free(block, 1000) };
//!
//!     drop(operator);
//!     Ok(())
//! }
//! ```

#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::large_stack_arrays,
    clippy::indexing_slicing,
    missing_docs,
)]
#![warn(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::correctness,
    clippy::suspicious,
    clippy::perf,
    clippy::style,
    clippy::complexity,
    clippy::let_underscore_future,
    clippy::diverging_sub_expression,
    clippy::unreachable,
    clippy::default_numeric_fallback,
    clippy::redundant_pattern_matching,
    clippy::manual_let_else,
    clippy::blocks_in_conditions,
    clippy::unnecessary_wraps,
    clippy::needless_pass_by_ref_mut,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::float_cmp,
    clippy::disallowed_methods
)]
#![allow(clippy::multiple_crate_versions)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Public modules
pub mod config;
pub mod error;
pub mod memory;
pub mod prelude;

// Re-exports for convenience
pub use config::{configure_process, process_config, MemoryConfig};
pub use error::{MemoryError, MemoryResult};
pub use memory::{
    default_memory_pool, process_default_memory_manager, AllocatorKind, MemoryAllocator,
    MemoryManager, MemoryPool,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
