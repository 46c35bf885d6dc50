//! Memory Managers - Process-Wide Pool Roots
//!
//! A [`MemoryManager`] owns one allocator, one process quota and the root of a
//! pool tree. Each allocator variant has exactly one lazily created
//! process-default manager; [`process_default_memory_manager`] picks between
//! them from the process configuration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::config::process_config;
use crate::error::{MemoryError, MemoryResult};
use crate::memory::allocator::{AllocatorKind, MemoryAllocator};
use crate::memory::pool::MemoryPool;
use crate::memory::tracker::UsageTracker;

static HEAP_MANAGER: OnceLock<MemoryManager> = OnceLock::new();
static MAPPED_MANAGER: OnceLock<MemoryManager> = OnceLock::new();

/// Byte budget shared by every pool of a manager
#[derive(Debug)]
pub struct MemoryQuota {
    limit: u64,
    used: AtomicU64,
}

impl MemoryQuota {
    /// Create quota with a byte limit
    #[must_use]
    pub fn new(limit: u64) -> Arc<Self> {
        Arc::new(Self {
            limit,
            used: AtomicU64::new(0),
        })
    }

    /// Create quota that never refuses
    #[must_use]
    pub fn unlimited() -> Arc<Self> {
        Self::new(u64::MAX)
    }

    /// Byte limit
    #[must_use]
    pub const fn limit(&self) -> u64 {
        self.limit
    }

    /// Bytes currently reserved
    #[must_use]
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    /// Reserve `bytes`, all or nothing
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::QuotaExceeded`] if the limit would be passed.
    pub fn try_reserve(&self, bytes: u64) -> MemoryResult<()> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|total| *total <= self.limit)
            })
            .map(|_| ())
            .map_err(|_| MemoryError::QuotaExceeded {
                requested: bytes,
                quota: self.limit,
            })
    }

    /// Return `bytes` to the quota
    pub fn release(&self, bytes: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }
}

/// Root of a pool tree bound to one allocator
#[derive(Debug)]
pub struct MemoryManager {
    kind: AllocatorKind,
    allocator: Arc<dyn MemoryAllocator>,
    quota: Arc<MemoryQuota>,
    root: Arc<MemoryPool>,
    child_seq: AtomicU64,
}

impl MemoryManager {
    /// Create manager
    ///
    /// The root pool is uncapped and carries a root [`UsageTracker`], so every
    /// pool created through [`MemoryManager::get_child`] is tracked.
    #[must_use]
    pub fn new(
        allocator: Arc<dyn MemoryAllocator>,
        quota_bytes: u64,
        root_name: impl Into<String>,
    ) -> Self {
        let quota = MemoryQuota::new(quota_bytes);
        let root = MemoryPool::new_root(root_name, None, Arc::clone(&allocator), Arc::clone(&quota));
        root.set_usage_tracker(UsageTracker::new());
        Self {
            kind: allocator.kind(),
            allocator,
            quota,
            root,
            child_seq: AtomicU64::new(0),
        }
    }

    /// Process-default manager for `kind`, created on first use
    ///
    /// Both variants can coexist; each is constructed at most once.
    pub fn process_default(kind: AllocatorKind) -> &'static Self {
        let cell = match kind {
            AllocatorKind::Heap => &HEAP_MANAGER,
            AllocatorKind::Mapped => &MAPPED_MANAGER,
        };
        cell.get_or_init(|| {
            let config = process_config();
            tracing::info!(
                "Creating process-default {} memory manager (quota: {} bytes)",
                kind,
                config.process_quota_bytes
            );
            Self::new(
                kind.create_default(),
                config.process_quota_bytes,
                config.root_pool_name.clone(),
            )
        })
    }

    /// Create a new pool directly under the root
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::DuplicateChild`] if the generated name is
    /// already taken by a child added through [`MemoryManager::root`].
    pub fn get_child(&self, cap: Option<u64>) -> MemoryResult<Arc<MemoryPool>> {
        let seq = self.child_seq.fetch_add(1, Ordering::Relaxed);
        let pool = self.root.add_child(format!("pool_{seq}"), cap)?;
        tracing::debug!("{} manager created pool '{}'", self.kind, pool.name());
        Ok(pool)
    }

    /// Allocator variant
    #[must_use]
    pub const fn kind(&self) -> AllocatorKind {
        self.kind
    }

    /// Root pool
    #[must_use]
    pub const fn root(&self) -> &Arc<MemoryPool> {
        &self.root
    }

    /// Shared allocator
    #[must_use]
    pub const fn allocator(&self) -> &Arc<dyn MemoryAllocator> {
        &self.allocator
    }

    /// Bytes reserved across all pools of this manager
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.quota.used()
    }

    /// Process quota in bytes
    #[must_use]
    pub fn quota_bytes(&self) -> u64 {
        self.quota.limit()
    }
}

/// Process-default manager selected by `use_mmap_allocator`
pub fn process_default_memory_manager() -> &'static MemoryManager {
    let kind = AllocatorKind::from_use_mmap(process_config().use_mmap_allocator);
    MemoryManager::process_default(kind)
}

/// New pool from the process-default manager
///
/// Without an explicit `cap` the configured `default_pool_cap_bytes` applies.
///
/// # Errors
///
/// Same as [`MemoryManager::get_child`].
pub fn default_memory_pool(cap: Option<u64>) -> MemoryResult<Arc<MemoryPool>> {
    let cap = cap.or(process_config().default_pool_cap_bytes);
    process_default_memory_manager().get_child(cap)
}
