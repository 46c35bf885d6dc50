//! Memory Pool Tree - Hierarchical Accounting Scopes
//!
//! A [`MemoryPool`] is a named node in a tree of accounting scopes:
//! - Each node guards its own children with a reader/writer lock, so unrelated
//!   subtrees never contend
//! - Parents and children refer to each other through `Weak` handles only;
//!   whoever holds the `Arc` returned by [`MemoryPool::add_child`] owns the pool
//! - A pool detaches itself from its parent when dropped, and must not have
//!   live children at that moment
//! - Reservations are charged to the pool and every ancestor, so a cap on any
//!   node bounds the aggregate of its whole subtree
//!
//! Pools do not manage memory themselves. They gate and account for requests
//! and hand the actual work to the manager's [`MemoryAllocator`].

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, MemoryResult};
use crate::memory::allocator::{AllocResult, HeapAllocator, MemoryAllocator};
use crate::memory::manager::MemoryQuota;
use crate::memory::size_policy;
use crate::memory::tracker::{UsageSnapshot, UsageTracker};

/// Serializable view of a pool subtree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    /// Pool name
    pub name: String,
    /// Numeric cap in bytes (None = unbounded)
    pub cap: Option<u64>,
    /// Whether the pool is manually capped
    pub capped: bool,
    /// Bytes reserved directly by this pool
    pub local_bytes: u64,
    /// Bytes reserved by this pool and all descendants
    pub aggregate_bytes: u64,
    /// Usage tracker counters, when a tracker is attached
    pub usage: Option<UsageSnapshot>,
    /// Direct children in insertion order
    pub children: Vec<PoolSnapshot>,
}

/// Registered child: name for sibling uniqueness, weak handle for identity
struct ChildEntry {
    name: String,
    pool: Weak<MemoryPool>,
}

/// Named, optionally capped accounting scope
pub struct MemoryPool {
    name: String,
    parent: Option<Weak<MemoryPool>>,
    cap: Option<u64>,
    capped: AtomicBool,
    children: RwLock<Vec<ChildEntry>>,
    usage_tracker: RwLock<Option<Arc<UsageTracker>>>,
    allocator: Arc<dyn MemoryAllocator>,
    quota: Arc<MemoryQuota>,
    /// Bytes reserved through this pool
    local_bytes: AtomicU64,
    /// Bytes reserved through this pool and its descendants
    subtree_bytes: AtomicU64,
}

impl MemoryPool {
    /// Create a root pool on top of an allocator and a process quota
    #[must_use]
    pub fn new_root(
        name: impl Into<String>,
        cap: Option<u64>,
        allocator: Arc<dyn MemoryAllocator>,
        quota: Arc<MemoryQuota>,
    ) -> Arc<Self> {
        Arc::new(Self::with_parent(name.into(), None, cap, allocator, quota))
    }

    /// Create an unbounded heap-backed root pool
    #[must_use]
    pub fn root(name: impl Into<String>) -> Arc<Self> {
        Self::new_root(
            name,
            None,
            Arc::new(HeapAllocator::new()),
            MemoryQuota::unlimited(),
        )
    }

    fn with_parent(
        name: String,
        parent: Option<Weak<Self>>,
        cap: Option<u64>,
        allocator: Arc<dyn MemoryAllocator>,
        quota: Arc<MemoryQuota>,
    ) -> Self {
        Self {
            name,
            parent,
            cap,
            capped: AtomicBool::new(false),
            children: RwLock::new(Vec::new()),
            usage_tracker: RwLock::new(None),
            allocator,
            quota,
            local_bytes: AtomicU64::new(0),
            subtree_bytes: AtomicU64::new(0),
        }
    }

    /// Pool name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent pool, if this is not a root and the parent is still alive
    #[must_use]
    pub fn parent(&self) -> Option<Arc<Self>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Numeric cap in bytes (None = unbounded)
    #[must_use]
    pub const fn cap(&self) -> Option<u64> {
        self.cap
    }

    /// Allocator backing this pool
    #[must_use]
    pub const fn allocator(&self) -> &Arc<dyn MemoryAllocator> {
        &self.allocator
    }

    /// Number of direct children
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children.read().len()
    }

    /// Call `visitor` once per live direct child, in insertion order
    ///
    /// The read lock on this pool's children is held for the whole traversal,
    /// so the visitor must not add or drop children of this pool (directly or
    /// by releasing the last handle to one of them inside the callback).
    pub fn visit_children<F>(&self, mut visitor: F)
    where
        F: FnMut(&Arc<Self>),
    {
        let children = self.children.read();
        // Children whose last handle is going away are skipped; their upgrade
        // fails before they detach.
        let live: Vec<Arc<Self>> = children.iter().filter_map(|c| c.pool.upgrade()).collect();
        for child in &live {
            visitor(child);
        }
        drop(children);
        // `live` is released after the lock so a final drop can detach.
        drop(live);
    }

    /// Look up a direct child by name
    #[must_use]
    pub fn find_child(&self, name: &str) -> Option<Arc<Self>> {
        let children = self.children.read();
        children
            .iter()
            .find(|c| c.name == name)
            .and_then(|c| c.pool.upgrade())
    }

    /// Create and register a child pool
    ///
    /// The child is capped immediately when this pool is capped, and receives
    /// a tracker derived from this pool's tracker when one is attached.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::DuplicateChild`] if a direct child already uses
    /// `name`; the tree is left unchanged.
    pub fn add_child(
        self: &Arc<Self>,
        name: impl Into<String>,
        cap: Option<u64>,
    ) -> MemoryResult<Arc<Self>> {
        let name = name.into();
        let mut children = self.children.write();
        if children.iter().any(|c| c.name == name) {
            return Err(MemoryError::duplicate_child(&self.name, name));
        }

        let child = Arc::new(Self::with_parent(
            name.clone(),
            Some(Arc::downgrade(self)),
            cap,
            Arc::clone(&self.allocator),
            Arc::clone(&self.quota),
        ));
        if self.is_memory_capped() {
            child.cap_memory_allocation();
        }
        if let Some(tracker) = self.usage_tracker() {
            child.set_usage_tracker(tracker.add_child());
        }
        children.push(ChildEntry {
            name,
            pool: Arc::downgrade(&child),
        });
        drop(children);

        tracing::debug!(
            "Attached pool '{}' to '{}' (cap: {:?})",
            child.name,
            self.name,
            cap
        );
        Ok(child)
    }

    /// Remove `child` from this pool's children
    ///
    /// Runs automatically when a child pool is dropped.
    ///
    /// # Panics
    ///
    /// Panics if `child` is not a direct child of this pool, which means a
    /// pool is being detached from a parent it does not belong to.
    pub fn drop_child(&self, child: &Self) {
        let mut children = self.children.write();
        let target: *const Self = child;
        let index = children
            .iter()
            .position(|c| ptr::eq(c.pool.as_ptr(), target));
        assert!(
            index.is_some(),
            "pool '{}' is not a child of pool '{}'",
            child.name,
            self.name
        );
        if let Some(index) = index {
            children.remove(index);
        }
    }

    /// Preferred backend size for a request of `size` bytes
    #[must_use]
    pub const fn preferred_size(size: usize) -> usize {
        size_policy::preferred_size(size)
    }

    /// Whether reservations are currently refused by a manual cap
    #[must_use]
    pub fn is_memory_capped(&self) -> bool {
        self.capped.load(Ordering::Acquire)
    }

    /// Refuse further reservations in this pool and all descendants
    pub fn cap_memory_allocation(&self) {
        self.capped.store(true, Ordering::Release);
        self.visit_children(|child| child.cap_memory_allocation());
    }

    /// Lift the manual cap on this pool and all descendants
    ///
    /// Returns `false` without changing anything while the parent is capped.
    pub fn uncap_memory_allocation(&self) -> bool {
        if self.parent().is_some_and(|p| p.is_memory_capped()) {
            return false;
        }
        self.capped.store(false, Ordering::Release);
        self.visit_children(|child| {
            child.uncap_memory_allocation();
        });
        true
    }

    /// Attached usage tracker
    #[must_use]
    pub fn usage_tracker(&self) -> Option<Arc<UsageTracker>> {
        self.usage_tracker.read().clone()
    }

    /// Attach a usage tracker; later reservations are reported to it
    pub fn set_usage_tracker(&self, tracker: Arc<UsageTracker>) {
        *self.usage_tracker.write() = Some(tracker);
    }

    /// Bytes reserved directly through this pool
    #[must_use]
    pub fn local_bytes(&self) -> u64 {
        self.local_bytes.load(Ordering::Relaxed)
    }

    /// Bytes reserved through this pool and all descendants
    #[must_use]
    pub fn aggregate_bytes(&self) -> u64 {
        self.subtree_bytes.load(Ordering::Relaxed)
    }

    /// Reserve `bytes` against this pool, its ancestors and the process quota
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::ManualCap`] if the pool is capped,
    /// [`MemoryError::QuotaExceeded`] if the process quota is exhausted, or
    /// [`MemoryError::CapExceeded`] naming the first pool on the path to the
    /// root whose cap would be exceeded. Nothing stays reserved on error.
    pub fn reserve(&self, bytes: u64) -> MemoryResult<()> {
        if self.is_memory_capped() {
            return Err(MemoryError::manual_cap(&self.name));
        }
        self.quota.try_reserve(bytes)?;
        if let Err(err) = self.charge_subtree(bytes) {
            self.quota.release(bytes);
            return Err(err);
        }
        self.local_bytes.fetch_add(bytes, Ordering::Relaxed);
        if let Some(tracker) = self.usage_tracker() {
            tracker.update(to_delta(bytes));
        }
        Ok(())
    }

    /// Return `bytes` previously reserved through this pool
    ///
    /// At most [`MemoryPool::local_bytes`] are released; bytes reserved by
    /// other pools are never touched.
    pub fn release(&self, bytes: u64) {
        let previous = match self.local_bytes.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |current| Some(current.saturating_sub(bytes)),
        ) {
            Ok(previous) | Err(previous) => previous,
        };
        let released = bytes.min(previous);
        if released == 0 {
            return;
        }
        self.discharge_subtree(released);
        self.quota.release(released);
        if let Some(tracker) = self.usage_tracker() {
            tracker.update(-to_delta(released));
        }
    }

    /// Allocate `size` bytes, rounded to the preferred size
    ///
    /// # Errors
    ///
    /// Returns the reservation error if a cap or the quota refuses the request.
    /// Backend exhaustion is `Ok(None)`.
    pub fn allocate(&self, size: usize) -> AllocResult {
        let size = Self::preferred_size(size);
        self.with_reservation(size, || Ok(self.allocator.alloc(size)))
    }

    /// Allocate `count * size_each` zeroed bytes, rounded to the preferred size
    ///
    /// # Errors
    ///
    /// Same as [`MemoryPool::allocate`]; an overflowing product is
    /// `Ok(None)`.
    pub fn allocate_zero_filled(&self, count: usize, size_each: usize) -> AllocResult {
        let Some(total) = count.checked_mul(size_each) else {
            return Ok(None);
        };
        let size = Self::preferred_size(total);
        self.with_reservation(size, || Ok(self.allocator.alloc_zero_filled(1, size)))
    }

    /// Allocate `size` bytes aligned to `alignment`, rounded to the preferred size
    ///
    /// # Errors
    ///
    /// Returns the reservation error, or the allocator's
    /// [`MemoryError::Unsupported`] / [`MemoryError::InvalidAlignment`].
    pub fn allocate_aligned(&self, alignment: u16, size: usize) -> AllocResult {
        let size = Self::preferred_size(size);
        self.with_reservation(size, || self.allocator.alloc_aligned(alignment, size))
    }

    /// Resize an allocation made through this pool
    ///
    /// Only growth is reserved; shrinkage is released once the backend call
    /// succeeds. On `Ok(None)` the old block is still valid.
    ///
    /// # Errors
    ///
    /// Returns the reservation error when growth is refused.
    ///
    /// # Safety
    ///
    /// `ptr`, when present, must come from this pool with size `size`.
    pub unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        size: usize,
        new_size: usize,
    ) -> AllocResult {
        let old = if ptr.is_some() {
            Self::preferred_size(size)
        } else {
            0
        };
        let new = Self::preferred_size(new_size);
        self.with_resize(old, new, || {
            // SAFETY: the caller guarantees `ptr` came from this pool; `old` re-derives its backend size.
            Ok(unsafe { self.allocator.realloc(ptr, old, new) })
        })
    }

    /// Resize an allocation into a block aligned to `alignment`
    ///
    /// # Errors
    ///
    /// Same as [`MemoryPool::allocate_aligned`].
    ///
    /// # Safety
    ///
    /// `ptr`, when present, must come from this pool with size `size`.
    pub unsafe fn reallocate_aligned(
        &self,
        ptr: Option<NonNull<u8>>,
        alignment: u16,
        size: usize,
        new_size: usize,
    ) -> AllocResult {
        let old = if ptr.is_some() {
            Self::preferred_size(size)
        } else {
            0
        };
        let new = Self::preferred_size(new_size);
        // SAFETY: the caller guarantees `ptr` came from this pool; `old` re-derives its backend size.
        self.with_resize(old, new, || unsafe {
            self.allocator.realloc_aligned(ptr, alignment, old, new)
        })
    }

    /// Free an allocation made through this pool
    ///
    /// # Safety
    ///
    /// `ptr`, when present, must come from this pool with size `size` and
    /// must not be used afterwards.
    pub unsafe fn free(&self, ptr: Option<NonNull<u8>>, size: usize) {
        if ptr.is_none() {
            return;
        }
        let size = Self::preferred_size(size);
        // SAFETY: the caller guarantees `ptr` came from this pool; `size` is its backend size.
        unsafe { self.allocator.free(ptr, size) };
        self.release(to_bytes(size));
    }

    /// Snapshot this pool and its subtree
    #[must_use]
    pub fn snapshot(&self) -> PoolSnapshot {
        let mut children = Vec::new();
        self.visit_children(|child| children.push(child.snapshot()));
        PoolSnapshot {
            name: self.name.clone(),
            cap: self.cap,
            capped: self.is_memory_capped(),
            local_bytes: self.local_bytes(),
            aggregate_bytes: self.aggregate_bytes(),
            usage: self.usage_tracker().map(|t| t.snapshot()),
            children,
        }
    }

    fn with_reservation<F>(&self, size: usize, allocate: F) -> AllocResult
    where
        F: FnOnce() -> AllocResult,
    {
        let bytes = to_bytes(size);
        self.reserve(bytes)?;
        match allocate() {
            Ok(Some(block)) => Ok(Some(block)),
            Ok(None) => {
                self.release(bytes);
                Ok(None)
            }
            Err(err) => {
                self.release(bytes);
                Err(err)
            }
        }
    }

    fn with_resize<F>(&self, old: usize, new: usize, resize: F) -> AllocResult
    where
        F: FnOnce() -> AllocResult,
    {
        let growth = to_bytes(new.saturating_sub(old));
        let shrink = to_bytes(old.saturating_sub(new));
        if growth > 0 {
            self.reserve(growth)?;
        }
        let result = resize();
        match &result {
            Ok(Some(_)) if shrink > 0 => self.release(shrink),
            Ok(None) | Err(_) if growth > 0 => self.release(growth),
            _ => {}
        }
        result
    }

    fn charge_subtree(&self, bytes: u64) -> MemoryResult<()> {
        let total = self.subtree_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;
        if let Some(cap) = self.cap {
            if total > cap {
                self.subtree_bytes.fetch_sub(bytes, Ordering::AcqRel);
                return Err(MemoryError::cap_exceeded(&self.name, bytes, cap));
            }
        }
        if let Some(parent) = self.parent() {
            if let Err(err) = parent.charge_subtree(bytes) {
                self.subtree_bytes.fetch_sub(bytes, Ordering::AcqRel);
                return Err(err);
            }
        }
        Ok(())
    }

    fn discharge_subtree(&self, bytes: u64) {
        let _ = self
            .subtree_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            });
        if let Some(parent) = self.parent() {
            parent.discharge_subtree(bytes);
        }
    }
}

fn to_bytes(size: usize) -> u64 {
    u64::try_from(size).unwrap_or(u64::MAX)
}

fn to_delta(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("name", &self.name)
            .field("cap", &self.cap)
            .field("capped", &self.is_memory_capped())
            .field("local_bytes", &self.local_bytes())
            .field("aggregate_bytes", &self.aggregate_bytes())
            .field("allocator", &self.allocator.kind())
            .finish_non_exhaustive()
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        // Entries whose pool is already gone only wait for that pool to detach.
        let live_children = self
            .children
            .get_mut()
            .iter()
            .filter(|c| c.pool.strong_count() > 0)
            .count();
        assert!(
            live_children == 0,
            "memory pool '{}' dropped with {} live children",
            self.name,
            live_children
        );

        let outstanding = *self.local_bytes.get_mut();
        if outstanding > 0 {
            tracing::warn!(
                "Memory pool '{}' dropped with {} bytes still reserved",
                self.name,
                outstanding
            );
            self.release(outstanding);
        }

        if let Some(parent) = self.parent.as_ref() {
            match parent.upgrade() {
                Some(parent) => {
                    parent.drop_child(self);
                    tracing::debug!("Detached pool '{}' from '{}'", self.name, parent.name);
                }
                None => tracing::warn!(
                    "Memory pool '{}' outlived its parent; nothing to detach from",
                    self.name
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::mapped::MappedAllocator;

    #[test]
    fn test_add_child_registers_once() -> MemoryResult<()> {
        let root = MemoryPool::root("root");
        assert_eq!(root.child_count(), 0);

        let child = root.add_child("x", Some(1024))?;
        assert_eq!(root.child_count(), 1);
        assert_eq!(child.name(), "x");
        assert_eq!(child.cap(), Some(1024));
        assert!(child
            .parent()
            .is_some_and(|p| Arc::ptr_eq(&p, &root)));

        let mut seen = Vec::new();
        root.visit_children(|c| seen.push(c.name().to_string()));
        assert_eq!(seen, vec!["x".to_string()]);
        Ok(())
    }

    #[test]
    fn test_visit_children_in_insertion_order() -> MemoryResult<()> {
        let root = MemoryPool::root("root");
        let _c = root.add_child("c", None)?;
        let _a = root.add_child("a", None)?;
        let _b = root.add_child("b", None)?;

        let mut seen = Vec::new();
        root.visit_children(|c| seen.push(c.name().to_string()));
        assert_eq!(seen, vec!["c", "a", "b"]);
        Ok(())
    }

    #[test]
    fn test_duplicate_name_leaves_tree_unchanged() -> MemoryResult<()> {
        let root = MemoryPool::root("root");
        let _first = root.add_child("scan", None)?;

        let result = root.add_child("scan", Some(64));
        assert_eq!(
            result.map(|_| ()),
            Err(MemoryError::duplicate_child("root", "scan"))
        );
        assert_eq!(root.child_count(), 1);
        Ok(())
    }

    #[test]
    fn test_same_name_allowed_under_different_parents() -> MemoryResult<()> {
        let root = MemoryPool::root("root");
        let left = root.add_child("left", None)?;
        let right = root.add_child("right", None)?;
        let _a = left.add_child("agg", None)?;
        let _b = right.add_child("agg", None)?;
        assert_eq!(left.child_count(), 1);
        assert_eq!(right.child_count(), 1);
        Ok(())
    }

    #[test]
    fn test_dropping_child_detaches_it() -> MemoryResult<()> {
        let root = MemoryPool::root("root");
        let keep = root.add_child("keep", None)?;
        let gone = root.add_child("gone", None)?;
        assert_eq!(root.child_count(), 2);

        drop(gone);
        assert_eq!(root.child_count(), 1);
        assert!(root.find_child("gone").is_none());
        assert!(root.find_child("keep").is_some());

        // The freed name can be reused.
        let _again = root.add_child("gone", None)?;
        assert_eq!(root.child_count(), 2);
        drop(keep);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "live children")]
    fn test_dropping_pool_with_live_child_panics() {
        let root = MemoryPool::root("root");
        #[allow(clippy::unwrap_used)]
        let _child = root.add_child("child", None).unwrap();
        drop(root);
    }

    #[test]
    #[should_panic(expected = "is not a child of pool")]
    fn test_drop_child_of_foreign_pool_panics() {
        let root = MemoryPool::root("root");
        let other = MemoryPool::root("other");
        #[allow(clippy::unwrap_used)]
        let stranger = other.add_child("stranger", None).unwrap();
        root.drop_child(&stranger);
    }

    #[test]
    fn test_capped_parent_caps_new_children() -> MemoryResult<()> {
        let root = MemoryPool::root("root");
        let query = root.add_child("query", Some(1 << 20))?;
        query.cap_memory_allocation();

        let operator = query.add_child("operator", Some(1 << 30))?;
        assert!(operator.is_memory_capped());
        let nested = operator.add_child("nested", None)?;
        assert!(nested.is_memory_capped());
        assert!(!root.is_memory_capped());
        Ok(())
    }

    #[test]
    fn test_cap_propagates_to_existing_descendants() -> MemoryResult<()> {
        let root = MemoryPool::root("root");
        let a = root.add_child("a", None)?;
        let b = a.add_child("b", None)?;
        root.cap_memory_allocation();
        assert!(a.is_memory_capped());
        assert!(b.is_memory_capped());
        Ok(())
    }

    #[test]
    fn test_uncap_refused_while_parent_capped() -> MemoryResult<()> {
        let root = MemoryPool::root("root");
        let a = root.add_child("a", None)?;
        let b = a.add_child("b", None)?;
        root.cap_memory_allocation();

        assert!(!b.uncap_memory_allocation());
        assert!(b.is_memory_capped());

        assert!(root.uncap_memory_allocation());
        assert!(!a.is_memory_capped());
        assert!(!b.is_memory_capped());
        Ok(())
    }

    #[test]
    fn test_children_receive_derived_trackers() -> MemoryResult<()> {
        let root = MemoryPool::root("root");
        let root_tracker = UsageTracker::new();
        root.set_usage_tracker(Arc::clone(&root_tracker));

        let child = root.add_child("child", None)?;
        let child_tracker = child.usage_tracker();
        assert!(child_tracker.is_some());
        assert!(child_tracker
            .as_ref()
            .and_then(|t| t.parent())
            .is_some_and(|p| Arc::ptr_eq(p, &root_tracker)));

        child.reserve(100)?;
        assert_eq!(root_tracker.current_bytes(), 100);
        child.release(100);
        assert_eq!(root_tracker.current_bytes(), 0);
        Ok(())
    }

    #[test]
    fn test_pool_without_tracker_gives_children_none() -> MemoryResult<()> {
        let root = MemoryPool::root("root");
        let child = root.add_child("child", None)?;
        assert!(child.usage_tracker().is_none());
        Ok(())
    }

    #[test]
    fn test_allocate_rounds_to_preferred_size() -> MemoryResult<()> {
        let root = MemoryPool::root("root");
        let pool = root.add_child("pool", None)?;

        let ptr = pool.allocate(100)?;
        assert!(ptr.is_some());
        assert_eq!(pool.local_bytes(), 128);
        assert_eq!(root.aggregate_bytes(), 128);
        assert_eq!(root.local_bytes(), 0);

        unsafe { pool.free(ptr, 100) };
        assert_eq!(pool.local_bytes(), 0);
        assert_eq!(root.aggregate_bytes(), 0);
        Ok(())
    }

    #[test]
    fn test_release_never_exceeds_own_reservation() -> MemoryResult<()> {
        let quota = MemoryQuota::unlimited();
        let root = MemoryPool::new_root(
            "root",
            None,
            Arc::new(HeapAllocator::new()),
            Arc::clone(&quota),
        );
        let query = root.add_child("query", Some(256))?;
        let left = query.add_child("left", None)?;
        let right = query.add_child("right", None)?;

        left.reserve(200)?;
        right.release(200);
        assert_eq!(right.local_bytes(), 0);
        assert_eq!(query.aggregate_bytes(), 200);
        assert_eq!(root.aggregate_bytes(), 200);
        assert_eq!(quota.used(), 200);

        assert_eq!(
            right.reserve(256),
            Err(MemoryError::cap_exceeded("query", 256, 256))
        );
        right.reserve(56)?;

        // Over-release is clamped to what the pool holds.
        right.release(1000);
        assert_eq!(query.aggregate_bytes(), 200);
        left.release(200);
        assert_eq!(quota.used(), 0);
        Ok(())
    }

    #[test]
    fn test_failed_drop_leaves_parent_unchanged() -> MemoryResult<()> {
        let root = MemoryPool::root("root");
        let mid = root.add_child("mid", None)?;
        let leaf = mid.add_child("leaf", None)?;

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || drop(mid)));
        assert!(result.is_err());

        // The entry for `mid` is still registered with its parent.
        assert_eq!(root.child_count(), 1);
        assert!(root.find_child("mid").is_none());
        drop(leaf);
        Ok(())
    }

    #[test]
    fn test_cap_bounds_subtree() -> MemoryResult<()> {
        let root = MemoryPool::root("root");
        let query = root.add_child("query", Some(256))?;
        let left = query.add_child("left", None)?;
        let right = query.add_child("right", None)?;

        left.reserve(200)?;
        let err = right.reserve(100);
        assert_eq!(err, Err(MemoryError::cap_exceeded("query", 100, 256)));
        assert_eq!(right.local_bytes(), 0);
        assert_eq!(query.aggregate_bytes(), 200);

        right.reserve(56)?;
        assert_eq!(query.aggregate_bytes(), 256);
        left.release(200);
        right.release(56);
        assert_eq!(query.aggregate_bytes(), 0);
        Ok(())
    }

    #[test]
    fn test_manual_cap_refuses_reservation() -> MemoryResult<()> {
        let root = MemoryPool::root("root");
        let pool = root.add_child("pool", None)?;
        pool.cap_memory_allocation();

        assert_eq!(pool.allocate(8), Err(MemoryError::manual_cap("pool")));
        assert_eq!(pool.local_bytes(), 0);

        assert!(pool.uncap_memory_allocation());
        let ptr = pool.allocate(8)?;
        unsafe { pool.free(ptr, 8) };
        Ok(())
    }

    #[test]
    fn test_quota_refuses_reservation() -> MemoryResult<()> {
        let root = MemoryPool::new_root(
            "root",
            None,
            Arc::new(HeapAllocator::new()),
            MemoryQuota::new(64),
        );
        let pool = root.add_child("pool", None)?;
        pool.reserve(64)?;
        assert!(matches!(
            pool.reserve(1),
            Err(MemoryError::QuotaExceeded { quota: 64, .. })
        ));
        assert_eq!(pool.aggregate_bytes(), 64);
        pool.release(64);
        Ok(())
    }

    #[test]
    fn test_reallocate_accounts_growth_and_shrink() -> MemoryResult<()> {
        let root = MemoryPool::root("root");
        let pool = root.add_child("pool", None)?;

        let ptr = pool.allocate(16)?;
        assert_eq!(pool.local_bytes(), 16);
        let grown = unsafe { pool.reallocate(ptr, 16, 1000)? };
        assert!(grown.is_some());
        assert_eq!(pool.local_bytes(), 1024);
        let shrunk = unsafe { pool.reallocate(grown, 1000, 20)? };
        assert_eq!(pool.local_bytes(), 24);
        unsafe { pool.free(shrunk, 20) };
        assert_eq!(pool.local_bytes(), 0);
        Ok(())
    }

    #[test]
    fn test_reallocate_from_null_reserves_full_size() -> MemoryResult<()> {
        let root = MemoryPool::root("root");
        let ptr = unsafe { root.reallocate(None, 0, 64)? };
        assert!(ptr.is_some());
        assert_eq!(root.local_bytes(), 64);
        unsafe { root.free(ptr, 64) };
        Ok(())
    }

    #[test]
    fn test_aligned_allocation_on_heap_pool() -> MemoryResult<()> {
        let root = MemoryPool::root("root");
        let ptr = root.allocate_aligned(64, 100)?;
        assert!(ptr.is_some_and(|p| p.as_ptr() as usize % 64 == 0));
        let moved = unsafe { root.reallocate_aligned(ptr, 256, 100, 300)? };
        assert!(moved.is_some_and(|p| p.as_ptr() as usize % 256 == 0));
        assert_eq!(root.local_bytes(), 384);
        unsafe { root.free(moved, 300) };
        Ok(())
    }

    #[test]
    fn test_unsupported_alignment_rolls_back_reservation() -> MemoryResult<()> {
        let root = MemoryPool::new_root(
            "root",
            None,
            Arc::new(MappedAllocator::with_system_mapper()),
            MemoryQuota::unlimited(),
        );
        let pool = root.add_child("pool", None)?;
        let err = pool.allocate_aligned(64, 4096);
        assert!(matches!(err, Err(ref e) if e.is_unsupported()));
        assert_eq!(pool.local_bytes(), 0);
        assert_eq!(root.aggregate_bytes(), 0);

        let ptr = pool.allocate_zero_filled(4, 1024)?;
        assert_eq!(pool.local_bytes(), 4096);
        unsafe { pool.free(ptr, 4096) };
        Ok(())
    }

    #[test]
    fn test_dropping_pool_with_outstanding_bytes_releases_them() -> MemoryResult<()> {
        let quota = MemoryQuota::unlimited();
        let root = MemoryPool::new_root(
            "root",
            None,
            Arc::new(HeapAllocator::new()),
            Arc::clone(&quota),
        );
        let leaky = root.add_child("leaky", None)?;
        leaky.reserve(512)?;
        assert_eq!(quota.used(), 512);
        drop(leaky);
        assert_eq!(root.aggregate_bytes(), 0);
        assert_eq!(quota.used(), 0);
        Ok(())
    }

    #[test]
    fn test_snapshot_reflects_tree() -> Result<(), Box<dyn std::error::Error>> {
        let root = MemoryPool::root("root");
        let a = root.add_child("a", Some(4096))?;
        let _b = a.add_child("b", None)?;
        a.reserve(40)?;

        let snapshot = root.snapshot();
        assert_eq!(snapshot.name, "root");
        assert_eq!(snapshot.aggregate_bytes, 40);
        assert_eq!(snapshot.children.len(), 1);
        assert_eq!(snapshot.children[0].cap, Some(4096));
        assert_eq!(snapshot.children[0].local_bytes, 40);
        assert_eq!(snapshot.children[0].children[0].name, "b");

        let json = serde_json::to_string(&snapshot)?;
        let decoded: PoolSnapshot = serde_json::from_str(&json)?;
        assert_eq!(decoded, snapshot);
        a.release(40);
        Ok(())
    }

    #[test]
    fn test_preferred_size_exposed_on_pool() {
        assert_eq!(MemoryPool::preferred_size(3), 8);
        assert_eq!(MemoryPool::preferred_size(17), 24);
    }
}
