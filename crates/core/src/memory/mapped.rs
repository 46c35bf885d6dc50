//! Page-Mapped Allocator
//!
//! [`MappedAllocator`] serves pools from a page mapping primitive that frees by
//! address and size. The primitive has no alignment or resize API, so the
//! aligned operations fail as unsupported and `realloc` is implemented as
//! allocate, copy, free.

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::MemoryError;
use crate::memory::allocator::{AllocResult, AllocatorKind, MemoryAllocator};

/// Page mapping primitive consumed by [`MappedAllocator`]
pub trait MappedMemory: Send + Sync + fmt::Debug {
    /// Map `size` bytes; `None` when the mapping fails
    fn allocate_bytes(&self, size: usize) -> Option<NonNull<u8>>;

    /// Unmap a region returned by [`MappedMemory::allocate_bytes`]
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate_bytes` on this primitive with the same
    /// `size`, and must not be used afterwards.
    unsafe fn free_bytes(&self, ptr: NonNull<u8>, size: usize);
}

/// Anonymous private `mmap` regions
#[derive(Debug, Default)]
pub struct SystemPageMapper {
    mapped_bytes: AtomicU64,
    mappings: AtomicU64,
}

impl SystemPageMapper {
    /// Create page mapper
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mapped_bytes: AtomicU64::new(0),
            mappings: AtomicU64::new(0),
        }
    }

    /// Bytes currently mapped through this mapper
    #[must_use]
    pub fn mapped_bytes(&self) -> u64 {
        self.mapped_bytes.load(Ordering::Relaxed)
    }

    /// Number of live mappings
    #[must_use]
    pub fn mappings(&self) -> u64 {
        self.mappings.load(Ordering::Relaxed)
    }
}

impl MappedMemory for SystemPageMapper {
    fn allocate_bytes(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        // SAFETY: anonymous private mapping with no fixed address; failure is MAP_FAILED.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            tracing::debug!("mmap of {} bytes failed", size);
            return None;
        }
        self.mapped_bytes
            .fetch_add(u64::try_from(size).unwrap_or(u64::MAX), Ordering::Relaxed);
        self.mappings.fetch_add(1, Ordering::Relaxed);
        NonNull::new(addr.cast::<u8>())
    }

    unsafe fn free_bytes(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: the caller guarantees `ptr`/`size` describe a mapping from `allocate_bytes`.
        let rc = unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) };
        if rc != 0 {
            tracing::warn!(
                "munmap of {} bytes at {:p} failed: {}",
                size,
                ptr.as_ptr(),
                std::io::Error::last_os_error()
            );
            return;
        }
        self.mapped_bytes
            .fetch_sub(u64::try_from(size).unwrap_or(u64::MAX), Ordering::Relaxed);
        self.mappings.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Allocator backed by a [`MappedMemory`] primitive
#[derive(Debug, Clone)]
pub struct MappedAllocator {
    mapped_memory: Arc<dyn MappedMemory>,
}

impl MappedAllocator {
    /// Create allocator on top of a mapping primitive
    #[must_use]
    pub fn new(mapped_memory: Arc<dyn MappedMemory>) -> Self {
        Self { mapped_memory }
    }

    /// Create allocator on top of [`SystemPageMapper`]
    #[must_use]
    pub fn with_system_mapper() -> Self {
        Self::new(Arc::new(SystemPageMapper::new()))
    }

    /// Underlying mapping primitive
    #[must_use]
    pub fn mapped_memory(&self) -> &Arc<dyn MappedMemory> {
        &self.mapped_memory
    }

    fn unsupported(operation: &'static str) -> MemoryError {
        let allocator = AllocatorKind::Mapped.allocator_name();
        tracing::warn!("{} requested on {}", operation, allocator);
        MemoryError::unsupported(operation, allocator)
    }
}

impl MemoryAllocator for MappedAllocator {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Mapped
    }

    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.mapped_memory.allocate_bytes(size)
    }

    fn alloc_zero_filled(&self, count: usize, size_each: usize) -> Option<NonNull<u8>> {
        let total = count.checked_mul(size_each)?;
        let block = self.alloc(total)?;
        // SAFETY: `block` was just mapped with `total` writable bytes.
        unsafe { ptr::write_bytes(block.as_ptr(), 0, total) };
        Some(block)
    }

    fn alloc_aligned(&self, _alignment: u16, _size: usize) -> AllocResult {
        // TODO: route through the mapper once MappedMemory grows an aligned mapping call
        Err(Self::unsupported("alloc_aligned"))
    }

    unsafe fn realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        let new_block = self.alloc(new_size);
        let (Some(old), Some(block)) = (ptr, new_block) else {
            return new_block;
        };
        // SAFETY: `old` is live for `size` bytes, `block` is a distinct fresh mapping of `new_size`.
        unsafe {
            ptr::copy_nonoverlapping(old.as_ptr(), block.as_ptr(), size.min(new_size));
            self.free(Some(old), size);
        }
        Some(block)
    }

    unsafe fn realloc_aligned(
        &self,
        _ptr: Option<NonNull<u8>>,
        _alignment: u16,
        _size: usize,
        _new_size: usize,
    ) -> AllocResult {
        Err(Self::unsupported("realloc_aligned"))
    }

    unsafe fn free(&self, ptr: Option<NonNull<u8>>, size: usize) {
        if let Some(p) = ptr {
            // SAFETY: forwarded from this method's own contract.
            unsafe { self.mapped_memory.free_bytes(p, size) };
        }
    }
}
