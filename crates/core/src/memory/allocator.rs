//! Allocator Backends - Raw Memory for Pools
//!
//! Both backends expose the same operation set through [`MemoryAllocator`]:
//! - [`HeapAllocator`] wraps the C heap and supports every operation
//! - [`MappedAllocator`](super::mapped::MappedAllocator) sits on a page
//!   mapping primitive and rejects the alignment operations
//!
//! Backend exhaustion is reported as `None`. A capability the backend lacks is
//! reported as [`MemoryError::Unsupported`], which is a configuration error and
//! not something to retry.

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, MemoryResult};
use crate::memory::mapped::MappedAllocator;

/// Result of an allocation that may be unsupported by the backend
pub type AllocResult = MemoryResult<Option<NonNull<u8>>>;

/// Allocator backend variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocatorKind {
    /// C heap (`malloc` family)
    Heap,
    /// Page mapping primitive (`mmap` family)
    Mapped,
}

impl AllocatorKind {
    /// Select the variant from the `use_mmap_allocator` switch
    #[must_use]
    pub const fn from_use_mmap(use_mmap_allocator: bool) -> Self {
        if use_mmap_allocator {
            Self::Mapped
        } else {
            Self::Heap
        }
    }

    /// Build the default allocator for this variant
    #[must_use]
    pub fn create_default(self) -> Arc<dyn MemoryAllocator> {
        match self {
            Self::Heap => Arc::new(HeapAllocator::new()),
            Self::Mapped => Arc::new(MappedAllocator::with_system_mapper()),
        }
    }

    /// Allocator type name used in diagnostics
    #[must_use]
    pub const fn allocator_name(self) -> &'static str {
        match self {
            Self::Heap => "HeapAllocator",
            Self::Mapped => "MappedAllocator",
        }
    }
}

impl fmt::Display for AllocatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Heap => f.write_str("heap"),
            Self::Mapped => f.write_str("mapped"),
        }
    }
}

/// Raw allocation interface shared by all backends
///
/// Memory returned by the allocating calls is owned by the caller, who must
/// hand it back through [`MemoryAllocator::free`] (or one of the realloc
/// calls) on the same allocator together with the size it was allocated with.
pub trait MemoryAllocator: Send + Sync + fmt::Debug {
    /// Backend variant
    fn kind(&self) -> AllocatorKind;

    /// Allocate `size` bytes with the backend's natural alignment
    fn alloc(&self, size: usize) -> Option<NonNull<u8>>;

    /// Allocate `count * size_each` zeroed bytes
    fn alloc_zero_filled(&self, count: usize, size_each: usize) -> Option<NonNull<u8>>;

    /// Allocate `size` bytes aligned to `alignment`
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::Unsupported`] if the backend cannot align, or
    /// [`MemoryError::InvalidAlignment`] if `alignment` is not a power of two.
    fn alloc_aligned(&self, alignment: u16, size: usize) -> AllocResult;

    /// Resize an allocation, moving it if needed
    ///
    /// `realloc(None, _, new_size)` behaves like `alloc(new_size)`. On `None`
    /// the old block is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr`, when present, must come from this allocator and still be live,
    /// and `size` must be its allocation size.
    unsafe fn realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>>;

    /// Resize an allocation into a block aligned to `alignment`
    ///
    /// # Errors
    ///
    /// Same as [`MemoryAllocator::alloc_aligned`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from this allocator and still be live whenever
    /// `size > 0`, and `size` must be its allocation size.
    unsafe fn realloc_aligned(
        &self,
        ptr: Option<NonNull<u8>>,
        alignment: u16,
        size: usize,
        new_size: usize,
    ) -> AllocResult;

    /// Release an allocation; `None` is a no-op
    ///
    /// # Safety
    ///
    /// `ptr`, when present, must come from this allocator, must not be used
    /// afterwards, and `size` must be its allocation size.
    unsafe fn free(&self, ptr: Option<NonNull<u8>>, size: usize);
}

/// Check that `alignment` is a non-zero power of two
pub(crate) fn check_alignment(alignment: u16) -> MemoryResult<()> {
    if alignment.is_power_of_two() {
        Ok(())
    } else {
        Err(MemoryError::InvalidAlignment { alignment })
    }
}

/// C heap backed allocator
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl HeapAllocator {
    /// Create heap allocator
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn aligned_alloc(alignment: u16, size: usize) -> AllocResult {
        check_alignment(alignment)?;
        // posix_memalign wants at least pointer alignment; a larger power of
        // two is still a multiple of the requested one.
        let alignment = usize::from(alignment).max(std::mem::size_of::<*mut libc::c_void>());
        let mut out: *mut libc::c_void = ptr::null_mut();
        // SAFETY: `out` is a valid out-pointer and `alignment` is a power of two >= pointer size.
        let rc = unsafe { libc::posix_memalign(&mut out, alignment, size) };
        if rc != 0 {
            return Ok(None);
        }
        Ok(NonNull::new(out.cast::<u8>()))
    }
}

impl MemoryAllocator for HeapAllocator {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Heap
    }

    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: malloc has no preconditions; a null result maps to None.
        NonNull::new(unsafe { libc::malloc(size) }.cast::<u8>())
    }

    fn alloc_zero_filled(&self, count: usize, size_each: usize) -> Option<NonNull<u8>> {
        // SAFETY: calloc checks the product for overflow and returns null on failure.
        NonNull::new(unsafe { libc::calloc(count, size_each) }.cast::<u8>())
    }

    fn alloc_aligned(&self, alignment: u16, size: usize) -> AllocResult {
        Self::aligned_alloc(alignment, size)
    }

    unsafe fn realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        _size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        let old = ptr.map_or(ptr::null_mut(), |p| p.as_ptr().cast::<libc::c_void>());
        // SAFETY: the caller guarantees `old` is null or a live block from this allocator.
        NonNull::new(unsafe { libc::realloc(old, new_size) }.cast::<u8>())
    }

    unsafe fn realloc_aligned(
        &self,
        ptr: Option<NonNull<u8>>,
        alignment: u16,
        size: usize,
        new_size: usize,
    ) -> AllocResult {
        if new_size == 0 {
            return Ok(None);
        }
        let Some(block) = Self::aligned_alloc(alignment, new_size)? else {
            return Ok(None);
        };
        debug_assert!(
            ptr.is_some() || size == 0,
            "realloc_aligned called without a source block for {size} bytes"
        );
        if let Some(old) = ptr {
            // SAFETY: `old` is live for `size` bytes, `block` is fresh for `new_size`, and they cannot overlap.
            unsafe {
                ptr::copy_nonoverlapping(old.as_ptr(), block.as_ptr(), size.min(new_size));
                libc::free(old.as_ptr().cast::<libc::c_void>());
            }
        }
        Ok(Some(block))
    }

    unsafe fn free(&self, ptr: Option<NonNull<u8>>, _size: usize) {
        if let Some(p) = ptr {
            // SAFETY: the caller guarantees `p` came from this allocator and is not reused.
            unsafe { libc::free(p.as_ptr().cast::<libc::c_void>()) };
        }
    }
}
