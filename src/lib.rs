//! A thread-caching `malloc`.
//!
//! Requests of at most a quarter page are served from per-thread free lists
//! of power-of-two blocks carved out of single pages; bigger requests get
//! whole page ranges. A pointer is classified by its page offset alone:
//! small blocks are never page aligned, large allocations always are.
//!
//! ```
//! use runalloc::Allocator;
//!
//! #[global_allocator]
//! static GLOBAL: Allocator = Allocator;
//!
//! fn main() {
//!   let v: Vec<u64> = (0..1000).collect();
//!   assert_eq!(v.iter().sum::<u64>(), 499_500);
//! }
//! ```
//!
//! With the `c_api` feature the crate also exports the C allocation
//! functions, for use as an `LD_PRELOAD` library.

#![allow(clippy::missing_safety_doc)]

use core::{
  alloc::{GlobalAlloc, Layout},
  ptr::NonNull,
};

use cfg_if::cfg_if;

mod dispatch;
mod error;
mod large;
mod page;
mod platform;
mod size_class;
mod small;
mod sync;
mod thread_cache;

pub use dispatch::{
  AllocOptions, allocate, allocated_size, page_stats, reallocate, reclaim, reclaim_sized,
  thread_cache_free_count, trim,
};
pub use error::{AllocError, HeapCorruption};
pub use page::PageStats;
pub use size_class::{CATEGORY_COUNT, MAX_CATEGORY, SMALL_LIMIT, category_to_size, size_to_category};
pub use small::CACHE_CEILING;

// =============================================================================
// Constants
// =============================================================================

cfg_if! {
  if #[cfg(all(target_vendor = "apple", target_arch = "aarch64"))] {
    /// Granularity of the page supplier; at least the OS page size.
    pub const PAGE_SIZE: usize = 16384;
  } else {
    /// Granularity of the page supplier; at least the OS page size.
    pub const PAGE_SIZE: usize = 4096;
  }
}

/// Transparent huge page size.
pub const HUGE_PAGE_SIZE: usize = 2 << 20;

/// Smallest block, and the alignment every allocation gets for free.
pub const MIN_SIZE: usize = 16;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(HUGE_PAGE_SIZE.is_power_of_two());
const _: () = assert!(MIN_SIZE.is_power_of_two());
const _: () = assert!(MIN_SIZE >= core::mem::align_of::<u128>());
const _: () = assert!(category_to_size(MAX_CATEGORY) * 4 == PAGE_SIZE);

// =============================================================================
// GlobalAlloc
// =============================================================================

/// The allocator, for `#[global_allocator]` or direct use.
pub struct Allocator;

impl Allocator {
  #[inline]
  fn options(layout: Layout) -> AllocOptions {
    AllocOptions::new().align(layout.align())
  }

  /// Allocate for `layout`, reporting failure instead of applying the
  /// out-of-memory policy. Zero-sized layouts get a one-byte block.
  pub fn try_allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
    let ptr = dispatch::try_allocate(layout.size().max(1), Self::options(layout))?;
    NonNull::new(ptr).ok_or(AllocError::OutOfMemory {
      size: layout.size(),
    })
  }
}

unsafe impl GlobalAlloc for Allocator {
  #[inline]
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    allocate(layout.size().max(1), Self::options(layout))
  }

  #[inline]
  unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
    unsafe { reclaim_sized(ptr, layout.size()) }
  }

  #[inline]
  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    allocate(layout.size().max(1), Self::options(layout).zeroed())
  }

  #[inline]
  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    unsafe { reallocate(ptr, new_size.max(1), Self::options(layout)) }
  }
}

// =============================================================================
// allocator-api2
// =============================================================================

#[cfg(feature = "allocator-api2")]
mod api2 {
  use core::{alloc::Layout, ptr::NonNull};

  use allocator_api2::alloc::{AllocError, Allocator as RawAllocator};

  use crate::{AllocOptions, Allocator, dispatch, reallocate, reclaim_sized};

  #[inline]
  fn slice(ptr: *mut u8, len: usize) -> Result<NonNull<[u8]>, AllocError> {
    NonNull::new(ptr)
      .map(|p| NonNull::slice_from_raw_parts(p, len))
      .ok_or(AllocError)
  }

  unsafe impl RawAllocator for Allocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
      match self.try_allocate(layout) {
        Ok(ptr) => Ok(NonNull::slice_from_raw_parts(ptr, layout.size())),
        Err(_) => Err(AllocError),
      }
    }

    fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
      let opts = AllocOptions::new().align(layout.align()).zeroed();
      let ptr = dispatch::try_allocate(layout.size().max(1), opts).map_err(|_| AllocError)?;
      slice(ptr, layout.size())
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
      unsafe { reclaim_sized(ptr.as_ptr(), layout.size()) }
    }

    unsafe fn grow(
      &self,
      ptr: NonNull<u8>,
      _old: Layout,
      new: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
      let opts = AllocOptions::new().align(new.align());
      slice(
        unsafe { reallocate(ptr.as_ptr(), new.size().max(1), opts) },
        new.size(),
      )
    }

    unsafe fn grow_zeroed(
      &self,
      ptr: NonNull<u8>,
      old: Layout,
      new: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
      let grown = unsafe { self.grow(ptr, old, new) }?;
      // Bytes between the old layout and the old block size may be stale.
      unsafe {
        grown
          .cast::<u8>()
          .as_ptr()
          .add(old.size())
          .write_bytes(0, new.size() - old.size())
      };
      Ok(grown)
    }

    unsafe fn shrink(
      &self,
      ptr: NonNull<u8>,
      _old: Layout,
      new: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
      let opts = AllocOptions::new().align(new.align());
      slice(
        unsafe { reallocate(ptr.as_ptr(), new.size().max(1), opts) },
        new.size(),
      )
    }
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  allocate(size.max(1), AllocOptions::new())
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  unsafe { reclaim(ptr) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  let Some(total) = nmemb.checked_mul(size) else {
    platform::set_errno(libc::ENOMEM);
    return core::ptr::null_mut();
  };
  allocate(total.max(1), AllocOptions::new().zeroed())
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  if ptr.is_null() {
    return unsafe { malloc(size) };
  }
  unsafe { reallocate(ptr, size, AllocOptions::new()) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(
  memptr: *mut *mut u8,
  alignment: usize,
  size: usize,
) -> libc::c_int {
  if !alignment.is_power_of_two() || alignment < core::mem::size_of::<*mut u8>() {
    return libc::EINVAL;
  }

  let ptr = allocate(size.max(1), AllocOptions::new().align(alignment));
  if ptr.is_null() {
    return libc::ENOMEM;
  }

  unsafe { *memptr = ptr };
  0
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
  allocate(size.max(1), AllocOptions::new().align(alignment))
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut u8 {
  unsafe { aligned_alloc(alignment, size) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  unsafe { allocated_size(ptr) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_trim(pad: usize) -> libc::c_int {
  trim(pad) as libc::c_int
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}
