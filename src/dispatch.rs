//! Front-end dispatcher.
//!
//! Every request is routed by size: at most [`SMALL_LIMIT`] bytes goes to
//! the slab allocator, anything bigger to the large allocator. Pointers are
//! classified by their offset in the page alone: small blocks are never page
//! aligned, large allocations always are.

use core::ptr::{self, NonNull, null_mut};

use crate::{
  PAGE_SIZE, align_up,
  error::{AllocError, HeapCorruption, corrupted},
  large::LARGE,
  page::{PAGES, PageStats},
  platform,
  size_class::{CATEGORY_COUNT, SMALL_LIMIT, category_to_size, size_to_category},
  small, thread_cache,
};

/// Per-request options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocOptions {
  /// Required alignment, a power of two. 0 means no requirement.
  pub align: usize,
  /// Hand back zero-filled memory.
  pub zero: bool,
}

impl AllocOptions {
  pub const fn new() -> Self {
    Self {
      align: 0,
      zero: false,
    }
  }

  pub const fn align(self, align: usize) -> Self {
    Self { align, ..self }
  }

  pub const fn zeroed(self) -> Self {
    Self { zero: true, ..self }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route {
  Small(usize),
  Large { size: usize, align: usize },
}

/// Where a request of `size` bytes goes. `None` for an empty request.
fn route(size: usize, opts: AllocOptions) -> Result<Option<Route>, AllocError> {
  let align = match opts.align {
    0 => 1,
    a if a.is_power_of_two() => a,
    a => return Err(AllocError::InvalidAlignment { align: a }),
  };
  if size == 0 {
    return Ok(None);
  }
  // A block of a power-of-two size class is aligned to that size, so
  // rounding up is enough for anything up to a page.
  let size = match size.checked_add(align - 1) {
    Some(_) if align_up(size, align) <= isize::MAX as usize => align_up(size, align),
    _ => return Err(AllocError::OutOfMemory { size }),
  };

  if size > SMALL_LIMIT {
    Ok(Some(Route::Large { size, align }))
  } else {
    Ok(Some(Route::Small(size_to_category(size))))
  }
}

#[inline]
fn is_small(ptr: *const u8) -> bool {
  ptr as usize % PAGE_SIZE != 0
}

/// Apply the out-of-memory policy to a failed request.
#[cold]
fn fail(err: AllocError) -> *mut u8 {
  #[cfg(feature = "never-fail")]
  if let AllocError::OutOfMemory { size } = err {
    crate::error::out_of_memory(size);
  }

  log::debug!("runalloc: {err}");
  platform::set_errno(match err {
    AllocError::OutOfMemory { .. } => libc::ENOMEM,
    AllocError::InvalidAlignment { .. } => libc::EINVAL,
  });
  null_mut()
}

/// Allocate without applying the failure policy. `Ok(null)` for `size == 0`.
pub(crate) fn try_allocate(size: usize, opts: AllocOptions) -> Result<*mut u8, AllocError> {
  let ptr = match route(size, opts)? {
    None => return Ok(null_mut()),
    Some(Route::Small(cat)) => {
      let ptr = small::alloc_small_category(cat);
      if !ptr.is_null() && opts.zero {
        unsafe { ptr::write_bytes(ptr, 0, category_to_size(cat)) };
      }
      ptr
    }
    // Page-supplier memory is always zero-filled.
    Some(Route::Large { size, align }) => LARGE.alloc_large(size, align),
  };
  NonNull::new(ptr)
    .map(NonNull::as_ptr)
    .ok_or(AllocError::OutOfMemory { size })
}

/// Allocate `size` bytes. Null for `size == 0`, and on failure (with
/// `errno` set) unless the `never-fail` feature turns failure into an abort.
pub fn allocate(size: usize, opts: AllocOptions) -> *mut u8 {
  match try_allocate(size, opts) {
    Ok(ptr) => ptr,
    Err(err) => fail(err),
  }
}

/// Resize the allocation at `ptr` to `new_size` bytes.
///
/// A null `ptr` allocates; a zero `new_size` frees and returns null. With
/// `opts.zero`, bytes past the old allocated size read as zero. On failure
/// null is returned and `ptr` stays valid.
///
/// # Safety
///
/// `ptr` must be null or a live pointer returned by this allocator.
pub unsafe fn reallocate(ptr: *mut u8, new_size: usize, opts: AllocOptions) -> *mut u8 {
  if ptr.is_null() {
    return allocate(new_size, opts);
  }
  if new_size == 0 {
    unsafe { reclaim(ptr) };
    return null_mut();
  }

  let target = match route(new_size, opts) {
    Ok(Some(target)) => target,
    Ok(None) => return null_mut(),
    Err(err) => return fail(err),
  };

  let old_size = if is_small(ptr) {
    let cat = unsafe { small::small_allocated_category(ptr) };
    if target == Route::Small(cat) {
      return ptr;
    }
    category_to_size(cat)
  } else {
    if let Route::Large { size, align } = target
      && ptr as usize % align == 0
    {
      let new = unsafe { LARGE.realloc_large(ptr, size, align) };
      return if new.is_null() {
        fail(AllocError::OutOfMemory { size })
      } else {
        new
      };
    }
    LARGE.large_allocated_size(ptr)
  };

  let new = allocate(new_size, opts);
  if new.is_null() {
    return null_mut();
  }
  unsafe {
    ptr::copy_nonoverlapping(ptr, new, old_size.min(new_size));
    reclaim(ptr);
  }
  new
}

/// Free `ptr`. Null is ignored.
///
/// # Safety
///
/// `ptr` must be null or a live pointer returned by this allocator.
pub unsafe fn reclaim(ptr: *mut u8) {
  if ptr.is_null() {
    return;
  }
  if is_small(ptr) {
    unsafe { small::free_small(ptr) };
  } else {
    unsafe { LARGE.free_large(ptr, None) };
  }
}

/// Free `ptr`, asserting that it holds at least `size` bytes. A larger
/// `size` means the heap is corrupt and aborts the process.
///
/// # Safety
///
/// `ptr` must be null or a live pointer returned by this allocator.
pub unsafe fn reclaim_sized(ptr: *mut u8, size: usize) {
  if ptr.is_null() {
    return;
  }
  if is_small(ptr) {
    let actual = unsafe { small::small_allocated_size(ptr) };
    if size > actual {
      corrupted(HeapCorruption::SizeMismatch {
        ptr: ptr as usize,
        given: size,
        actual,
      });
    }
    unsafe { small::free_small(ptr) };
  } else {
    unsafe { LARGE.free_large(ptr, Some(size)) };
  }
}

/// Usable size of the allocation at `ptr`; 0 for null.
///
/// # Safety
///
/// `ptr` must be null or a live pointer returned by this allocator.
pub unsafe fn allocated_size(ptr: *const u8) -> usize {
  if ptr.is_null() {
    0
  } else if is_small(ptr) {
    unsafe { small::small_allocated_size(ptr) }
  } else {
    LARGE.large_allocated_size(ptr)
  }
}

/// Flush the calling thread's cached blocks and return cached pages to the
/// OS, keeping at most `pad` bytes. True if any memory went back to the OS.
pub fn trim(pad: usize) -> bool {
  small::small_trim();
  let released = LARGE.large_trim(pad);
  log::debug!("runalloc: trim released {released} bytes");
  released > 0
}

/// Counters of the process-wide page supplier.
pub fn page_stats() -> PageStats {
  PAGES.stats()
}

/// Free blocks of category `cat` cached by the calling thread. `None` if the
/// thread has no cache of its own or `cat` is out of range.
pub fn thread_cache_free_count(cat: usize) -> Option<usize> {
  if cat >= CATEGORY_COUNT {
    return None;
  }
  thread_cache::cached_free_count(cat)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn routes_by_size_and_alignment() {
    let plain = AllocOptions::new();
    assert_eq!(route(0, plain), Ok(None));
    assert_eq!(route(40, plain), Ok(Some(Route::Small(2))));
    assert_eq!(route(SMALL_LIMIT, plain), Ok(Some(Route::Small(size_to_category(SMALL_LIMIT)))));
    assert_eq!(
      route(SMALL_LIMIT + 1, plain),
      Ok(Some(Route::Large {
        size: SMALL_LIMIT + 1,
        align: 1
      }))
    );
    assert_eq!(route(24, plain.align(32)), Ok(Some(Route::Small(1))));
    assert_eq!(
      route(10, plain.align(4 * PAGE_SIZE)),
      Ok(Some(Route::Large {
        size: 4 * PAGE_SIZE,
        align: 4 * PAGE_SIZE
      }))
    );
    assert_eq!(
      route(10, plain.align(24)),
      Err(AllocError::InvalidAlignment { align: 24 })
    );
    assert_eq!(
      route(usize::MAX, plain.align(64)),
      Err(AllocError::OutOfMemory { size: usize::MAX })
    );
    assert_eq!(
      route(isize::MAX as usize + 1, plain),
      Err(AllocError::OutOfMemory {
        size: isize::MAX as usize + 1
      })
    );
  }

  #[test]
  fn small_and_large_classify_by_page_offset() {
    let s = allocate(40, AllocOptions::new());
    let l = allocate(SMALL_LIMIT + 1, AllocOptions::new());
    assert!(is_small(s));
    assert!(!is_small(l));
    unsafe {
      assert_eq!(allocated_size(s), 64);
      assert_eq!(allocated_size(l), PAGE_SIZE);
      assert_eq!(allocated_size(null_mut()), 0);
      reclaim(s);
      reclaim_sized(l, SMALL_LIMIT + 1);
    }
  }

  #[test]
  fn zero_option_clears_reused_blocks() {
    let p = allocate(100, AllocOptions::new());
    unsafe { p.write_bytes(0xFF, 128) };
    unsafe { reclaim(p) };

    let q = allocate(100, AllocOptions::new().zeroed());
    let bytes = unsafe { core::slice::from_raw_parts(q, 128) };
    assert!(bytes.iter().all(|&b| b == 0));
    unsafe { reclaim(q) };
  }

  #[test]
  fn realloc_within_category_is_a_no_op() {
    let p = allocate(33, AllocOptions::new());
    let q = unsafe { reallocate(p, 60, AllocOptions::new()) };
    assert_eq!(p, q);
    unsafe { reclaim(q) };
  }

  #[test]
  fn realloc_edges() {
    let p = unsafe { reallocate(null_mut(), 16, AllocOptions::new()) };
    assert!(!p.is_null());
    assert!(unsafe { reallocate(p, 0, AllocOptions::new()) }.is_null());
  }

  #[test]
  fn realloc_moves_across_classes() {
    let p = allocate(48, AllocOptions::new());
    unsafe { p.write_bytes(0x3C, 48) };

    let q = unsafe { reallocate(p, 3 * PAGE_SIZE, AllocOptions::new().zeroed()) };
    assert!(!is_small(q));
    let bytes = unsafe { core::slice::from_raw_parts(q, 3 * PAGE_SIZE) };
    assert!(bytes[..48].iter().all(|&b| b == 0x3C));
    assert!(bytes[64..].iter().all(|&b| b == 0));

    let r = unsafe { reallocate(q, 20, AllocOptions::new()) };
    assert!(is_small(r));
    assert!(unsafe { core::slice::from_raw_parts(r, 20) }.iter().all(|&b| b == 0x3C));
    unsafe { reclaim(r) };
  }

  #[test]
  fn realloc_honours_new_alignment() {
    let align = 8 * PAGE_SIZE;
    let p = allocate(2 * PAGE_SIZE, AllocOptions::new());
    let q = unsafe { reallocate(p, 2 * PAGE_SIZE, AllocOptions::new().align(align)) };
    assert_eq!(q as usize % align, 0);
    unsafe { reclaim(q) };
  }

  #[test]
  fn bad_alignment_sets_einval() {
    let p = allocate(8, AllocOptions::new().align(3));
    assert!(p.is_null());
    assert_eq!(
      std::io::Error::last_os_error().raw_os_error(),
      Some(libc::EINVAL)
    );
  }

  #[cfg(not(feature = "never-fail"))]
  #[test]
  fn exhaustion_sets_enomem() {
    let p = allocate(usize::MAX - PAGE_SIZE, AllocOptions::new());
    assert!(p.is_null());
    assert_eq!(
      std::io::Error::last_os_error().raw_os_error(),
      Some(libc::ENOMEM)
    );
  }

  #[test]
  fn out_of_range_category_has_no_count() {
    assert_eq!(thread_cache_free_count(CATEGORY_COUNT), None);
  }
}
