//! Large-object allocator.
//!
//! Large allocations are whole page ranges straight from the page supplier.
//! Their sizes live in an out-of-band open-addressing table keyed by the
//! (page-aligned) start address, so the caller-visible pointer carries no
//! header and stays page aligned.

use core::{
  mem::size_of,
  ptr::{self, null_mut},
};

use crate::{
  PAGE_SIZE, align_up,
  error::{HeapCorruption, corrupted},
  page::{PAGES, RawPageAllocator, ReclaimOptions},
  platform,
  sync::Mutex,
};

// =============================================================================
// Size table
// =============================================================================

#[derive(Clone, Copy)]
struct Slot {
  /// Start of the allocation; 0 marks an empty slot.
  page: usize,
  size: usize,
}

impl Slot {
  const EMPTY: Self = Self { page: 0, size: 0 };
}

/// Smallest table: one page of slots.
const MIN_CAPACITY: usize = PAGE_SIZE / size_of::<Slot>();

const _: () = assert!(MIN_CAPACITY.is_power_of_two());

/// Map from allocation start to its rounded size. Linear probing with
/// backward-shift deletion; storage comes directly from the OS so the table
/// never shows up in the page supplier's accounting.
struct SizeTable {
  slots: *mut Slot,
  capacity: usize,
  len: usize,
}

// Safety: the slot array is owned by the table.
unsafe impl Send for SizeTable {}

impl SizeTable {
  const fn new() -> Self {
    Self {
      slots: null_mut(),
      capacity: 0,
      len: 0,
    }
  }

  #[inline]
  fn home(&self, page: usize) -> usize {
    let h = (page / PAGE_SIZE).wrapping_mul(0x9E37_79B9_7F4A_7C15u64 as usize);
    h >> (usize::BITS - self.capacity.trailing_zeros())
  }

  #[inline]
  fn slot(&self, i: usize) -> Slot {
    unsafe { *self.slots.add(i) }
  }

  #[inline]
  fn slot_mut(&mut self, i: usize) -> &mut Slot {
    unsafe { &mut *self.slots.add(i) }
  }

  /// Index of the slot holding `page`.
  fn find(&self, page: usize) -> Option<usize> {
    if self.len == 0 {
      return None;
    }
    let mask = self.capacity - 1;
    let mut i = self.home(page);
    loop {
      match self.slot(i).page {
        0 => return None,
        p if p == page => return Some(i),
        _ => i = (i + 1) & mask,
      }
    }
  }

  fn get(&self, page: usize) -> Option<usize> {
    self.find(page).map(|i| self.slot(i).size)
  }

  /// Overwrite the size of an existing entry.
  fn set(&mut self, page: usize, size: usize) -> bool {
    match self.find(page) {
      Some(i) => {
        self.slot_mut(i).size = size;
        true
      }
      None => false,
    }
  }

  /// Add a new entry. Fails only when the table cannot grow.
  fn insert(&mut self, page: usize, size: usize) -> bool {
    debug_assert!(page != 0);
    if (self.len + 1) * 2 > self.capacity && !self.grow() {
      return false;
    }
    self.place(Slot { page, size });
    self.len += 1;
    true
  }

  fn place(&mut self, entry: Slot) {
    let mask = self.capacity - 1;
    let mut i = self.home(entry.page);
    while self.slot(i).page != 0 {
      i = (i + 1) & mask;
    }
    *self.slot_mut(i) = entry;
  }

  fn remove(&mut self, page: usize) -> Option<usize> {
    let mut hole = self.find(page)?;
    let size = self.slot(hole).size;
    let mask = self.capacity - 1;

    let mut j = (hole + 1) & mask;
    loop {
      let entry = self.slot(j);
      if entry.page == 0 {
        break;
      }
      // `entry` may fill the hole if the hole is on its probe path.
      let home = self.home(entry.page);
      if (j.wrapping_sub(home) & mask) >= (j.wrapping_sub(hole) & mask) {
        *self.slot_mut(hole) = entry;
        hole = j;
      }
      j = (j + 1) & mask;
    }
    *self.slot_mut(hole) = Slot::EMPTY;
    self.len -= 1;
    Some(size)
  }

  #[cold]
  fn grow(&mut self) -> bool {
    let capacity = if self.capacity == 0 {
      MIN_CAPACITY
    } else {
      self.capacity * 2
    };
    let slots = unsafe { platform::map(0, capacity * size_of::<Slot>()) } as *mut Slot;
    if slots.is_null() {
      return false;
    }

    let len = self.len;
    let old = core::mem::replace(
      self,
      Self {
        slots,
        capacity,
        len,
      },
    );
    for i in 0..old.capacity {
      let entry = old.slot(i);
      if entry.page != 0 {
        self.place(entry);
      }
    }
    true
  }
}

impl Drop for SizeTable {
  fn drop(&mut self) {
    if !self.slots.is_null() {
      unsafe { platform::unmap(self.slots as *mut u8, self.capacity * size_of::<Slot>()) };
    }
  }
}

// =============================================================================
// Allocator
// =============================================================================

/// `size` rounded up to whole pages, or `None` on overflow.
#[inline]
pub(crate) const fn page_ceil(size: usize) -> Option<usize> {
  match size.checked_add(PAGE_SIZE - 1) {
    Some(s) => Some(s & !(PAGE_SIZE - 1)),
    None => None,
  }
}

pub(crate) struct LargeAllocator {
  pages: &'static RawPageAllocator,
  table: Mutex<SizeTable>,
}

/// The process-wide large allocator.
pub(crate) static LARGE: LargeAllocator = LargeAllocator::new(&PAGES);

impl LargeAllocator {
  pub(crate) const fn new(pages: &'static RawPageAllocator) -> Self {
    Self {
      pages,
      table: Mutex::new(SizeTable::new()),
    }
  }

  /// Allocate `size` bytes (rounded up to pages) aligned to `align`, a power
  /// of two. The memory is zeroed. Null when out of memory.
  pub(crate) fn alloc_large(&self, size: usize, align: usize) -> *mut u8 {
    debug_assert!(size > 0 && align.is_power_of_two());
    let Some(len) = page_ceil(size) else {
      return null_mut();
    };

    let ptr = if align <= PAGE_SIZE {
      self.pages.allocate(len)
    } else {
      unsafe { self.alloc_over_aligned(len, align) }
    };
    if ptr.is_null() {
      return null_mut();
    }

    if !self.table.lock().insert(ptr as usize, len) {
      unsafe { self.pages.reclaim_page(ptr, len, ReclaimOptions::CLEAN) };
      return null_mut();
    }
    ptr
  }

  /// Take `len + align - PAGE_SIZE` bytes and give back the unaligned ends.
  unsafe fn alloc_over_aligned(&self, len: usize, align: usize) -> *mut u8 {
    let Some(total) = len.checked_add(align - PAGE_SIZE) else {
      return null_mut();
    };
    let raw = self.pages.allocate(total);
    if raw.is_null() {
      return null_mut();
    }

    let start = align_up(raw as usize, align);
    let head = start - raw as usize;
    let tail = total - head - len;
    unsafe {
      if head > 0 {
        self.pages.reclaim_page(
          raw,
          head,
          ReclaimOptions::CLEAN | ReclaimOptions::NO_MERGE_RIGHT,
        );
      }
      if tail > 0 {
        self.pages.reclaim_page(
          (start + len) as *mut u8,
          tail,
          ReclaimOptions::CLEAN | ReclaimOptions::NO_MERGE_LEFT,
        );
      }
    }
    start as *mut u8
  }

  /// Resize the allocation at `ptr`. Shrinks and in-place growth keep the
  /// pointer; otherwise the contents move to a fresh `align`-aligned range.
  /// Null (with `ptr` still valid) when out of memory.
  pub(crate) unsafe fn realloc_large(&self, ptr: *mut u8, new_size: usize, align: usize) -> *mut u8 {
    let Some(new_len) = page_ceil(new_size) else {
      return null_mut();
    };
    let old_len = self.large_allocated_size(ptr);

    if new_len == old_len {
      return ptr;
    }

    if new_len < old_len {
      self.table.lock().set(ptr as usize, new_len);
      unsafe {
        self.pages.reclaim_page(
          ptr.add(new_len),
          old_len - new_len,
          ReclaimOptions::NO_MERGE_LEFT,
        )
      };
      return ptr;
    }

    if unsafe { self.pages.extend_page_nomove(ptr, old_len, new_len) } {
      self.table.lock().set(ptr as usize, new_len);
      return ptr;
    }

    let new = self.alloc_large(new_len, align);
    if new.is_null() {
      return null_mut();
    }
    unsafe {
      ptr::copy_nonoverlapping(ptr, new, old_len);
      self.free_large(ptr, None);
    }
    new
  }

  /// Free the allocation at `ptr`. A caller-supplied `size` larger than the
  /// allocation means the heap is corrupt.
  pub(crate) unsafe fn free_large(&self, ptr: *mut u8, size: Option<usize>) {
    let len = {
      let mut table = self.table.lock();
      let Some(actual) = table.get(ptr as usize) else {
        corrupted(HeapCorruption::UnknownLargePointer { ptr: ptr as usize });
      };
      if let Some(given) = size
        && given > actual
      {
        corrupted(HeapCorruption::SizeMismatch {
          ptr: ptr as usize,
          given,
          actual,
        });
      }
      table.remove(ptr as usize);
      actual
    };
    unsafe { self.pages.reclaim_page(ptr, len, ReclaimOptions::NONE) };
  }

  /// Rounded size of the allocation at `ptr`.
  pub(crate) fn large_allocated_size(&self, ptr: *const u8) -> usize {
    match self.table.lock().get(ptr as usize) {
      Some(size) => size,
      None => corrupted(HeapCorruption::UnknownLargePointer { ptr: ptr as usize }),
    }
  }

  /// Give cached pages back to the OS, keeping at most `pad` bytes.
  pub(crate) fn large_trim(&self, pad: usize) -> usize {
    self.pages.trim(pad)
  }
}
