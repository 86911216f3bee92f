//! Small-object (slab) allocator.
//!
//! A page devoted to one category starts with a [`Run`] header occupying the
//! first block slot; the remaining slots are handed out as blocks. Free
//! blocks are kept in per-thread [`ThreadCache`] lists, never in the page
//! itself, so the only shared state is the run's live-block counter.
//!
//! ```text
//! page:  | Run | block 1 | block 2 | ... | block n |
//!          ^ offset 0, so no block is ever page aligned
//! ```

use core::{
  mem::{self, size_of},
  ptr::{self, null_mut},
};

use crate::{
  MIN_SIZE, PAGE_SIZE,
  error::{HeapCorruption, corrupted},
  page::{PAGES, RawPageAllocator, ReclaimOptions},
  size_class::{CATEGORY_COUNT, MAX_CATEGORY, blocks_per_page, category_to_size},
  sync::LiveCount,
  thread_cache,
};

/// Free blocks a cache list may hold before it is flushed back to its runs.
pub const CACHE_CEILING: usize = PAGE_SIZE / MIN_SIZE;

/// Per-page metadata, at offset 0 of every small page.
#[repr(C)]
pub(crate) struct Run {
  cat: u32,
  /// Blocks not yet handed back to this run (cached blocks count as live).
  live: LiveCount,
}

/// A free-list node: `count` contiguous free blocks starting here.
#[repr(C)]
pub(crate) struct Block {
  next: *mut Block,
  count: u32,
}

const _: () = assert!(size_of::<Run>() <= MIN_SIZE);
const _: () = assert!(size_of::<Block>() <= MIN_SIZE);
const _: () = assert!(blocks_per_page(0) - 1 <= CACHE_CEILING);

/// What lives at an address inside a small page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PageSlot {
  Run(*mut Run),
  Block(*mut Block),
}

/// Resolve `addr` to the run header or a block, purely from its offset
/// within the page.
#[inline]
pub(crate) fn page_slot(addr: usize) -> PageSlot {
  if addr % PAGE_SIZE == 0 {
    PageSlot::Run(addr as *mut Run)
  } else {
    PageSlot::Block(addr as *mut Block)
  }
}

/// The run governing the page `ptr` points into.
#[inline]
pub(crate) fn run_of(ptr: *const u8) -> *mut Run {
  (ptr as usize & !(PAGE_SIZE - 1)) as *mut Run
}

#[derive(Clone, Copy)]
struct FreeList {
  head: *mut Block,
  count: u32,
}

impl FreeList {
  const EMPTY: Self = Self {
    head: null_mut(),
    count: 0,
  };
}

/// Free blocks of every category, owned by one thread (or by the fallback
/// lock).
pub(crate) struct ThreadCache {
  lists: [FreeList; CATEGORY_COUNT],
}

// Safety: the blocks a cache points at are owned by the cache, not shared.
unsafe impl Send for ThreadCache {}

impl ThreadCache {
  pub(crate) const fn new() -> Self {
    Self {
      lists: [FreeList::EMPTY; CATEGORY_COUNT],
    }
  }

  #[inline]
  pub(crate) fn free_count(&self, cat: usize) -> usize {
    self.lists[cat].count as usize
  }

  /// Take one block off the front of the `cat` list.
  #[inline]
  unsafe fn pop(&mut self, cat: usize) -> *mut u8 {
    let list = &mut self.lists[cat];
    let node = list.head;
    if node.is_null() {
      return null_mut();
    }

    unsafe {
      let Block { next, count } = ptr::read(node);
      if count > 1 {
        let rest = (node as *mut u8).add(category_to_size(cat)) as *mut Block;
        ptr::write(rest, Block { next, count: count - 1 });
        list.head = rest;
      } else {
        list.head = next;
      }
    }
    list.count -= 1;
    node as *mut u8
  }

  /// Put `count` contiguous blocks starting at `first` on the `cat` list.
  #[inline]
  unsafe fn push(&mut self, cat: usize, first: *mut u8, count: u32) {
    let list = &mut self.lists[cat];
    unsafe {
      ptr::write(
        first as *mut Block,
        Block {
          next: list.head,
          count,
        },
      )
    };
    list.head = first as *mut Block;
    list.count += count;
  }

  /// Hand every cached block of `cat` back to its run.
  pub(crate) unsafe fn flush(&mut self, cat: usize, pages: &RawPageAllocator) {
    let list = mem::replace(&mut self.lists[cat], FreeList::EMPTY);
    let mut node = list.head;
    while !node.is_null() {
      // Read the node before its page can go away.
      let Block { next, count } = unsafe { ptr::read(node) };
      unsafe { release_blocks(node as *mut u8, count, pages) };
      node = next;
    }
  }

  pub(crate) unsafe fn flush_all(&mut self, pages: &RawPageAllocator) {
    for cat in 0..CATEGORY_COUNT {
      unsafe { self.flush(cat, pages) };
    }
  }
}

/// Return `count` blocks to the run owning `ptr`; the page goes back to the
/// supplier when the run's last block comes home.
unsafe fn release_blocks(ptr: *mut u8, count: u32, pages: &RawPageAllocator) {
  let run = run_of(ptr);
  match unsafe { (*run).live.release(count) } {
    None => corrupted(HeapCorruption::CounterUnderflow { run: run as usize }),
    Some(0) => unsafe { pages.reclaim_page(run as *mut u8, PAGE_SIZE, ReclaimOptions::NONE) },
    Some(_) => {}
  }
}

/// Category of a small block, validating the run header on the way.
#[inline]
pub(crate) unsafe fn small_allocated_category(ptr: *const u8) -> usize {
  let run = run_of(ptr);
  let cat = unsafe { (*run).cat };
  if cat as usize > MAX_CATEGORY {
    corrupted(HeapCorruption::BadCategory {
      run: run as usize,
      cat,
    });
  }
  let size = category_to_size(cat as usize);
  let offset = ptr as usize - run as usize;
  if matches!(page_slot(ptr as usize), PageSlot::Run(_)) || offset % size != 0 {
    corrupted(HeapCorruption::MisalignedBlock {
      ptr: ptr as usize,
      size,
    });
  }
  cat as usize
}

#[inline]
pub(crate) unsafe fn small_allocated_size(ptr: *const u8) -> usize {
  category_to_size(unsafe { small_allocated_category(ptr) })
}

/// Allocate one block of `cat` using `cache`, carving a fresh page from
/// `pages` when the list is empty. Null when no page is available.
pub(crate) unsafe fn alloc_from(cache: &mut ThreadCache, pages: &RawPageAllocator, cat: usize) -> *mut u8 {
  debug_assert!(cat <= MAX_CATEGORY);

  let block = unsafe { cache.pop(cat) };
  if !block.is_null() {
    return block;
  }

  let page = pages.allocate(PAGE_SIZE);
  if page.is_null() {
    return null_mut();
  }

  let size = category_to_size(cat);
  let blocks = blocks_per_page(cat);
  let run = page as *mut Run;
  unsafe {
    ptr::addr_of_mut!((*run).cat).write(cat as u32);
    (*run).live.set(blocks as u32);

    // Slot 0 is the header: the first block goes to the caller, the rest
    // become one free-list node.
    let first = page.add(size);
    if blocks > 1 {
      cache.push(cat, first.add(size), (blocks - 1) as u32);
    }
    first
  }
}

/// Put a small block into `cache`, flushing the category's list first if it
/// is at the ceiling.
pub(crate) unsafe fn free_into(cache: &mut ThreadCache, pages: &RawPageAllocator, ptr: *mut u8) {
  let cat = unsafe { small_allocated_category(ptr) };
  if cache.free_count(cat) >= CACHE_CEILING {
    unsafe { cache.flush(cat, pages) };
  }
  unsafe { cache.push(cat, ptr, 1) };
}

/// Allocate a block of category `cat` for the calling thread.
pub(crate) fn alloc_small_category(cat: usize) -> *mut u8 {
  thread_cache::with_cache(|cache| unsafe { alloc_from(cache, &PAGES, cat) })
}

/// Free a block previously returned by [`alloc_small_category`].
pub(crate) unsafe fn free_small(ptr: *mut u8) {
  thread_cache::with_cache(|cache| unsafe { free_into(cache, &PAGES, ptr) })
}

/// Flush the calling thread's cache and the fallback cache.
pub(crate) fn small_trim() {
  thread_cache::flush_current(&PAGES);
  thread_cache::flush_fallback(&PAGES);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::page::PageConfig;

  fn supplier() -> RawPageAllocator {
    RawPageAllocator::new(PageConfig {
      use_brk: false,
      huge_pages: false,
    })
  }

  #[test]
  fn slots_resolve_by_offset() {
    let base = 16 * PAGE_SIZE;
    assert_eq!(page_slot(base), PageSlot::Run(base as *mut Run));
    assert_eq!(page_slot(base + 64), PageSlot::Block((base + 64) as *mut Block));
    assert_eq!(run_of((base + PAGE_SIZE - 1) as *const u8), base as *mut Run);
  }

  #[test]
  fn fresh_page_is_one_node() {
    let pages = supplier();
    let mut cache = ThreadCache::new();
    let cat = 2;
    let size = category_to_size(cat);

    let first = unsafe { alloc_from(&mut cache, &pages, cat) };
    let page = run_of(first) as usize;
    assert_eq!(first as usize, page + size);
    assert_eq!(cache.free_count(cat), blocks_per_page(cat) - 1);
    // The whole remainder is a single node.
    let head = cache.lists[cat].head;
    assert_eq!(head as usize, page + 2 * size);
    assert_eq!(unsafe { (*head).count } as usize, blocks_per_page(cat) - 1);

    let second = unsafe { alloc_from(&mut cache, &pages, cat) };
    assert_eq!(second as usize, page + 2 * size);
    assert_eq!(cache.lists[cat].head as usize, page + 3 * size);
    assert_eq!(cache.free_count(cat), blocks_per_page(cat) - 2);

    unsafe {
      free_into(&mut cache, &pages, first);
      free_into(&mut cache, &pages, second);
      cache.flush_all(&pages);
    }
    assert_eq!(pages.stats().live_bytes, 0);
    pages.trim(0);
  }

  #[test]
  fn blocks_are_aligned_to_their_size() {
    let pages = supplier();
    let mut cache = ThreadCache::new();
    for cat in 0..CATEGORY_COUNT {
      let size = category_to_size(cat);
      let mut taken = [null_mut(); 8];
      for slot in taken.iter_mut() {
        let p = unsafe { alloc_from(&mut cache, &pages, cat) };
        assert!(!p.is_null());
        assert_ne!(p as usize % PAGE_SIZE, 0);
        assert_eq!(p as usize % size, 0);
        assert_eq!(unsafe { small_allocated_size(p) }, size);
        *slot = p;
      }
      for p in taken {
        unsafe { free_into(&mut cache, &pages, p) };
      }
    }
    unsafe { cache.flush_all(&pages) };
    assert_eq!(pages.stats().live_bytes, 0);
    pages.trim(0);
  }

  #[test]
  fn page_returns_when_every_block_is_back() {
    let pages = supplier();
    let mut cache = ThreadCache::new();
    let cat = MAX_CATEGORY;
    let n = blocks_per_page(cat);

    let mut taken = [null_mut(); 16];
    for slot in taken.iter_mut().take(n) {
      *slot = unsafe { alloc_from(&mut cache, &pages, cat) };
    }
    assert_eq!(cache.free_count(cat), 0);
    assert_eq!(pages.stats().live_bytes, PAGE_SIZE);

    // Free in reverse, through a second cache, as another thread would.
    let mut other = ThreadCache::new();
    for &p in taken[..n].iter().rev() {
      unsafe { free_into(&mut other, &pages, p) };
    }
    unsafe { other.flush(cat, &pages) };
    assert_eq!(pages.stats().live_bytes, 0);
    pages.trim(0);
  }

  #[test]
  fn overflow_flushes_whole_list() {
    let pages = supplier();
    let mut cache = ThreadCache::new();
    let mut scratch = ThreadCache::new();
    let cat = 0;
    let total = CACHE_CEILING + 40;

    // Collect blocks through a scratch cache so `cache` starts empty.
    let mut taken = Vec::with_capacity(total);
    for _ in 0..total {
      taken.push(unsafe { alloc_from(&mut scratch, &pages, cat) });
    }

    for (i, &p) in taken.iter().enumerate() {
      unsafe { free_into(&mut cache, &pages, p) };
      assert!(cache.free_count(cat) <= CACHE_CEILING);
      if i == CACHE_CEILING {
        assert_eq!(cache.free_count(cat), 1);
      }
    }

    unsafe {
      cache.flush_all(&pages);
      scratch.flush_all(&pages);
    }
    assert_eq!(pages.stats().live_bytes, 0);
    pages.trim(0);
  }
}
