//! Raw page supplier.
//!
//! Hands out zero-filled, page-aligned ranges. Freed ranges are kept in a
//! small coalescing cache so that the small and large allocators rarely pay
//! for `mmap`/`munmap`. Huge-page-sized requests are placed next to the
//! previous huge-page-sized mapping when the kernel cooperates, which keeps
//! them eligible for transparent huge pages.
//!
//! Everything is serialized by one lock. The supplier is only reached on
//! cache misses of the allocators above it, so the lock is rarely contended.

use core::{
  ops::BitOr,
  ptr::{self, null_mut},
  sync::atomic::{AtomicUsize, Ordering},
};

use crate::{HUGE_PAGE_SIZE, PAGE_SIZE, align_up, platform, sync::Mutex};

/// Number of freed ranges remembered.
const CACHE_SLOTS: usize = 8;

/// Bytes of freed ranges kept resident before giving memory back to the OS.
const CACHE_LIMIT: usize = 1 << 20;

const _: () = assert!(CACHE_LIMIT % PAGE_SIZE == 0);
const _: () = assert!(HUGE_PAGE_SIZE % PAGE_SIZE == 0);

/// Backing-store settings of a [`RawPageAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PageConfig {
  /// Grow the program break instead of creating anonymous mappings.
  pub(crate) use_brk: bool,
  /// Place huge-page-multiple requests on huge-page boundaries and advise THP.
  pub(crate) huge_pages: bool,
}

impl PageConfig {
  /// The configuration selected by the crate features.
  pub(crate) const DEFAULT: Self = Self {
    use_brk: cfg!(feature = "brk"),
    huge_pages: cfg!(feature = "thp"),
  };
}

/// Hints passed along with a range handed back to the supplier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct ReclaimOptions(u8);

impl ReclaimOptions {
  pub(crate) const NONE: Self = Self(0);
  /// Do not coalesce with a cached range ending where this one starts.
  pub(crate) const NO_MERGE_LEFT: Self = Self(1 << 0);
  /// Do not coalesce with a cached range starting where this one ends.
  pub(crate) const NO_MERGE_RIGHT: Self = Self(1 << 1);
  /// Make the range ineligible for transparent huge pages.
  pub(crate) const NO_HUGE: Self = Self(1 << 2);
  /// The range is known to be all zeroes.
  pub(crate) const CLEAN: Self = Self(1 << 3);

  #[inline]
  pub(crate) const fn contains(self, other: Self) -> bool {
    self.0 & other.0 == other.0
  }
}

impl BitOr for ReclaimOptions {
  type Output = Self;

  fn bitor(self, rhs: Self) -> Self {
    Self(self.0 | rhs.0)
  }
}

/// Counters describing the supplier's memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageStats {
  /// Bytes currently handed out to the small and large allocators.
  pub live_bytes: usize,
  /// Bytes sitting in the freed-range cache.
  pub cached_bytes: usize,
  /// Successful requests for fresh memory from the OS.
  pub os_maps: usize,
  /// Ranges given back to the OS.
  pub os_unmaps: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Range {
  addr: usize,
  len: usize,
  clean: bool,
  /// Lies below the program break; can only be discarded, never unmapped.
  brk: bool,
}

impl Range {
  const EMPTY: Self = Self {
    addr: 0,
    len: 0,
    clean: false,
    brk: false,
  };

  #[inline]
  fn end(&self) -> usize {
    self.addr + self.len
  }

  #[inline]
  fn is_empty(&self) -> bool {
    self.len == 0
  }

  /// Cut `len` bytes off the front.
  fn split_front(&mut self, len: usize) -> Range {
    let front = Range { len, ..*self };
    self.addr += len;
    self.len -= len;
    if self.len == 0 {
      *self = Range::EMPTY;
    }
    front
  }
}

/// Where the next huge-page-sized mapping should go.
struct Hint {
  low: usize,
  high: usize,
  growing_down: bool,
}

impl Hint {
  fn next(&self, size: usize) -> usize {
    if self.high == 0 {
      0
    } else if self.growing_down {
      self.low.checked_sub(size).unwrap_or(0)
    } else {
      self.high
    }
  }

  fn record(&mut self, addr: usize, size: usize) {
    if self.high != 0 {
      self.growing_down = addr < self.low;
    }
    self.low = addr;
    self.high = addr + size;
  }
}

/// Addresses obtained by moving the program break.
struct BrkRegion {
  floor: usize,
  end: usize,
}

impl BrkRegion {
  #[inline]
  fn contains(&self, addr: usize) -> bool {
    self.floor != 0 && addr >= self.floor && addr < self.end
  }
}

struct PageState {
  cache: [Range; CACHE_SLOTS],
  cached_bytes: usize,
  hint: Hint,
  brk: BrkRegion,
}

/// Ranges taken out of the cache while the lock was held, released after.
struct Evicted {
  ranges: [Range; CACHE_SLOTS + 1],
  len: usize,
}

impl Evicted {
  const fn new() -> Self {
    Self {
      ranges: [Range::EMPTY; CACHE_SLOTS + 1],
      len: 0,
    }
  }

  fn push(&mut self, range: Range) {
    self.ranges[self.len] = range;
    self.len += 1;
  }

  fn as_mut_slice(&mut self) -> &mut [Range] {
    &mut self.ranges[..self.len]
  }
}

impl PageState {
  const fn new() -> Self {
    Self {
      cache: [Range::EMPTY; CACHE_SLOTS],
      cached_bytes: 0,
      hint: Hint {
        low: 0,
        high: 0,
        growing_down: false,
      },
      brk: BrkRegion { floor: 0, end: 0 },
    }
  }

  /// Best fit: the smallest cached range holding `size` bytes.
  fn take_cached(&mut self, size: usize) -> Option<Range> {
    let mut best: Option<usize> = None;
    for (i, r) in self.cache.iter().enumerate() {
      if r.len >= size && best.is_none_or(|b| r.len < self.cache[b].len) {
        best = Some(i);
      }
    }
    let i = best?;
    self.cached_bytes -= size;
    Some(self.cache[i].split_front(size))
  }

  /// A cached range starting exactly at `addr` with at least `len` bytes.
  fn take_at(&mut self, addr: usize, len: usize) -> Option<Range> {
    let slot = self
      .cache
      .iter_mut()
      .find(|r| !r.is_empty() && r.addr == addr && r.len >= len)?;
    self.cached_bytes -= len;
    Some(slot.split_front(len))
  }

  /// Cache `range`, coalescing with neighbours. Returns the range back if
  /// there is no slot for it.
  fn insert(&mut self, mut range: Range, opts: ReclaimOptions) -> Option<Range> {
    let left = if opts.contains(ReclaimOptions::NO_MERGE_LEFT) {
      None
    } else {
      self
        .cache
        .iter()
        .position(|r| !r.is_empty() && r.end() == range.addr && r.brk == range.brk)
    };
    let right = if opts.contains(ReclaimOptions::NO_MERGE_RIGHT) {
      None
    } else {
      self
        .cache
        .iter()
        .position(|r| !r.is_empty() && r.addr == range.end() && r.brk == range.brk)
    };

    let len = range.len;
    if let Some(r) = right {
      let right = core::mem::replace(&mut self.cache[r], Range::EMPTY);
      range.len += right.len;
      range.clean &= right.clean;
    }
    if let Some(l) = left {
      let left = &mut self.cache[l];
      left.len += range.len;
      left.clean &= range.clean;
    } else if let Some(slot) = self.cache.iter_mut().find(|r| r.is_empty()) {
      // A right merge always frees a slot, so a full cache means no merge.
      *slot = range;
    } else {
      return Some(range);
    }
    self.cached_bytes += len;
    None
  }

  fn evict_largest(&mut self) -> Option<Range> {
    let (i, _) = self
      .cache
      .iter()
      .enumerate()
      .filter(|(_, r)| !r.is_empty())
      .max_by_key(|(_, r)| r.len)?;
    let range = core::mem::replace(&mut self.cache[i], Range::EMPTY);
    self.cached_bytes -= range.len;
    Some(range)
  }

  /// Move the program break down over evicted ranges that sit at its top.
  unsafe fn shrink_break(&mut self, evicted: &mut [Range]) {
    for r in evicted.iter_mut().filter(|r| r.brk && !r.is_empty()) {
      if r.end() == self.brk.end
        && unsafe { platform::program_break() } == self.brk.end
        && !unsafe { platform::move_break(-(r.len as isize)) }.is_null()
      {
        self.brk.end = r.addr;
        *r = Range::EMPTY;
      }
    }
  }

  /// Extend the program break by `size` bytes, page aligned.
  unsafe fn grow_break(&mut self, size: usize) -> *mut u8 {
    let cur = unsafe { platform::program_break() };
    if cur == 0 {
      return null_mut();
    }
    let pad = align_up(cur, PAGE_SIZE) - cur;
    let Some(total) = size.checked_add(pad) else {
      return null_mut();
    };
    let Ok(delta) = isize::try_from(total) else {
      return null_mut();
    };
    let old = unsafe { platform::move_break(delta) };
    if old.is_null() {
      return null_mut();
    }
    let start = old as usize + pad;
    let Some(end) = start.checked_add(size) else {
      unsafe { platform::move_break(-delta) };
      return null_mut();
    };
    if self.brk.floor == 0 {
      self.brk.floor = start;
    }
    self.brk.end = end;
    start as *mut u8
  }
}

/// The OS-facing page layer.
pub(crate) struct RawPageAllocator {
  config: PageConfig,
  state: Mutex<PageState>,
  live: AtomicUsize,
  os_maps: AtomicUsize,
  os_unmaps: AtomicUsize,
}

/// The process-wide page supplier.
pub(crate) static PAGES: RawPageAllocator = RawPageAllocator::new(PageConfig::DEFAULT);

impl RawPageAllocator {
  pub(crate) const fn new(config: PageConfig) -> Self {
    Self {
      config,
      state: Mutex::new(PageState::new()),
      live: AtomicUsize::new(0),
      os_maps: AtomicUsize::new(0),
      os_unmaps: AtomicUsize::new(0),
    }
  }

  #[inline]
  fn wants_huge(&self, size: usize) -> bool {
    self.config.huge_pages && size % HUGE_PAGE_SIZE == 0
  }

  /// Get `size` bytes of zeroed memory. `size` is a non-zero multiple of
  /// `PAGE_SIZE`. Returns null when the OS refuses.
  pub(crate) fn allocate(&self, size: usize) -> *mut u8 {
    debug_assert!(size > 0 && size % PAGE_SIZE == 0);

    let mut state = self.state.lock();
    if let Some(range) = state.take_cached(size) {
      drop(state);
      if !range.clean {
        unsafe { ptr::write_bytes(range.addr as *mut u8, 0, size) };
      }
      self.live.fetch_add(size, Ordering::Relaxed);
      return range.addr as *mut u8;
    }

    let mut ptr = null_mut();
    if self.config.use_brk && !self.wants_huge(size) {
      ptr = unsafe { state.grow_break(size) };
    }
    if ptr.is_null() {
      ptr = unsafe { self.map_fresh(&mut state, size) };
    }
    drop(state);

    if !ptr.is_null() {
      self.os_maps.fetch_add(1, Ordering::Relaxed);
      self.live.fetch_add(size, Ordering::Relaxed);
    }
    ptr
  }

  unsafe fn map_fresh(&self, state: &mut PageState, size: usize) -> *mut u8 {
    if !self.wants_huge(size) {
      return unsafe { platform::map(0, size) };
    }

    let mut ptr = unsafe { platform::map(state.hint.next(size), size) };
    if ptr.is_null() {
      return null_mut();
    }
    if ptr as usize % HUGE_PAGE_SIZE != 0 {
      unsafe { platform::unmap(ptr, size) };
      ptr = unsafe { map_aligned(size, HUGE_PAGE_SIZE) };
      if ptr.is_null() {
        return null_mut();
      }
    }
    state.hint.record(ptr as usize, size);
    if ptr as usize % HUGE_PAGE_SIZE == 0 {
      unsafe { platform::advise_huge(ptr, size, true) };
    }
    ptr
  }

  /// Give `[ptr, ptr + size)` back. It is cached, or returned to the OS when
  /// the cache is full.
  pub(crate) unsafe fn reclaim_page(&self, ptr: *mut u8, size: usize, opts: ReclaimOptions) {
    debug_assert!(size > 0 && size % PAGE_SIZE == 0 && ptr as usize % PAGE_SIZE == 0);
    self.live.fetch_sub(size, Ordering::Relaxed);

    if opts.contains(ReclaimOptions::NO_HUGE) {
      unsafe { platform::advise_huge(ptr, size, false) };
    }

    let mut evicted = Evicted::new();
    {
      let mut state = self.state.lock();
      let range = Range {
        addr: ptr as usize,
        len: size,
        clean: opts.contains(ReclaimOptions::CLEAN),
        brk: state.brk.contains(ptr as usize),
      };
      if size > CACHE_LIMIT {
        evicted.push(range);
      } else {
        if let Some(range) = state.insert(range, opts) {
          evicted.push(range);
        }
        while state.cached_bytes > CACHE_LIMIT {
          match state.evict_largest() {
            Some(range) => evicted.push(range),
            None => break,
          }
        }
      }
      unsafe { state.shrink_break(evicted.as_mut_slice()) };
    }

    for range in evicted.as_mut_slice() {
      unsafe { self.release(*range) };
    }
  }

  /// Grow the range at `ptr` from `old_size` to `new_size` bytes without
  /// moving it. The added bytes are zero.
  pub(crate) unsafe fn extend_page_nomove(
    &self,
    ptr: *mut u8,
    old_size: usize,
    new_size: usize,
  ) -> bool {
    if new_size <= old_size {
      return true;
    }
    let delta = new_size - old_size;
    let tail = ptr as usize + old_size;

    let mut state = self.state.lock();
    if let Some(range) = state.take_at(tail, delta) {
      drop(state);
      if !range.clean {
        unsafe { ptr::write_bytes(tail as *mut u8, 0, delta) };
      }
      self.live.fetch_add(delta, Ordering::Relaxed);
      return true;
    }

    if state.brk.contains(ptr as usize) {
      let (Ok(step), Some(end)) = (isize::try_from(delta), tail.checked_add(delta)) else {
        return false;
      };
      let grown = tail == state.brk.end
        && unsafe { platform::program_break() } == tail
        && !unsafe { platform::move_break(step) }.is_null();
      if grown {
        state.brk.end = end;
        self.live.fetch_add(delta, Ordering::Relaxed);
      }
      return grown;
    }
    drop(state);

    let grown = unsafe {
      platform::remap_in_place(ptr, old_size, new_size) || platform::map_exact(tail, delta)
    };
    if grown {
      self.os_maps.fetch_add(1, Ordering::Relaxed);
      self.live.fetch_add(delta, Ordering::Relaxed);
    }
    grown
  }

  /// Return cached ranges to the OS until at most `pad` bytes stay cached.
  /// Returns the number of bytes released.
  pub(crate) fn trim(&self, pad: usize) -> usize {
    let mut evicted = Evicted::new();
    {
      let mut state = self.state.lock();
      while state.cached_bytes > pad {
        match state.evict_largest() {
          Some(range) => evicted.push(range),
          None => break,
        }
      }
      unsafe { state.shrink_break(evicted.as_mut_slice()) };
    }

    let mut released = 0;
    for range in evicted.as_mut_slice() {
      released += range.len;
      unsafe { self.release(*range) };
    }
    released
  }

  unsafe fn release(&self, range: Range) {
    if range.is_empty() {
      return;
    }
    if range.brk {
      // Not at the top of the break: the addresses stay ours, the memory goes.
      unsafe { platform::discard(range.addr as *mut u8, range.len) };
    } else {
      unsafe { platform::unmap(range.addr as *mut u8, range.len) };
    }
    self.os_unmaps.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn stats(&self) -> PageStats {
    let cached_bytes = self.state.lock().cached_bytes;
    PageStats {
      live_bytes: self.live.load(Ordering::Relaxed),
      cached_bytes,
      os_maps: self.os_maps.load(Ordering::Relaxed),
      os_unmaps: self.os_unmaps.load(Ordering::Relaxed),
    }
  }
}

/// Map `size` bytes aligned to `align` by over-mapping and trimming.
unsafe fn map_aligned(size: usize, align: usize) -> *mut u8 {
  let Some(total) = size.checked_add(align) else {
    return null_mut();
  };
  let raw = unsafe { platform::map(0, total) };
  if raw.is_null() {
    return null_mut();
  }
  let start = align_up(raw as usize, align);
  let head = start - raw as usize;
  let tail = total - head - size;
  if head > 0 {
    unsafe { platform::unmap(raw, head) };
  }
  if tail > 0 {
    unsafe { platform::unmap((start + size) as *mut u8, tail) };
  }
  start as *mut u8
}
