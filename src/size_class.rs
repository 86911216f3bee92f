//! Size classes ("categories") for small allocations.
//!
//! Category `cat` holds blocks of `MIN_SIZE << cat` bytes. The largest
//! category is a quarter page, so every small page yields at least three
//! usable blocks after its run header slot, and no small block ever starts
//! on a page boundary.

use crate::{MIN_SIZE, PAGE_SIZE};

const MIN_SIZE_BITS: u32 = MIN_SIZE.trailing_zeros();

/// Largest small category.
pub const MAX_CATEGORY: usize = (PAGE_SIZE.trailing_zeros() - 2 - MIN_SIZE_BITS) as usize;

/// Number of small categories.
pub const CATEGORY_COUNT: usize = MAX_CATEGORY + 1;

/// Requests above this many bytes are served by the large allocator.
pub const SMALL_LIMIT: usize = PAGE_SIZE / 4;

const _: () = assert!(MIN_SIZE.is_power_of_two());
const _: () = assert!(category_to_size(MAX_CATEGORY) * 4 == PAGE_SIZE);
const _: () = assert!(category_to_size(MAX_CATEGORY) == SMALL_LIMIT);
const _: () = assert!(size_to_category(SMALL_LIMIT) == MAX_CATEGORY);
const _: () = assert!(size_to_category(1) == 0);

/// Block size of category `cat`.
#[inline(always)]
pub const fn category_to_size(cat: usize) -> usize {
  MIN_SIZE << cat
}

/// Smallest category whose block size is at least `size`.
///
/// `size` must be in `1..=SMALL_LIMIT`.
#[inline(always)]
pub const fn size_to_category(size: usize) -> usize {
  debug_assert!(size > 0 && size <= SMALL_LIMIT);
  // Round `size - 1` up to all-ones in the low bits, then bit-scan.
  let rounded = (size - 1) | (MIN_SIZE - 1);
  (usize::BITS - rounded.leading_zeros() - MIN_SIZE_BITS) as usize
}

/// Number of usable blocks in a page of category `cat` (slot 0 is the run header).
#[inline(always)]
pub const fn blocks_per_page(cat: usize) -> usize {
  PAGE_SIZE / category_to_size(cat) - 1
}
