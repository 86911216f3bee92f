//! Locking and the per-run live-block counter.
//!
//! Nothing in here allocates: the allocator's own locks must be usable
//! before any other part of the process is.

use core::{
  cell::UnsafeCell,
  ops::{Deref, DerefMut},
};

#[cfg(not(feature = "single-threaded"))]
use core::{
  hint,
  sync::atomic::{AtomicU32, Ordering, fence},
};

#[cfg(feature = "single-threaded")]
use core::cell::Cell;

// =============================================================================
// Raw lock
// =============================================================================

/// Iterations spent spinning before parking on the futex.
#[cfg(not(feature = "single-threaded"))]
const SPIN_LIMIT: u32 = 64;

#[cfg(not(feature = "single-threaded"))]
const UNLOCKED: u32 = 0;
#[cfg(not(feature = "single-threaded"))]
const LOCKED: u32 = 1;
#[cfg(not(feature = "single-threaded"))]
const CONTENDED: u32 = 2;

/// Three-state futex lock: unlocked, locked, locked with waiters.
#[cfg(not(feature = "single-threaded"))]
pub(crate) struct RawLock {
  state: AtomicU32,
}

#[cfg(not(feature = "single-threaded"))]
impl RawLock {
  pub(crate) const fn new() -> Self {
    Self {
      state: AtomicU32::new(UNLOCKED),
    }
  }

  #[inline]
  pub(crate) fn try_lock(&self) -> bool {
    self
      .state
      .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
      .is_ok()
  }

  #[inline]
  pub(crate) fn lock(&self) {
    if !self.try_lock() {
      self.lock_contended();
    }
  }

  #[cold]
  fn lock_contended(&self) {
    for _ in 0..SPIN_LIMIT {
      if self.state.load(Ordering::Relaxed) == UNLOCKED && self.try_lock() {
        return;
      }
      hint::spin_loop();
    }

    while self.state.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
      futex_wait(&self.state, CONTENDED);
    }
  }

  #[inline]
  pub(crate) fn unlock(&self) {
    if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
      futex_wake_one(&self.state);
    }
  }
}

#[cfg(all(target_os = "linux", not(feature = "single-threaded")))]
fn futex_wait(state: &AtomicU32, expected: u32) {
  unsafe {
    libc::syscall(
      libc::SYS_futex,
      state.as_ptr(),
      libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
      expected,
      core::ptr::null::<libc::timespec>(),
    );
  }
}

#[cfg(all(target_os = "linux", not(feature = "single-threaded")))]
fn futex_wake_one(state: &AtomicU32) {
  unsafe {
    libc::syscall(
      libc::SYS_futex,
      state.as_ptr(),
      libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
      1,
    );
  }
}

// No futex: waiters re-check after yielding the CPU.
#[cfg(all(not(target_os = "linux"), not(feature = "single-threaded")))]
fn futex_wait(state: &AtomicU32, expected: u32) {
  if state.load(Ordering::Relaxed) == expected {
    unsafe { libc::sched_yield() };
  }
}

#[cfg(all(not(target_os = "linux"), not(feature = "single-threaded")))]
fn futex_wake_one(_state: &AtomicU32) {}

/// Single-threaded builds only need to catch re-entrant locking.
#[cfg(feature = "single-threaded")]
pub(crate) struct RawLock {
  locked: Cell<bool>,
}

// Safety: the `single-threaded` feature promises the process never shares the
// allocator between threads.
#[cfg(feature = "single-threaded")]
unsafe impl Sync for RawLock {}

#[cfg(feature = "single-threaded")]
impl RawLock {
  pub(crate) const fn new() -> Self {
    Self {
      locked: Cell::new(false),
    }
  }

  #[inline]
  pub(crate) fn try_lock(&self) -> bool {
    !self.locked.replace(true)
  }

  #[inline]
  pub(crate) fn lock(&self) {
    if !self.try_lock() {
      crate::error::corrupted(crate::error::HeapCorruption::ReentrantLock);
    }
  }

  #[inline]
  pub(crate) fn unlock(&self) {
    self.locked.set(false);
  }
}

// =============================================================================
// Mutex
// =============================================================================

/// A `RawLock` paired with the data it protects.
pub(crate) struct Mutex<T> {
  lock: RawLock,
  value: UnsafeCell<T>,
}

// Safety: access to `value` only happens through a guard, which holds the lock.
unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
  pub(crate) const fn new(value: T) -> Self {
    Self {
      lock: RawLock::new(),
      value: UnsafeCell::new(value),
    }
  }

  #[inline]
  pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
    self.lock.lock();
    MutexGuard { mutex: self }
  }
}

pub(crate) struct MutexGuard<'a, T> {
  mutex: &'a Mutex<T>,
}

impl<T> Drop for MutexGuard<'_, T> {
  #[inline]
  fn drop(&mut self) {
    self.mutex.lock.unlock();
  }
}

impl<T> Deref for MutexGuard<'_, T> {
  type Target = T;

  #[inline]
  fn deref(&self) -> &T {
    unsafe { &*self.mutex.value.get() }
  }
}

impl<T> DerefMut for MutexGuard<'_, T> {
  #[inline]
  fn deref_mut(&mut self) -> &mut T {
    unsafe { &mut *self.mutex.value.get() }
  }
}

// =============================================================================
// Live-block counter
// =============================================================================

/// Count of blocks of a run that have not been handed back to it.
///
/// Decrements may come from any thread; the thread that takes the count to
/// zero owns the page afterwards.
#[repr(transparent)]
pub(crate) struct LiveCount {
  #[cfg(not(feature = "single-threaded"))]
  value: AtomicU32,
  #[cfg(feature = "single-threaded")]
  value: Cell<u32>,
}

impl LiveCount {
  #[inline]
  pub(crate) fn set(&self, n: u32) {
    #[cfg(not(feature = "single-threaded"))]
    self.value.store(n, Ordering::Relaxed);
    #[cfg(feature = "single-threaded")]
    self.value.set(n);
  }

  /// Give back `n` blocks. Returns the count left, or `None` if the counter
  /// would go below zero.
  #[inline]
  pub(crate) fn release(&self, n: u32) -> Option<u32> {
    #[cfg(not(feature = "single-threaded"))]
    {
      let prev = self.value.fetch_sub(n, Ordering::Release);
      if prev < n {
        return None;
      }
      if prev == n {
        // Pairs with the release decrements of every other freeing thread.
        fence(Ordering::Acquire);
      }
      Some(prev - n)
    }
    #[cfg(feature = "single-threaded")]
    {
      let prev = self.value.get();
      let left = prev.checked_sub(n)?;
      self.value.set(left);
      Some(left)
    }
  }
}
