//! Per-thread cache lifecycle.
//!
//! Registering the thread-exit hook can itself allocate (the threading
//! runtime may keep its destructor list on the heap), so a thread that is
//! still setting up is served from the locked fallback cache instead of
//! recursing into its own bootstrap. The same fallback serves threads that
//! are tearing down, and calls that re-enter the allocator while the
//! thread's cache is borrowed.
//!
//! ```text
//! thread:  Initial -> SettingUp -> Ready -> TearingDown -> Dead
//! process: Initial -> SettingUp -> Ready
//! ```

use crate::{
  page::RawPageAllocator,
  small::ThreadCache,
  sync::{Mutex, MutexGuard},
};

/// The cache used whenever a thread has no usable cache of its own.
static FALLBACK: Mutex<ThreadCache> = Mutex::new(ThreadCache::new());

#[cfg(not(feature = "single-threaded"))]
pub(crate) use tls::{get_or_create_thread_cache, get_thread_cache};

#[cfg(not(feature = "single-threaded"))]
mod tls {
  use core::{
    cell::{Cell, UnsafeCell},
    ptr::null_mut,
    sync::atomic::{AtomicU8, Ordering},
  };

  use crate::{page::PAGES, small::ThreadCache};

  #[repr(u8)]
  #[derive(Clone, Copy, Debug, PartialEq, Eq)]
  pub(super) enum Status {
    Initial = 0,
    SettingUp = 1,
    Ready = 2,
    TearingDown = 3,
    Dead = 4,
  }

  /// Process-wide: has the first thread finished registering its exit hook?
  static BOOTSTRAP: AtomicU8 = AtomicU8::new(Status::Initial as u8);

  thread_local! {
    pub(super) static STATUS: Cell<Status> = const { Cell::new(Status::Initial) };
    /// Set while this thread's cache is borrowed.
    pub(super) static BUSY: Cell<bool> = const { Cell::new(false) };
    static CACHE: UnsafeCell<ThreadCache> = const { UnsafeCell::new(ThreadCache::new()) };
    static EXIT_HOOK: ExitHook = const { ExitHook };
  }

  /// Its destructor is the thread-exit hook.
  struct ExitHook;

  impl Drop for ExitHook {
    fn drop(&mut self) {
      STATUS.set(Status::TearingDown);
      let cache = CACHE.with(|c| c.get());
      unsafe { (*cache).flush_all(&PAGES) };
      STATUS.set(Status::Dead);
    }
  }

  /// The calling thread's cache, creating it on first use. Null while the
  /// thread (or the process) is not ready; use the fallback cache then.
  pub(crate) fn get_or_create_thread_cache() -> *mut ThreadCache {
    match STATUS.get() {
      Status::Ready => CACHE.with(|c| c.get()),
      Status::Initial => bootstrap(),
      Status::SettingUp | Status::TearingDown | Status::Dead => null_mut(),
    }
  }

  /// The calling thread's cache if it is ready; never creates one.
  pub(crate) fn get_thread_cache() -> *mut ThreadCache {
    if STATUS.get() == Status::Ready {
      CACHE.with(|c| c.get())
    } else {
      null_mut()
    }
  }

  #[cold]
  fn bootstrap() -> *mut ThreadCache {
    match BOOTSTRAP.load(Ordering::Acquire) {
      s if s == Status::Ready as u8 => {}
      s if s == Status::Initial as u8 => {
        if BOOTSTRAP
          .compare_exchange(
            Status::Initial as u8,
            Status::SettingUp as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
          )
          .is_err()
        {
          return null_mut();
        }
      }
      // Another thread is registering: stay on the fallback meanwhile.
      _ => return null_mut(),
    }

    STATUS.set(Status::SettingUp);
    // Touching the hook registers its destructor; nested allocations made
    // by the registration see `SettingUp` and use the fallback.
    let registered = EXIT_HOOK.try_with(|_| ()).is_ok();
    BOOTSTRAP.store(Status::Ready as u8, Ordering::Release);

    if registered {
      STATUS.set(Status::Ready);
      CACHE.with(|c| c.get())
    } else {
      // Already past thread-local destruction.
      STATUS.set(Status::Dead);
      null_mut()
    }
  }
}

/// Run `f` on the calling thread's cache, or on the fallback cache when the
/// thread has none.
#[inline]
pub(crate) fn with_cache<R>(f: impl FnOnce(&mut ThreadCache) -> R) -> R {
  #[cfg(not(feature = "single-threaded"))]
  {
    if !tls::BUSY.get() {
      let cache = get_or_create_thread_cache();
      if !cache.is_null() {
        tls::BUSY.set(true);
        let result = f(unsafe { &mut *cache });
        tls::BUSY.set(false);
        return result;
      }
    }
  }

  let mut fallback = fallback();
  f(&mut fallback)
}

#[inline]
fn fallback() -> MutexGuard<'static, ThreadCache> {
  FALLBACK.lock()
}

/// Flush the calling thread's cache, if it has a ready one.
pub(crate) fn flush_current(pages: &RawPageAllocator) {
  #[cfg(not(feature = "single-threaded"))]
  {
    if tls::BUSY.get() {
      return;
    }
    let cache = get_thread_cache();
    if !cache.is_null() {
      tls::BUSY.set(true);
      unsafe { (*cache).flush_all(pages) };
      tls::BUSY.set(false);
    }
  }
  #[cfg(feature = "single-threaded")]
  let _ = pages;
}

pub(crate) fn flush_fallback(pages: &RawPageAllocator) {
  unsafe { fallback().flush_all(pages) };
}

/// Cached free blocks of category `cat` for the calling thread, or `None`
/// if the thread has no cache of its own.
pub(crate) fn cached_free_count(cat: usize) -> Option<usize> {
  #[cfg(not(feature = "single-threaded"))]
  {
    let cache = get_thread_cache();
    if cache.is_null() || tls::BUSY.get() {
      None
    } else {
      Some(unsafe { (*cache).free_count(cat) })
    }
  }
  #[cfg(feature = "single-threaded")]
  {
    Some(fallback().free_count(cat))
  }
}
