//! Thin wrappers over the OS paging primitives.
//!
//! Every function reports failure as null / `false`; nothing here allocates.

use cfg_if::cfg_if;
use core::ptr::null_mut;

cfg_if! {
  if #[cfg(target_os = "linux")] {
    const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
  } else {
    const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;
  }
}

/// Map `len` bytes of zeroed read/write memory, preferring address `hint`
/// (0 = anywhere).
pub(crate) unsafe fn map(hint: usize, len: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      hint as *mut libc::c_void,
      len,
      libc::PROT_READ | libc::PROT_WRITE,
      MAP_FLAGS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

cfg_if! {
  if #[cfg(target_os = "linux")] {
    const MAP_EXACT_FLAGS: libc::c_int = MAP_FLAGS | libc::MAP_FIXED_NOREPLACE;

    /// Grow the mapping at `ptr` from `old_len` to `new_len` without moving it.
    pub(crate) unsafe fn remap_in_place(ptr: *mut u8, old_len: usize, new_len: usize) -> bool {
      let res = unsafe { libc::mremap(ptr.cast(), old_len, new_len, 0) };
      res != libc::MAP_FAILED && res as usize == ptr as usize
    }

    /// Toggle transparent-huge-page eligibility for a range.
    pub(crate) unsafe fn advise_huge(ptr: *mut u8, len: usize, enable: bool) {
      let advice = if enable { libc::MADV_HUGEPAGE } else { libc::MADV_NOHUGEPAGE };
      unsafe { libc::madvise(ptr.cast(), len, advice) };
    }

    /// Current program break.
    pub(crate) unsafe fn program_break() -> usize {
      unsafe { libc::sbrk(0) as usize }
    }

    /// Move the program break by `delta` bytes; returns the old break.
    pub(crate) unsafe fn move_break(delta: isize) -> *mut u8 {
      let old = unsafe { libc::sbrk(delta as libc::intptr_t) };
      if old as isize == -1 { null_mut() } else { old as *mut u8 }
    }
  } else {
    const MAP_EXACT_FLAGS: libc::c_int = MAP_FLAGS;

    pub(crate) unsafe fn remap_in_place(_ptr: *mut u8, _old_len: usize, _new_len: usize) -> bool {
      false
    }

    pub(crate) unsafe fn advise_huge(_ptr: *mut u8, _len: usize, _enable: bool) {}

    pub(crate) unsafe fn program_break() -> usize {
      0
    }

    pub(crate) unsafe fn move_break(_delta: isize) -> *mut u8 {
      null_mut()
    }
  }
}

/// Map exactly `[addr, addr + len)` if nothing is mapped there yet.
pub(crate) unsafe fn map_exact(addr: usize, len: usize) -> bool {
  let ptr = unsafe {
    libc::mmap(
      addr as *mut libc::c_void,
      len,
      libc::PROT_READ | libc::PROT_WRITE,
      MAP_EXACT_FLAGS,
      -1,
      0,
    )
  };
  if ptr == libc::MAP_FAILED {
    return false;
  }
  // Kernels without MAP_FIXED_NOREPLACE treat the address as a hint.
  if ptr as usize != addr {
    unsafe { unmap(ptr as *mut u8, len) };
    return false;
  }
  true
}

pub(crate) unsafe fn unmap(ptr: *mut u8, len: usize) {
  unsafe { libc::munmap(ptr.cast(), len) };
}

/// Drop the physical backing of a range while keeping the addresses.
/// Returns whether the range now reads as zero.
pub(crate) unsafe fn discard(ptr: *mut u8, len: usize) -> bool {
  let rc = unsafe { libc::madvise(ptr.cast(), len, libc::MADV_DONTNEED) };
  rc == 0 && cfg!(target_os = "linux")
}

cfg_if! {
  if #[cfg(any(target_os = "linux", target_os = "android"))] {
    pub(crate) fn set_errno(code: libc::c_int) {
      unsafe { *libc::__errno_location() = code };
    }
  } else if #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))] {
    pub(crate) fn set_errno(code: libc::c_int) {
      unsafe { *libc::__error() = code };
    }
  } else {
    pub(crate) fn set_errno(_code: libc::c_int) {}
  }
}

pub(crate) fn write_stderr(bytes: &[u8]) {
  let mut rest = bytes;
  while !rest.is_empty() {
    let n = unsafe { libc::write(2, rest.as_ptr().cast(), rest.len()) };
    if n <= 0 {
      return;
    }
    rest = &rest[n as usize..];
  }
}

pub(crate) fn abort() -> ! {
  unsafe { libc::abort() }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::PAGE_SIZE;

  #[test]
  fn mapped_memory_is_zeroed() {
    unsafe {
      let p = map(0, 4 * PAGE_SIZE);
      assert!(!p.is_null());
      assert_eq!(p as usize % PAGE_SIZE, 0);
      let bytes = core::slice::from_raw_parts(p, 4 * PAGE_SIZE);
      assert!(bytes.iter().all(|&b| b == 0));
      unmap(p, 4 * PAGE_SIZE);
    }
  }

  #[test]
  fn map_exact_refuses_occupied_range() {
    unsafe {
      let p = map(0, 2 * PAGE_SIZE);
      assert!(!p.is_null());
      assert!(!map_exact(p as usize, PAGE_SIZE));
      unmap(p, 2 * PAGE_SIZE);
    }
  }

  #[cfg(target_os = "linux")]
  #[test]
  fn discard_zeroes_on_linux() {
    unsafe {
      let p = map(0, PAGE_SIZE);
      p.write_bytes(0xAB, PAGE_SIZE);
      assert!(discard(p, PAGE_SIZE));
      assert_eq!(*p, 0);
      unmap(p, PAGE_SIZE);
    }
  }
}
