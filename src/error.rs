//! The two failure families: running out of memory, and a heap that no
//! longer satisfies its invariants.
//!
//! Out-of-memory is an ordinary result (null / `AllocError`). Corruption is
//! never returned to anyone: the process is aborted with a one-line message,
//! formatted on the stack because the heap can no longer be trusted.

use core::fmt::{self, Write};

use crate::{platform, size_class::MAX_CATEGORY};

/// An allocation request that could not be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
  #[error("out of memory allocating {size} bytes")]
  OutOfMemory { size: usize },
  #[error("alignment {align} is not a power of two")]
  InvalidAlignment { align: usize },
}

/// A broken heap invariant. Reported through [`corrupted`], which aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeapCorruption {
  #[error("run at {run:#x} holds category {cat}, expected at most {max}", max = MAX_CATEGORY)]
  BadCategory { run: usize, cat: u32 },
  #[error("pointer {ptr:#x} is not on a {size}-byte block boundary")]
  MisalignedBlock { ptr: usize, size: usize },
  #[error("live-block counter of run at {run:#x} went below zero")]
  CounterUnderflow { run: usize },
  #[error("free of {ptr:#x} claims {given} bytes but only {actual} are allocated")]
  SizeMismatch {
    ptr: usize,
    given: usize,
    actual: usize,
  },
  #[error("{ptr:#x} is not a live large allocation")]
  UnknownLargePointer { ptr: usize },
  #[error("allocator lock re-entered")]
  ReentrantLock,
}

/// Fixed-capacity `fmt::Write` sink; output past the end is dropped.
struct StackWriter<const N: usize> {
  buf: [u8; N],
  len: usize,
}

impl<const N: usize> StackWriter<N> {
  const fn new() -> Self {
    Self { buf: [0; N], len: 0 }
  }

  fn as_bytes(&self) -> &[u8] {
    &self.buf[..self.len]
  }
}

impl<const N: usize> Write for StackWriter<N> {
  fn write_str(&mut self, s: &str) -> fmt::Result {
    let take = s.len().min(N - self.len);
    self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
    self.len += take;
    Ok(())
  }
}

fn die(args: fmt::Arguments<'_>) -> ! {
  let mut out = StackWriter::<256>::new();
  let _ = out.write_fmt(args);
  let _ = out.write_str("\n");
  platform::write_stderr(out.as_bytes());
  platform::abort()
}

/// Abort the process on a corrupted heap.
#[cold]
#[inline(never)]
pub(crate) fn corrupted(err: HeapCorruption) -> ! {
  die(format_args!("runalloc: heap corruption: {err}"))
}

/// Abort the process because an allocation failed and failure is not an option.
#[cfg(feature = "never-fail")]
#[cold]
#[inline(never)]
pub(crate) fn out_of_memory(size: usize) -> ! {
  die(format_args!("runalloc: {}", AllocError::OutOfMemory { size }))
}
