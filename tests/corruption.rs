//! Death tests: each one re-runs itself in a child process that breaks a
//! heap invariant, and expects the child to abort.

use std::{
  os::unix::process::ExitStatusExt,
  process::{Command, Output},
};

use runalloc::{AllocOptions, PAGE_SIZE, allocate, reclaim, reclaim_sized};

const ACTION: &str = "RUNALLOC_CORRUPT";

/// Run `test` in a child process with `action` selected.
fn in_child(test: &str, action: &str) -> Output {
  let exe = std::env::current_exe().expect("test binary path");
  Command::new(exe)
    .args([test, "--exact", "--nocapture", "--test-threads=1"])
    .env(ACTION, action)
    .output()
    .expect("spawn child")
}

fn assert_aborted(out: &Output, message: &str) {
  let stderr = String::from_utf8_lossy(&out.stderr);
  assert_eq!(out.status.signal(), Some(libc::SIGABRT), "stderr: {stderr}");
  assert!(stderr.contains(message), "stderr: {stderr}");
}

/// Runs `corrupt` when this process is the child for `action`.
fn child_action(action: &str, corrupt: impl FnOnce()) -> bool {
  if std::env::var(ACTION).as_deref() == Ok(action) {
    corrupt();
    true
  } else {
    false
  }
}

#[test]
fn overwritten_category_aborts() {
  if child_action("category", || unsafe {
    let p = allocate(40, AllocOptions::new());
    let run = (p as usize & !(PAGE_SIZE - 1)) as *mut u32;
    run.write(99);
    reclaim(p);
  }) {
    panic!("survived a corrupted run header");
  }
  let out = in_child("overwritten_category_aborts", "category");
  assert_aborted(&out, "category 99");
}

#[test]
fn interior_pointer_aborts() {
  if child_action("interior", || unsafe {
    let p = allocate(64, AllocOptions::new());
    reclaim(p.add(16));
  }) {
    panic!("survived freeing an interior pointer");
  }
  let out = in_child("interior_pointer_aborts", "interior");
  assert_aborted(&out, "block boundary");
}

#[test]
fn oversized_large_free_aborts() {
  if child_action("large-size", || unsafe {
    let p = allocate(3 * PAGE_SIZE, AllocOptions::new());
    reclaim_sized(p, 4 * PAGE_SIZE + 1);
  }) {
    panic!("survived an oversized sized free");
  }
  let out = in_child("oversized_large_free_aborts", "large-size");
  assert_aborted(&out, "claims");
}

#[test]
fn oversized_small_free_aborts() {
  if child_action("small-size", || unsafe {
    let p = allocate(40, AllocOptions::new());
    reclaim_sized(p, 65);
  }) {
    panic!("survived an oversized sized free");
  }
  let out = in_child("oversized_small_free_aborts", "small-size");
  assert_aborted(&out, "claims 65 bytes but only 64");
}

#[test]
fn large_double_free_aborts() {
  if child_action("double-free", || unsafe {
    let p = allocate(2 * PAGE_SIZE, AllocOptions::new());
    reclaim(p);
    reclaim(p);
  }) {
    panic!("survived a double free");
  }
  let out = in_child("large_double_free_aborts", "double-free");
  assert_aborted(&out, "not a live large allocation");
}

#[cfg(feature = "never-fail")]
#[test]
fn exhaustion_aborts_when_failure_is_not_allowed() {
  let size = usize::MAX - PAGE_SIZE;
  if child_action("exhaust", || {
    allocate(size, AllocOptions::new());
  }) {
    panic!("allocation failure returned");
  }
  let out = in_child("exhaustion_aborts_when_failure_is_not_allowed", "exhaust");
  assert_aborted(&out, &format!("runalloc: out of memory allocating {size} bytes"));
}
