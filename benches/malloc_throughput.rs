use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use runalloc::AllocOptions;
use std::hint::black_box;

const OPS: u64 = 100_000;

/// Batch size for the fill-then-drain pattern; larger than the cache ceiling
/// so the flush path is part of the measurement.
const BATCH: usize = 1024;

/// runalloc alloc/free throughput.
fn runalloc_malloc_free(size: usize) {
  for _ in 0..OPS {
    let ptr = runalloc::allocate(size, AllocOptions::new());
    black_box(ptr);
    unsafe { runalloc::reclaim(ptr) };
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

fn runalloc_batch(size: usize, ptrs: &mut Vec<*mut u8>) {
  for _ in 0..BATCH {
    ptrs.push(runalloc::allocate(size, AllocOptions::new()));
  }
  for ptr in ptrs.drain(..) {
    unsafe { runalloc::reclaim(black_box(ptr)) };
  }
}

fn libc_batch(size: usize, ptrs: &mut Vec<*mut libc::c_void>) {
  for _ in 0..BATCH {
    ptrs.push(unsafe { libc::malloc(size) });
  }
  for ptr in ptrs.drain(..) {
    unsafe { libc::free(black_box(ptr)) };
  }
}

fn benchmark_malloc_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("malloc_throughput");

  for size in [16, 64, 256, 1024, 4096] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("runalloc", size), &size, |b, &size| {
      b.iter(|| runalloc_malloc_free(size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

fn benchmark_batch(c: &mut Criterion) {
  let mut group = c.benchmark_group("batch");

  for size in [32, 512, 8192] {
    group.throughput(Throughput::Elements(BATCH as u64));

    let mut ptrs = Vec::with_capacity(BATCH);
    group.bench_with_input(BenchmarkId::new("runalloc", size), &size, |b, &size| {
      b.iter(|| runalloc_batch(size, &mut ptrs))
    });

    let mut ptrs = Vec::with_capacity(BATCH);
    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_batch(size, &mut ptrs))
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_malloc_throughput, benchmark_batch);
criterion_main!(benches);
