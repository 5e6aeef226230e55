use std::{collections::BTreeMap, ptr::NonNull, sync::Barrier, thread};

use rand::{Rng, SeedableRng, rngs::StdRng};
use trimalloc::{Heap, MAX_BYTES, MAX_PAGES, PAGE_SIZE};

fn init_logger() {
  let _ = env_logger::builder().is_test(true).try_init();
}

/// Stamps the first and last byte of a block so overlapping blocks show up as
/// clobbered tags.
unsafe fn stamp(ptr: NonNull<u8>, size: usize, tag: u8) {
  unsafe {
    ptr.as_ptr().write(tag);
    ptr.as_ptr().add(size - 1).write(tag);
  }
}

unsafe fn check(ptr: NonNull<u8>, size: usize, tag: u8) {
  unsafe {
    assert_eq!(ptr.as_ptr().read(), tag, "head of {ptr:p} clobbered");
    assert_eq!(ptr.as_ptr().add(size - 1).read(), tag, "tail of {ptr:p} clobbered");
  }
}

#[test]
fn round_trip_returns_every_page() {
  init_logger();
  let heap = Heap::new().unwrap();
  let baseline = heap.stats();
  assert_eq!(baseline.lent_pages(), 0);

  let mut rng = StdRng::seed_from_u64(0x5eed);
  let mut handle = heap.handle().unwrap();
  let mut live: Vec<(NonNull<u8>, usize)> = (0..2_000)
    .map(|_| {
      let size = rng.gen_range(1..=64 * 1024);
      (handle.allocate(size).unwrap(), size)
    })
    .collect();
  assert!(heap.stats().lent_pages() > 0);

  // Free in a shuffled order.
  for i in (1..live.len()).rev() {
    live.swap(i, rng.gen_range(0..=i));
  }
  for (ptr, _) in live {
    unsafe { handle.free(ptr) };
  }
  drop(handle);

  let stats = heap.stats();
  assert_eq!(stats.lent_pages(), 0);
  assert_eq!(stats.oversized_pages, 0);
  assert_eq!(stats.idle_pages, stats.mapped_pages);
}

#[test]
fn large_allocation_round_trip() {
  init_logger();
  let heap = Heap::new().unwrap();
  let mut handle = heap.handle().unwrap();
  let before = heap.stats();

  let size = 257 * 1024;
  let ptr = handle.allocate(size).unwrap();
  unsafe { ptr.as_ptr().write_bytes(7, size) };
  assert_eq!(heap.stats().lent_pages(), size.div_ceil(PAGE_SIZE));
  unsafe { handle.free(ptr) };

  let after = heap.stats();
  assert_eq!(after.lent_pages(), before.lent_pages());
  assert_eq!(after.oversized_pages, before.oversized_pages);
}

#[test]
fn oversized_runs_go_to_the_os() {
  init_logger();
  let heap = Heap::new().unwrap();
  let mut handle = heap.handle().unwrap();

  let size = (MAX_PAGES + 10) * PAGE_SIZE;
  let ptr = handle.allocate(size).unwrap();
  let stats = heap.stats();
  assert_eq!(stats.oversized_pages, MAX_PAGES + 10);
  // Nothing was pooled for it.
  assert_eq!(stats.mapped_pages, 0);

  unsafe { handle.free(ptr) };
  assert_eq!(heap.stats().oversized_pages, 0);
}

#[test]
fn two_threads_distinct_classes() {
  init_logger();
  let heap = Heap::new().unwrap();
  let barrier = Barrier::new(2);

  let addrs: Vec<usize> = thread::scope(|s| {
    let workers: Vec<_> = [6, 7]
      .into_iter()
      .map(|size| {
        let (heap, barrier) = (&heap, &barrier);
        s.spawn(move || {
          let mut handle = heap.handle().unwrap();
          barrier.wait();
          // The blocks stay lent out: dropping the handle only flushes its free lists.
          (0..5)
            .map(|_| handle.allocate(size).unwrap().as_ptr() as usize)
            .collect::<Vec<_>>()
        })
      })
      .collect();
    workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
  });

  assert_eq!(addrs.len(), 10);
  assert!(addrs.iter().all(|&a| a != 0 && a % 8 == 0));
  let mut unique = addrs.clone();
  unique.sort_unstable();
  unique.dedup();
  assert_eq!(unique.len(), addrs.len());

  let mut handle = heap.handle().unwrap();
  for a in addrs {
    unsafe { handle.free(NonNull::new(a as *mut u8).unwrap()) };
  }
}

#[test]
fn concurrent_stress_never_overlaps() {
  init_logger();
  const THREADS: usize = 8;
  const CYCLES: usize = 10_000;
  const LIVE: usize = 64;

  let heap = Heap::new().unwrap();

  let survivors: Vec<(usize, usize)> = thread::scope(|s| {
    let workers: Vec<_> = (0..THREADS)
      .map(|t| {
        let heap = &heap;
        s.spawn(move || {
          let mut rng = StdRng::seed_from_u64(t as u64);
          let mut handle = heap.handle().unwrap();
          let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::with_capacity(LIVE);

          for cycle in 0..CYCLES {
            let size = if rng.gen_ratio(1, 50) {
              rng.gen_range(MAX_BYTES / 2..=MAX_BYTES)
            } else {
              rng.gen_range(1..=4096)
            };
            let tag = (cycle % 251) as u8;
            let ptr = handle.allocate(size).unwrap();
            unsafe { stamp(ptr, size, tag) };
            live.push((ptr, size, tag));

            if live.len() == LIVE || rng.gen_bool(0.5) {
              let (ptr, size, tag) = live.swap_remove(rng.gen_range(0..live.len()));
              unsafe {
                check(ptr, size, tag);
                handle.free(ptr);
              }
            }
          }

          for &(ptr, size, tag) in &live {
            unsafe { check(ptr, size, tag) };
          }
          live
            .into_iter()
            .map(|(ptr, size, _)| (ptr.as_ptr() as usize, size))
            .collect::<Vec<_>>()
        })
      })
      .collect();
    workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
  });

  // No two live ranges overlap.
  let ranges: BTreeMap<usize, usize> = survivors.iter().copied().collect();
  assert_eq!(ranges.len(), survivors.len());
  let mut prev_end = 0;
  for (&start, &size) in &ranges {
    assert!(start >= prev_end, "{start:#x} overlaps a block ending at {prev_end:#x}");
    prev_end = start + size;
  }

  let mut handle = heap.handle().unwrap();
  for (addr, _) in survivors {
    unsafe { handle.free(NonNull::new(addr as *mut u8).unwrap()) };
  }
  drop(handle);
  assert_eq!(heap.stats().lent_pages(), 0);
}

#[test]
fn blocks_freed_on_other_threads() {
  init_logger();
  let heap = Heap::new().unwrap();
  let mut main = heap.handle().unwrap();
  let ptrs: Vec<_> = (0..1000).map(|i| main.allocate(8 + i % 512).unwrap().as_ptr() as usize).collect();

  thread::scope(|s| {
    for chunk in ptrs.chunks(250) {
      let heap = &heap;
      s.spawn(move || {
        let mut handle = heap.handle().unwrap();
        for &addr in chunk {
          unsafe { handle.free(NonNull::new(addr as *mut u8).unwrap()) };
        }
      });
    }
  });

  drop(main);
  assert_eq!(heap.handles(), 0);
  assert_eq!(heap.stats().lent_pages(), 0);
}
