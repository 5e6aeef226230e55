//! Cross-thread pool of carved spans, one locked bucket per size class.
//!
//! Lock order: a bucket lock is never held across a call that takes the
//! page-cache lock. Owners of returned blocks are resolved through the
//! lock-free page index instead.

use core::{
  array,
  ptr::{NonNull, null_mut},
};

use log::trace;

use crate::{
  NUM_CLASSES,
  error::Result,
  free_list::{Batch, FreeBlock},
  page_cache::PageCache,
  size_class,
  span::{Span, SpanList},
  sync::{SpinGuard, SpinMutex},
};

pub(crate) struct CentralCache {
  buckets: [SpinMutex<SpanList>; NUM_CLASSES],
}

impl CentralCache {
  pub(crate) fn new(pages: &PageCache) -> Result<Self> {
    let mut heads = [NonNull::dangling(); NUM_CLASSES];
    for head in heads.iter_mut() {
      *head = pages.new_sentinel()?;
    }
    Ok(Self {
      // Safety: each sentinel is fresh and used by exactly one list
      buckets: array::from_fn(|i| SpinMutex::new(unsafe { SpanList::new(heads[i]) })),
    })
  }

  /// Detaches up to `batch` blocks of `size` bytes (a rounded class size).
  /// The returned chain always holds at least one block.
  pub(crate) fn fetch_range_obj(&self, pages: &PageCache, batch: usize, size: usize) -> Result<Batch> {
    debug_assert!(batch > 0);
    debug_assert_eq!(size, size_class::round_up(size));

    let class = size_class::index(size);
    let (bucket, mut span) = self.get_one_span(pages, self.buckets[class].lock(), class, size)?;

    let s = unsafe { span.as_mut() };
    let Some(start) = NonNull::new(s.free_list) else {
      panic!("span handed out without free blocks");
    };

    let mut end = start;
    let mut len = 1;
    // Safety: blocks on a span's free list are free and linked through their first word
    unsafe {
      while len < batch {
        let Some(next) = NonNull::new(FreeBlock::next(end.as_ptr())) else {
          break;
        };
        end = next;
        len += 1;
      }
      s.free_list = FreeBlock::next(end.as_ptr());
      FreeBlock::set_next(end.as_ptr(), null_mut());
    }
    s.in_use += len;
    debug_assert!(s.in_use <= s.capacity());
    drop(bucket);

    Ok(Batch { start, end, len })
  }

  /// Finds a span of `class` with free blocks, carving a new one if needed.
  ///
  /// The bucket lock is released while the page cache is consulted and
  /// re-acquired before returning.
  fn get_one_span<'a>(
    &'a self,
    pages: &PageCache,
    bucket: SpinGuard<'a, SpanList>,
    class: usize,
    size: usize,
  ) -> Result<(SpinGuard<'a, SpanList>, NonNull<Span>)> {
    if let Some(span) = bucket
      .iter()
      .find(|span| !unsafe { span.as_ref() }.free_list.is_null())
    {
      return Ok((bucket, span));
    }
    drop(bucket);

    let k = size_class::num_move_page(size);
    let mut span = pages.new_span(k)?;

    // The span is owned and unlisted: nobody else can reach it yet.
    let s = unsafe { span.as_mut() };
    s.block_size = size;
    s.in_use = 0;
    unsafe { carve(s) };
    trace!("central cache: class {class} carved {} blocks of {size} bytes from {k} pages", s.capacity());

    let mut bucket = self.buckets[class].lock();
    unsafe { bucket.push_front(span) };
    Ok((bucket, span))
  }

  /// Returns a chain of blocks of `size` bytes to their spans. Spans left
  /// with no blocks in use go back to the page cache.
  ///
  /// # Safety
  ///
  /// `start` must head a null-terminated chain of blocks of `size` bytes,
  /// all handed out by [`CentralCache::fetch_range_obj`] of this cache and
  /// no longer used.
  pub(crate) unsafe fn release_list_to_spans(&self, pages: &PageCache, start: NonNull<FreeBlock>, size: usize) {
    let class = size_class::index(size);
    let mut released = 0;
    let mut bucket = self.buckets[class].lock();

    let mut block = start.as_ptr();
    while let Some(current) = NonNull::new(block) {
      // Safety: `current` is a free block of the chain
      block = unsafe { FreeBlock::next(current.as_ptr()) };

      let mut span = pages.map_object_to_span(current.cast());
      let s = unsafe { span.as_mut() };
      debug_assert_eq!(s.block_size, size);
      assert!(s.in_use > 0, "block returned to a span with nothing lent out");

      unsafe { FreeBlock::set_next(current.as_ptr(), s.free_list) };
      s.free_list = current.as_ptr();
      s.in_use -= 1;

      if s.in_use == 0 {
        unsafe { bucket.erase(span) };
        s.reset();
        drop(bucket);

        // Safety: every block of the span is back and the span is unlisted
        unsafe { pages.release_span(span) };
        released += 1;

        bucket = self.buckets[class].lock();
      }
    }
    drop(bucket);

    if released > 0 {
      trace!("central cache: class {class} returned {released} idle spans to the page cache");
    }
  }

  #[cfg(test)]
  pub(crate) fn spans_in(&self, class: usize) -> usize {
    self.buckets[class].lock().len()
  }
}

/// Threads a fresh span's pages into a free list of `block_size` blocks, in address order.
///
/// # Safety
///
/// `span` must be owned by the caller, with `block_size` set, and no block in it may be in use.
unsafe fn carve(span: &mut Span) {
  let size = span.block_size;
  let count = span.capacity();
  debug_assert!(count > 0);

  let base = span.base().as_ptr();
  unsafe {
    let mut tail = base.cast::<FreeBlock>();
    for i in 1..count {
      let next = base.add(i * size).cast::<FreeBlock>();
      FreeBlock::set_next(tail, next);
      tail = next;
    }
    FreeBlock::set_next(tail, null_mut());
  }
  span.free_list = base.cast();
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{MAX_PAGES, PAGE_SIZE, size_class::num_move_page};

  fn chain(batch: &Batch) -> Vec<usize> {
    let mut out = Vec::new();
    let mut cur = batch.start.as_ptr();
    while !cur.is_null() {
      out.push(cur as usize);
      cur = unsafe { FreeBlock::next(cur) };
    }
    out
  }

  #[test]
  fn fetch_carves_one_span() {
    let pages = PageCache::new().unwrap();
    let central = CentralCache::new(&pages).unwrap();

    let size = 64;
    let class = size_class::index(size);
    let batch = central.fetch_range_obj(&pages, 10, size).unwrap();
    assert_eq!(batch.len, 10);
    let addrs = chain(&batch);
    assert_eq!(addrs.len(), 10);
    assert_eq!(*addrs.last().unwrap(), batch.end.as_ptr() as usize);
    // Carved in address order.
    assert!(addrs.windows(2).all(|w| w[1] - w[0] == size));
    assert_eq!(central.spans_in(class), 1);

    let span = pages.map_object_to_span(batch.start.cast());
    let s = unsafe { span.as_ref() };
    assert_eq!(s.in_use, 10);
    assert_eq!(s.block_size, size);
    assert_eq!(s.pages, num_move_page(size));
    assert!(s.owned);

    unsafe { central.release_list_to_spans(&pages, batch.start, size) };
    assert_eq!(central.spans_in(class), 0);
    assert_eq!(pages.stats().lent_pages(), 0);
  }

  #[test]
  fn short_span_yields_fewer_blocks() {
    let pages = PageCache::new().unwrap();
    let central = CentralCache::new(&pages).unwrap();

    // Largest class: two blocks per 64-page span.
    let size = size_class::class_size(NUM_CLASSES - 1);
    let per_span = num_move_page(size) * PAGE_SIZE / size;
    assert_eq!(per_span, 2);

    let first = central.fetch_range_obj(&pages, 5, size).unwrap();
    assert_eq!(first.len, per_span);
    let second = central.fetch_range_obj(&pages, 5, size).unwrap();
    assert_eq!(second.len, per_span);
    assert_ne!(
      pages.map_object_to_span(first.start.cast()),
      pages.map_object_to_span(second.start.cast())
    );
    assert_eq!(central.spans_in(size_class::index(size)), 2);

    unsafe {
      central.release_list_to_spans(&pages, first.start, size);
      central.release_list_to_spans(&pages, second.start, size);
    }
    assert_eq!(pages.stats().lent_pages(), 0);
    assert!(pages.stats().mapped_pages <= 2 * MAX_PAGES);
  }

  #[test]
  fn partial_return_keeps_span() {
    let pages = PageCache::new().unwrap();
    let central = CentralCache::new(&pages).unwrap();
    let size = 1024;
    let class = size_class::index(size);

    let a = central.fetch_range_obj(&pages, 4, size).unwrap();
    let b = central.fetch_range_obj(&pages, 4, size).unwrap();
    // Same span, consecutive blocks.
    assert_eq!(b.start.as_ptr() as usize, a.end.as_ptr() as usize + size);

    unsafe { central.release_list_to_spans(&pages, a.start, size) };
    assert_eq!(central.spans_in(class), 1);
    let span = pages.map_object_to_span(b.start.cast());
    assert_eq!(unsafe { span.as_ref() }.in_use, 4);

    unsafe { central.release_list_to_spans(&pages, b.start, size) };
    assert_eq!(central.spans_in(class), 0);
  }

  #[test]
  fn concurrent_classes_do_not_interfere() {
    let pages = PageCache::new().unwrap();
    let central = CentralCache::new(&pages).unwrap();

    std::thread::scope(|s| {
      for size in [16, 256, 4096, 32 * 1024] {
        let (pages, central) = (&pages, &central);
        s.spawn(move || {
          for _ in 0..200 {
            let batch = central.fetch_range_obj(pages, 8, size).unwrap();
            unsafe { central.release_list_to_spans(pages, batch.start, size) };
          }
        });
      }
    });
    assert_eq!(pages.stats().lent_pages(), 0);
  }
}
