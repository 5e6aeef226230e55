//! Per-thread free lists: the lock-free fast path for small and medium blocks.

use core::ptr::NonNull;

use log::trace;

use crate::{
  MAX_BYTES, NUM_CLASSES,
  central_cache::CentralCache,
  error::Result,
  free_list::{Batch, FreeBlock, FreeList},
  page_cache::PageCache,
  size_class,
};

/// One free list per size class, owned by a single thread.
pub(crate) struct ThreadCache {
  lists: [FreeList; NUM_CLASSES],
}

impl ThreadCache {
  pub(crate) const fn new() -> Self {
    Self {
      lists: [const { FreeList::new() }; NUM_CLASSES],
    }
  }

  /// Hands out a block of at least `size` bytes, `0 < size <= MAX_BYTES`.
  #[inline]
  pub(crate) fn allocate(&mut self, central: &CentralCache, pages: &PageCache, size: usize) -> Result<NonNull<u8>> {
    debug_assert!(size > 0 && size <= MAX_BYTES);

    let class = size_class::index(size);
    let list = &mut self.lists[class];
    if !list.is_empty() {
      return Ok(list.pop());
    }
    self.fetch_from_central(central, pages, class)
  }

  /// Refills an empty list with a slow-start sized batch and returns its first block.
  #[cold]
  fn fetch_from_central(&mut self, central: &CentralCache, pages: &PageCache, class: usize) -> Result<NonNull<u8>> {
    let size = size_class::class_size(class);
    let list = &mut self.lists[class];

    let batch = list.max_size().min(size_class::num_move_size(size));
    if batch == list.max_size() {
      // Grows even when the central cache hands back fewer blocks.
      list.grow_max_size();
    }

    let Batch { start, end, len } = central.fetch_range_obj(pages, batch, size)?;
    debug_assert!(len >= 1 && len <= batch);

    if len > 1 {
      // Safety: the chain holds `len` linked blocks
      let second = unsafe { FreeBlock::next(start.as_ptr()) };
      let Some(second) = NonNull::new(second) else {
        panic!("central cache chain shorter than reported");
      };
      unsafe {
        list.push_batch(Batch {
          start: second,
          end,
          len: len - 1,
        })
      };
    }
    Ok(start.cast())
  }

  /// Takes back a block of `size` bytes, returning a full quota to the central cache.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live block of `size`'s class handed out by a thread cache
  /// of the same heap.
  #[inline]
  pub(crate) unsafe fn deallocate(&mut self, central: &CentralCache, pages: &PageCache, ptr: NonNull<u8>, size: usize) {
    debug_assert!(size > 0 && size <= MAX_BYTES);

    let class = size_class::index(size);
    let list = &mut self.lists[class];
    unsafe { list.push(ptr) };
    if list.len() >= list.max_size() {
      self.list_too_long(central, pages, class);
    }
  }

  #[cold]
  fn list_too_long(&mut self, central: &CentralCache, pages: &PageCache, class: usize) {
    let list = &mut self.lists[class];
    let batch = list.pop_batch(list.max_size());
    // Safety: every block on a thread-cache list was handed out by `central` and is free
    unsafe { central.release_list_to_spans(pages, batch.start, size_class::class_size(class)) };
  }

  /// Returns every cached block to the central cache.
  pub(crate) fn flush(&mut self, central: &CentralCache, pages: &PageCache) {
    let mut blocks = 0;
    for (class, list) in self.lists.iter_mut().enumerate() {
      if list.is_empty() {
        continue;
      }
      let batch = list.pop_batch(list.len());
      blocks += batch.len;
      // Safety: as in `list_too_long`
      unsafe { central.release_list_to_spans(pages, batch.start, size_class::class_size(class)) };
    }
    if blocks > 0 {
      trace!("thread cache: flushed {blocks} blocks");
    }
  }

  #[cfg(test)]
  fn list(&self, size: usize) -> &FreeList {
    &self.lists[size_class::index(size)]
  }
}
