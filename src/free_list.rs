//! Singly-linked lists of free blocks, threaded through the blocks themselves.
//!
//! This module and the span carving in `central_cache` are the only places
//! that reinterpret raw block memory as a link field.

use core::ptr::{NonNull, null_mut};

/// The first machine word of a free block, holding the next free block.
#[repr(C)]
pub(crate) struct FreeBlock {
  next: *mut FreeBlock,
}

impl FreeBlock {
  /// Reinterprets the start of an untyped block as a link.
  #[inline(always)]
  pub(crate) fn from_raw(ptr: NonNull<u8>) -> *mut FreeBlock {
    ptr.as_ptr().cast()
  }

  /// # Safety
  ///
  /// `block` must point to a free block at least one word long.
  #[inline(always)]
  pub(crate) unsafe fn next(block: *mut FreeBlock) -> *mut FreeBlock {
    unsafe { (*block).next }
  }

  /// # Safety
  ///
  /// `block` must point to a free block at least one word long that nobody else accesses.
  #[inline(always)]
  pub(crate) unsafe fn set_next(block: *mut FreeBlock, next: *mut FreeBlock) {
    unsafe { (*block).next = next };
  }
}

/// A detached chain `start ..= end` of `len` blocks, `end.next == null`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Batch {
  pub(crate) start: NonNull<FreeBlock>,
  pub(crate) end: NonNull<FreeBlock>,
  pub(crate) len: usize,
}

/// Per-class stack of free blocks owned by a thread cache.
pub(crate) struct FreeList {
  head: *mut FreeBlock,
  len: usize,
  /// Slow-start quota: refill batch size and flush threshold.
  max_size: usize,
}

// Blocks are owned by whichever thread owns the list.
unsafe impl Send for FreeList {}

impl FreeList {
  pub(crate) const fn new() -> Self {
    Self {
      head: null_mut(),
      len: 0,
      max_size: 1,
    }
  }

  #[inline]
  pub(crate) fn is_empty(&self) -> bool {
    self.head.is_null()
  }

  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub(crate) fn max_size(&self) -> usize {
    self.max_size
  }

  #[inline]
  pub(crate) fn grow_max_size(&mut self) {
    self.max_size += 1;
  }

  /// # Safety
  ///
  /// `block` must be a free block of this list's class, not present in any list.
  #[inline]
  pub(crate) unsafe fn push(&mut self, block: NonNull<u8>) {
    let block = FreeBlock::from_raw(block);
    unsafe { FreeBlock::set_next(block, self.head) };
    self.head = block;
    self.len += 1;
  }

  #[inline]
  pub(crate) fn pop(&mut self) -> NonNull<u8> {
    let Some(block) = NonNull::new(self.head) else {
      panic!("pop from an empty free list");
    };
    // Safety: every block on the list is free and at least one word long
    self.head = unsafe { FreeBlock::next(block.as_ptr()) };
    self.len -= 1;
    block.cast()
  }

  /// Prepends a detached chain.
  ///
  /// # Safety
  ///
  /// The chain must consist of `batch.len` free blocks of this list's class.
  pub(crate) unsafe fn push_batch(&mut self, batch: Batch) {
    unsafe { FreeBlock::set_next(batch.end.as_ptr(), self.head) };
    self.head = batch.start.as_ptr();
    self.len += batch.len;
  }

  /// Detaches the first `n` blocks.
  pub(crate) fn pop_batch(&mut self, n: usize) -> Batch {
    assert!(n > 0 && n <= self.len, "popping {n} of {} blocks", self.len);

    let Some(start) = NonNull::new(self.head) else {
      panic!("free list length out of sync");
    };
    let mut end = start;
    // Safety: the list holds at least `n` blocks
    unsafe {
      for _ in 1..n {
        end = NonNull::new_unchecked(FreeBlock::next(end.as_ptr()));
      }
      self.head = FreeBlock::next(end.as_ptr());
      FreeBlock::set_next(end.as_ptr(), null_mut());
    }
    self.len -= n;
    Batch { start, end, len: n }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn stack_order_and_batches() {
    let mut storage = [[0usize; 2]; 6];
    let blocks: Vec<NonNull<u8>> = storage
      .iter_mut()
      .map(|b| NonNull::from(b).cast())
      .collect();

    let mut list = FreeList::new();
    assert!(list.is_empty());
    for &b in &blocks {
      unsafe { list.push(b) };
    }
    assert_eq!(list.len(), 6);
    assert_eq!(list.pop(), blocks[5]);

    let batch = list.pop_batch(3);
    assert_eq!(batch.len, 3);
    assert_eq!(batch.start.cast(), blocks[4]);
    assert_eq!(batch.end.cast(), blocks[2]);
    assert!(unsafe { FreeBlock::next(batch.end.as_ptr()) }.is_null());
    assert_eq!(list.len(), 2);

    unsafe { list.push_batch(batch) };
    assert_eq!(list.len(), 5);
    let order: Vec<_> = (0..5).map(|_| list.pop()).collect();
    assert_eq!(order, vec![blocks[4], blocks[3], blocks[2], blocks[1], blocks[0]]);
    assert!(list.is_empty());
  }

  #[test]
  #[should_panic(expected = "empty free list")]
  fn pop_empty_is_fatal() {
    FreeList::new().pop();
  }

  #[test]
  fn slow_start_quota_starts_at_one() {
    let mut list = FreeList::new();
    assert_eq!(list.max_size(), 1);
    list.grow_max_size();
    assert_eq!(list.max_size(), 2);
  }
}
