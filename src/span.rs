//! Page-run descriptors and the intrusive lists that hold them.

use core::ptr::{NonNull, null_mut};

use crate::{PAGE_SHIFT, PAGE_SIZE, free_list::FreeBlock};

/// Descriptor of a contiguous run of pages.
///
/// Fields are guarded by whichever lock owns the list the span sits on:
/// the page-cache lock while free, the size class's bucket lock while carved.
pub(crate) struct Span {
  /// Page number (address >> `PAGE_SHIFT`) of the first page.
  pub(crate) page_id: usize,
  pub(crate) pages: usize,
  /// Size of the blocks the run is carved into, 0 while uncarved.
  pub(crate) block_size: usize,
  /// Free blocks inside the run.
  pub(crate) free_list: *mut FreeBlock,
  /// Blocks currently lent to thread caches.
  pub(crate) in_use: usize,
  /// True while handed out of the page cache.
  pub(crate) owned: bool,
  next: *mut Span,
  prev: *mut Span,
}

// Descriptors move between threads only under the lock of the list holding them.
unsafe impl Send for Span {}

impl Span {
  pub(crate) const fn new(page_id: usize, pages: usize) -> Self {
    Self {
      page_id,
      pages,
      block_size: 0,
      free_list: null_mut(),
      in_use: 0,
      owned: false,
      next: null_mut(),
      prev: null_mut(),
    }
  }

  #[inline]
  pub(crate) fn base(&self) -> NonNull<u8> {
    // Safety: page 0 is never mapped
    unsafe { NonNull::new_unchecked((self.page_id << PAGE_SHIFT) as *mut u8) }
  }

  #[inline]
  pub(crate) fn last_page(&self) -> usize {
    self.page_id + self.pages - 1
  }

  #[inline]
  pub(crate) fn bytes(&self) -> usize {
    self.pages * PAGE_SIZE
  }

  /// Number of blocks the run holds once carved.
  #[inline]
  pub(crate) fn capacity(&self) -> usize {
    debug_assert!(self.block_size > 0);
    self.bytes() / self.block_size
  }

  #[inline]
  pub(crate) fn is_linked(&self) -> bool {
    !self.next.is_null()
  }

  /// Forgets list links and carving, ready to return to the page cache.
  pub(crate) fn reset(&mut self) {
    self.free_list = null_mut();
    self.next = null_mut();
    self.prev = null_mut();
    self.in_use = 0;
  }
}

/// Circular doubly-linked list of spans around a permanent sentinel.
///
/// The list never allocates or frees descriptors; callers supply both the
/// sentinel and every linked span.
pub(crate) struct SpanList {
  head: NonNull<Span>,
}

// Spans are only reached through the lock guarding the list.
unsafe impl Send for SpanList {}

impl SpanList {
  /// # Safety
  ///
  /// `sentinel` must stay valid, and unused for anything else, for the life of the list.
  pub(crate) unsafe fn new(sentinel: NonNull<Span>) -> Self {
    let head = sentinel.as_ptr();
    unsafe {
      (*head).next = head;
      (*head).prev = head;
    }
    Self { head: sentinel }
  }

  #[cfg(test)]
  pub(crate) fn sentinel(&self) -> NonNull<Span> {
    self.head
  }

  #[inline]
  pub(crate) fn is_empty(&self) -> bool {
    // Safety: the sentinel lives as long as the list
    unsafe { (*self.head.as_ptr()).next == self.head.as_ptr() }
  }

  #[cfg(test)]
  pub(crate) fn len(&self) -> usize {
    self.iter().count()
  }

  #[inline]
  pub(crate) fn first(&self) -> Option<NonNull<Span>> {
    if self.is_empty() {
      None
    } else {
      // Safety: non-empty, so `next` is a linked span
      NonNull::new(unsafe { (*self.head.as_ptr()).next })
    }
  }

  /// # Safety
  ///
  /// `span` must be a valid, unlinked descriptor.
  #[inline]
  pub(crate) unsafe fn push_front(&mut self, span: NonNull<Span>) {
    unsafe {
      let first = NonNull::new_unchecked((*self.head.as_ptr()).next);
      self.insert(first, span);
    }
  }

  #[inline]
  pub(crate) fn pop_front(&mut self) -> Option<NonNull<Span>> {
    let span = self.first()?;
    // Safety: `span` is linked into this list
    unsafe { self.erase(span) };
    Some(span)
  }

  /// Links `span` immediately before `pos`.
  ///
  /// # Safety
  ///
  /// `pos` must be linked into this list (or be its sentinel), `span` must be unlinked.
  pub(crate) unsafe fn insert(&mut self, pos: NonNull<Span>, span: NonNull<Span>) {
    let (pos, span) = (pos.as_ptr(), span.as_ptr());
    unsafe {
      debug_assert!((*span).next.is_null() && (*span).prev.is_null());
      let prev = (*pos).prev;
      (*prev).next = span;
      (*span).prev = prev;
      (*span).next = pos;
      (*pos).prev = span;
    }
  }

  /// Unlinks `span`, leaving its descriptor alive.
  ///
  /// # Safety
  ///
  /// `span` must be linked into this list and must not be the sentinel.
  pub(crate) unsafe fn erase(&mut self, span: NonNull<Span>) {
    assert!(span != self.head, "erasing the sentinel");
    let span = span.as_ptr();
    unsafe {
      let prev = (*span).prev;
      let next = (*span).next;
      (*prev).next = next;
      (*next).prev = prev;
      (*span).next = null_mut();
      (*span).prev = null_mut();
    }
  }

  /// Iterates the linked spans front to back.
  ///
  /// The list must not be modified while the iterator is alive.
  pub(crate) fn iter(&self) -> Iter<'_> {
    Iter {
      // Safety: the sentinel lives as long as the list
      cur: unsafe { (*self.head.as_ptr()).next },
      list: self,
    }
  }
}

pub(crate) struct Iter<'a> {
  cur: *mut Span,
  list: &'a SpanList,
}

impl Iterator for Iter<'_> {
  type Item = NonNull<Span>;

  fn next(&mut self) -> Option<NonNull<Span>> {
    if self.cur == self.list.head.as_ptr() {
      return None;
    }
    let span = NonNull::new(self.cur)?;
    // Safety: linked spans stay valid while the list is borrowed
    self.cur = unsafe { (*self.cur).next };
    Some(span)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn spans(n: usize) -> Vec<Box<Span>> {
    (0..=n).map(|i| Box::new(Span::new(i + 1, 1))).collect()
  }

  fn ids(list: &SpanList) -> Vec<usize> {
    list.iter().map(|s| unsafe { s.as_ref().page_id }).collect()
  }

  #[test]
  fn push_pop_insert_erase() {
    let mut storage = spans(4);
    let ptrs: Vec<NonNull<Span>> = storage.iter_mut().map(|b| NonNull::from(&mut **b)).collect();

    let mut list = unsafe { SpanList::new(ptrs[0]) };
    assert!(list.is_empty());
    assert!(list.pop_front().is_none());

    unsafe {
      list.push_front(ptrs[1]);
      list.push_front(ptrs[2]);
    }
    assert_eq!(ids(&list), vec![3, 2]);

    // Insert before the sentinel appends.
    unsafe { list.insert(list.sentinel(), ptrs[3]) };
    unsafe { list.insert(ptrs[2], ptrs[4]) };
    assert_eq!(ids(&list), vec![5, 3, 2, 4]);
    assert_eq!(list.len(), 4);

    unsafe { list.erase(ptrs[1]) };
    assert!(!unsafe { ptrs[1].as_ref() }.is_linked());
    assert_eq!(ids(&list), vec![5, 3, 4]);

    assert_eq!(list.pop_front(), Some(ptrs[4]));
    assert_eq!(list.pop_front(), Some(ptrs[2]));
    assert_eq!(list.pop_front(), Some(ptrs[3]));
    assert!(list.is_empty());
    assert_eq!(list.len(), 0);
  }

  #[test]
  fn geometry() {
    let mut span = Span::new(10, 3);
    assert_eq!(span.base().as_ptr() as usize, 10 * PAGE_SIZE);
    assert_eq!(span.last_page(), 12);
    span.block_size = 1000;
    assert_eq!(span.capacity(), 3 * PAGE_SIZE / 1000);
  }
}
