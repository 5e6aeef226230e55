//! Page-id to span index: a three-level radix tree.
//!
//! Nodes are mapped directly from the OS and live until the map is dropped.
//! Slots are atomic so that lookups need no lock; all writers hold the
//! page-cache lock.

use core::{
  mem::size_of,
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicPtr, Ordering},
};

use crate::{PAGE_SHIFT, error::Result, os, size_class::pages_for, span::Span};

/// Usable virtual address bits.
const ADDRESS_BITS: usize = if usize::BITS == 64 { 48 } else { 32 };
const PAGE_ID_BITS: usize = ADDRESS_BITS - PAGE_SHIFT;

const LEAF_BITS: usize = 11;
const MID_BITS: usize = (PAGE_ID_BITS - LEAF_BITS) / 2;
const ROOT_BITS: usize = PAGE_ID_BITS - LEAF_BITS - MID_BITS;

const LEAF_LEN: usize = 1 << LEAF_BITS;
const MID_LEN: usize = 1 << MID_BITS;
const ROOT_LEN: usize = 1 << ROOT_BITS;

struct Leaf {
  spans: [AtomicPtr<Span>; LEAF_LEN],
}

struct Mid {
  leaves: [AtomicPtr<Leaf>; MID_LEN],
}

pub(crate) struct PageMap {
  root: NonNull<[AtomicPtr<Mid>; ROOT_LEN]>,
}

// All shared state is atomic; nodes are never freed while the map is shared.
unsafe impl Send for PageMap {}
unsafe impl Sync for PageMap {}

/// Maps a zeroed node. All-zero bytes are a valid array of null `AtomicPtr`s.
fn map_node<N>() -> Result<NonNull<N>> {
  Ok(os::acquire_pages(pages_for(size_of::<N>()))?.cast())
}

unsafe fn unmap_node<N>(node: NonNull<N>) {
  unsafe { os::release_pages(node.cast(), pages_for(size_of::<N>())) };
}

#[inline(always)]
fn split(page: usize) -> (usize, usize, usize) {
  assert!(page >> PAGE_ID_BITS == 0, "page {page:#x} beyond the address space");
  (
    page >> (LEAF_BITS + MID_BITS),
    (page >> LEAF_BITS) & (MID_LEN - 1),
    page & (LEAF_LEN - 1),
  )
}

impl PageMap {
  pub(crate) fn new() -> Result<Self> {
    Ok(Self { root: map_node()? })
  }

  fn root(&self) -> &[AtomicPtr<Mid>; ROOT_LEN] {
    // Safety: the root is mapped for the lifetime of `self`
    unsafe { self.root.as_ref() }
  }

  fn leaf(&self, page: usize) -> Option<(&Leaf, usize)> {
    let (r, m, l) = split(page);
    let mid = NonNull::new(self.root()[r].load(Ordering::Acquire))?;
    // Safety: published nodes live as long as the map
    let leaf = NonNull::new(unsafe { mid.as_ref() }.leaves[m].load(Ordering::Acquire))?;
    Some((unsafe { leaf.as_ref() }, l))
  }

  /// Span registered for `page`, if any.
  #[inline]
  pub(crate) fn get(&self, page: usize) -> Option<NonNull<Span>> {
    let (leaf, l) = self.leaf(page)?;
    NonNull::new(leaf.spans[l].load(Ordering::Acquire))
  }

  /// Creates the nodes covering `pages` pages from `first`, so that later
  /// [`PageMap::set`] calls on them cannot fail.
  pub(crate) fn ensure(&self, first: usize, pages: usize) -> Result<()> {
    let mut page = first;
    let end = first + pages;
    while page < end {
      let (r, m, _) = split(page);

      let slot = &self.root()[r];
      let mut mid = slot.load(Ordering::Acquire);
      if mid.is_null() {
        let node = map_node::<Mid>()?;
        mid = publish(slot, node);
      }

      // Safety: published nodes live as long as the map
      let slot = unsafe { &(*mid).leaves[m] };
      if slot.load(Ordering::Acquire).is_null() {
        let node = map_node::<Leaf>()?;
        publish(slot, node);
      }

      page = (page | (LEAF_LEN - 1)) + 1;
    }
    Ok(())
  }

  /// Registers `span` for `page`.
  ///
  /// # Panics
  ///
  /// Panics if the nodes for `page` were not created by [`PageMap::ensure`].
  #[inline]
  pub(crate) fn set(&self, page: usize, span: NonNull<Span>) {
    let Some((leaf, l)) = self.leaf(page) else {
      panic!("page {page:#x} registered without index nodes");
    };
    leaf.spans[l].store(span.as_ptr(), Ordering::Release);
  }

  pub(crate) fn clear(&self, page: usize) {
    if let Some((leaf, l)) = self.leaf(page) {
      leaf.spans[l].store(null_mut(), Ordering::Release);
    }
  }
}

/// Installs `node` in `slot`, discarding it if another writer won the race.
fn publish<N>(slot: &AtomicPtr<N>, node: NonNull<N>) -> *mut N {
  match slot.compare_exchange(null_mut(), node.as_ptr(), Ordering::AcqRel, Ordering::Acquire) {
    Ok(_) => node.as_ptr(),
    Err(current) => {
      unsafe { unmap_node(node) };
      current
    }
  }
}

impl Drop for PageMap {
  fn drop(&mut self) {
    for mid in self.root().iter() {
      let Some(mid) = NonNull::new(mid.load(Ordering::Relaxed)) else {
        continue;
      };
      // Safety: exclusive access, nodes were mapped by `ensure`
      unsafe {
        for leaf in mid.as_ref().leaves.iter() {
          if let Some(leaf) = NonNull::new(leaf.load(Ordering::Relaxed)) {
            unmap_node(leaf);
          }
        }
        unmap_node(mid);
      }
    }
    unsafe { unmap_node(self.root) };
  }
}
