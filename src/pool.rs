//! Fixed-size object pool for the allocator's own metadata.
//!
//! Span descriptors and thread caches must not come from the allocator they
//! describe, so they are carved from slabs mapped straight from the OS. This
//! is the one place that constructs and destroys values in uninitialized
//! memory by hand.

use core::{
  marker::PhantomData,
  mem::{align_of, size_of},
  ptr::{self, NonNull, null_mut},
};

use crate::{
  PAGE_SIZE,
  error::Result,
  free_list::FreeBlock,
  os,
  size_class::{align_up, pages_for},
};

/// Bytes requested from the OS each time the current slab runs out.
const SLAB_SIZE: usize = 128 * 1024;

/// Header at the start of every slab, chaining all slabs for release.
struct SlabHeader {
  prev: *mut SlabHeader,
  pages: usize,
}

/// Arena of `T`-sized blocks with free-list reuse.
///
/// Not synchronized: a pool shared between threads sits behind its own lock.
pub(crate) struct ObjectPool<T> {
  /// Bump cursor inside the current slab.
  cursor: *mut u8,
  remaining: usize,
  /// Blocks returned by [`ObjectPool::delete`].
  free: *mut FreeBlock,
  slabs: *mut SlabHeader,
  live: usize,
  _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for ObjectPool<T> {}

impl<T> ObjectPool<T> {
  /// Every block can hold either a `T` or a free-list link.
  const STRIDE: usize = align_up(
    if size_of::<T>() > size_of::<FreeBlock>() {
      size_of::<T>()
    } else {
      size_of::<FreeBlock>()
    },
    if align_of::<T>() > align_of::<FreeBlock>() {
      align_of::<T>()
    } else {
      align_of::<FreeBlock>()
    },
  );
  const HEADER: usize = align_up(size_of::<SlabHeader>(), align_of::<T>());
  const _ALIGN_OK: () = assert!(align_of::<T>() <= PAGE_SIZE);

  pub(crate) const fn new() -> Self {
    Self {
      cursor: null_mut(),
      remaining: 0,
      free: null_mut(),
      slabs: null_mut(),
      live: 0,
      _marker: PhantomData,
    }
  }

  /// Objects handed out and not yet deleted.
  pub(crate) fn live(&self) -> usize {
    self.live
  }

  /// Moves `value` into a pooled block.
  pub(crate) fn new_object(&mut self, value: T) -> Result<NonNull<T>> {
    #[allow(clippy::let_unit_value)]
    let () = Self::_ALIGN_OK;

    let block = match NonNull::new(self.free) {
      Some(block) => {
        // Safety: blocks on the free list are unused and hold a link
        self.free = unsafe { FreeBlock::next(block.as_ptr()) };
        block.cast::<T>()
      }
      None => self.carve()?,
    };

    // Safety: `block` is sized and aligned for `T` and unused
    unsafe { ptr::write(block.as_ptr(), value) };
    self.live += 1;
    Ok(block)
  }

  /// Drops the object and recycles its block.
  ///
  /// # Safety
  ///
  /// `obj` must come from [`ObjectPool::new_object`] on this pool and must not be used afterwards.
  pub(crate) unsafe fn delete(&mut self, obj: NonNull<T>) {
    unsafe { ptr::drop_in_place(obj.as_ptr()) };
    let block = obj.as_ptr().cast::<FreeBlock>();
    unsafe { FreeBlock::set_next(block, self.free) };
    self.free = block;
    self.live -= 1;
  }

  fn carve(&mut self) -> Result<NonNull<T>> {
    if self.remaining < Self::STRIDE {
      self.refill()?;
    }
    // Safety: the slab has room for one more block
    let block = unsafe { NonNull::new_unchecked(self.cursor.cast::<T>()) };
    self.cursor = unsafe { self.cursor.add(Self::STRIDE) };
    self.remaining -= Self::STRIDE;
    Ok(block)
  }

  /// Abandons the rest of the current slab and maps a new one.
  fn refill(&mut self) -> Result<()> {
    let bytes = (Self::HEADER + Self::STRIDE).max(SLAB_SIZE);
    let pages = pages_for(bytes);
    let slab = os::acquire_pages(pages)?;

    let header = slab.as_ptr().cast::<SlabHeader>();
    // Safety: fresh mapping, page aligned
    unsafe {
      header.write(SlabHeader {
        prev: self.slabs,
        pages,
      });
      self.cursor = slab.as_ptr().add(Self::HEADER);
    }
    self.slabs = header;
    self.remaining = pages * PAGE_SIZE - Self::HEADER;
    Ok(())
  }
}

impl<T> Drop for ObjectPool<T> {
  /// Unmaps every slab. Objects still alive are not dropped.
  fn drop(&mut self) {
    let mut slab = self.slabs;
    while let Some(header) = NonNull::new(slab) {
      // Safety: every slab starts with a header written by `refill`
      unsafe {
        let SlabHeader { prev, pages } = header.as_ptr().read();
        os::release_pages(header.cast(), pages);
        slab = prev;
      }
    }
  }
}
