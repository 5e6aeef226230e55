//! A self-contained allocator instance and the per-thread handles onto it.

use core::{
  marker::PhantomData,
  ptr::{NonNull, null_mut},
};

use log::debug;

use crate::{
  MAX_BYTES, PAGE_SIZE,
  central_cache::CentralCache,
  error::{AllocError, Result},
  free_list::FreeBlock,
  page_cache::{PageCache, PageStats},
  pool::ObjectPool,
  size_class,
  sync::SpinMutex,
  thread_cache::ThreadCache,
};

/// Page cache, central cache and the pool of thread caches sharing them.
///
/// Memory handed out by a heap is returned to the OS when the heap is dropped.
/// Blocks must be freed through a handle (or the uncached path) of the heap
/// that produced them.
pub struct Heap {
  // Dropped in declaration order: descriptors and sentinels live in `pages`.
  caches: SpinMutex<ObjectPool<ThreadCache>>,
  central: CentralCache,
  pages: PageCache,
}

impl Heap {
  /// Builds an empty heap. Pages are mapped on first use; nothing is logged
  /// here, so the process heap can be created from inside the allocator.
  pub fn new() -> Result<Self> {
    let pages = PageCache::new()?;
    let central = CentralCache::new(&pages)?;
    Ok(Self {
      caches: SpinMutex::new(ObjectPool::new()),
      central,
      pages,
    })
  }

  /// Creates a thread cache bound to this heap.
  pub fn handle(&self) -> Result<Handle<'_>> {
    let cache = self.caches.lock().new_object(ThreadCache::new())?;
    Ok(Handle {
      heap: self,
      cache,
      _not_send: PhantomData,
    })
  }

  /// Page accounting snapshot.
  pub fn stats(&self) -> PageStats {
    self.pages.stats()
  }

  /// Thread caches currently alive.
  pub fn handles(&self) -> usize {
    self.caches.lock().live()
  }

  /// Serves `size > MAX_BYTES` with a dedicated page run.
  fn allocate_large(&self, size: usize) -> Result<NonNull<u8>> {
    if size > usize::MAX - (PAGE_SIZE - 1) {
      return Err(AllocError::TooLarge { size });
    }
    let k = size_class::pages_for(size);
    let mut span = self.pages.new_span(k)?;
    // Safety: the run is owned and reachable only through the returned pointer
    let s = unsafe { span.as_mut() };
    s.block_size = size;
    Ok(s.base())
  }

  /// Allocates without a thread cache, moving one block from the central cache.
  pub fn allocate_uncached(&self, size: usize) -> Result<NonNull<u8>> {
    let size = size.max(1);
    if size > MAX_BYTES {
      return self.allocate_large(size);
    }
    let batch = self.central.fetch_range_obj(&self.pages, 1, size_class::round_up(size))?;
    debug_assert_eq!(batch.len, 1);
    Ok(batch.start.cast())
  }

  /// Frees a block from any thread without touching a thread cache.
  ///
  /// # Safety
  ///
  /// `ptr` must be live and come from this heap.
  pub unsafe fn free_uncached(&self, ptr: NonNull<u8>) {
    let size = self.block_size(ptr);
    if size > MAX_BYTES {
      unsafe { self.free_large(ptr) };
      return;
    }
    let block = FreeBlock::from_raw(ptr);
    unsafe {
      FreeBlock::set_next(block, null_mut());
      self.central.release_list_to_spans(&self.pages, NonNull::new_unchecked(block), size);
    }
  }

  unsafe fn free_large(&self, ptr: NonNull<u8>) {
    let span = self.pages.map_object_to_span(ptr);
    debug_assert_eq!(unsafe { span.as_ref() }.base(), ptr);
    unsafe { self.pages.release_span(span) };
  }

  /// Size recorded for the span owning `ptr`: the class size for small
  /// blocks, the requested size for large ones.
  fn block_size(&self, ptr: NonNull<u8>) -> usize {
    let span = self.pages.map_object_to_span(ptr);
    // Safety: `block_size` is fixed while the span is lent out
    unsafe { span.as_ref() }.block_size
  }

  /// Bytes usable at `ptr`.
  ///
  /// # Safety
  ///
  /// `ptr` must be live and come from this heap.
  pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
    let span = self.pages.map_object_to_span(ptr);
    let s = unsafe { span.as_ref() };
    if s.block_size > MAX_BYTES { s.bytes() } else { s.block_size }
  }
}

impl Drop for Heap {
  fn drop(&mut self) {
    let stats = self.pages.stats();
    debug!(
      "heap: dropping with {} of {} pooled pages lent out, {} oversized pages",
      stats.lent_pages(),
      stats.mapped_pages,
      stats.oversized_pages
    );
    debug_assert_eq!(self.caches.get_mut().live(), 0);
  }
}

/// A thread's access path to a [`Heap`].
///
/// Owns one thread cache; dropping the handle returns every cached block to the
/// heap. Blocks may be freed through any handle of the same heap.
pub struct Handle<'h> {
  heap: &'h Heap,
  cache: NonNull<ThreadCache>,
  _not_send: PhantomData<*mut ()>,
}

impl<'h> Handle<'h> {
  pub fn heap(&self) -> &'h Heap {
    self.heap
  }

  fn cache(&mut self) -> &mut ThreadCache {
    // Safety: the cache is owned by this handle, and `&mut self` keeps it unique
    unsafe { self.cache.as_mut() }
  }

  /// Allocates at least `size` bytes. A zero size is treated as one byte.
  pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
    let size = size.max(1);
    let heap = self.heap;
    if size > MAX_BYTES {
      return heap.allocate_large(size);
    }
    self.cache().allocate(&heap.central, &heap.pages, size)
  }

  /// Frees a block, recovering its size from the page index.
  ///
  /// # Safety
  ///
  /// `ptr` must come from an allocation on this heap and must not be used
  /// or freed again.
  pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
    let heap = self.heap;
    let size = heap.block_size(ptr);
    if size > MAX_BYTES {
      unsafe { heap.free_large(ptr) };
      return;
    }
    unsafe { self.cache().deallocate(&heap.central, &heap.pages, ptr, size) };
  }

  /// Returns every cached block to the central cache.
  pub fn flush(&mut self) {
    let heap = self.heap;
    self.cache().flush(&heap.central, &heap.pages);
  }
}

impl Drop for Handle<'_> {
  fn drop(&mut self) {
    self.flush();
    // Safety: the cache came from this heap's pool and is not used again
    unsafe { self.heap.caches.lock().delete(self.cache) };
  }
}
