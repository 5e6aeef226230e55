//! Page-run allocator: splits larger runs on demand and coalesces
//! page-adjacent free runs on release.

use core::{array, ptr::NonNull};

use log::{debug, trace};

use crate::{
  MAX_PAGES, PAGE_SHIFT,
  error::Result,
  os,
  page_map::PageMap,
  pool::ObjectPool,
  span::{Span, SpanList},
  sync::{SpinGuard, SpinMutex},
};

/// Page counts held by a page cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageStats {
  /// Pages mapped from the OS for pooling. Never decreases while the heap lives.
  pub mapped_pages: usize,
  /// Pooled pages sitting free in the page cache.
  pub idle_pages: usize,
  /// Pages of live runs larger than [`MAX_PAGES`], mapped and unmapped one by one.
  pub oversized_pages: usize,
}

impl PageStats {
  /// Pages currently handed out to the central cache or to large allocations.
  pub fn lent_pages(&self) -> usize {
    self.mapped_pages - self.idle_pages + self.oversized_pages
  }
}

/// Everything guarded by the page-cache lock.
struct PageHeap {
  /// Free spans by page count; slot 0 is unused.
  buckets: [SpanList; MAX_PAGES + 1],
  /// One record per OS mapping backing the buckets.
  regions: SpanList,
  stats: PageStats,
}

pub(crate) struct PageCache {
  heap: SpinMutex<PageHeap>,
  /// Read without the lock, written with it.
  map: PageMap,
  /// Descriptor pool, behind its own lock. Only taken while `heap` is held
  /// or during construction.
  spans: SpinMutex<ObjectPool<Span>>,
}

impl PageCache {
  pub(crate) fn new() -> Result<Self> {
    let mut spans = ObjectPool::new();
    let mut sentinel = || spans.new_object(Span::new(0, 0));

    let mut heads = [NonNull::dangling(); MAX_PAGES + 2];
    for head in heads.iter_mut() {
      *head = sentinel()?;
    }
    // Safety: each sentinel is fresh and used by exactly one list
    let buckets = array::from_fn(|i| unsafe { SpanList::new(heads[i]) });
    let regions = unsafe { SpanList::new(heads[MAX_PAGES + 1]) };

    Ok(Self {
      heap: SpinMutex::new(PageHeap {
        buckets,
        regions,
        stats: PageStats::default(),
      }),
      map: PageMap::new()?,
      spans: SpinMutex::new(spans),
    })
  }

  pub(crate) fn stats(&self) -> PageStats {
    self.heap.lock().stats
  }

  /// Sentinel descriptor for a list owned by another tier.
  pub(crate) fn new_sentinel(&self) -> Result<NonNull<Span>> {
    self.spans.lock().new_object(Span::new(0, 0))
  }

  fn new_descriptor(&self, page_id: usize, pages: usize) -> Result<NonNull<Span>> {
    self.spans.lock().new_object(Span::new(page_id, pages))
  }

  unsafe fn delete_descriptor(&self, span: NonNull<Span>) {
    unsafe { self.spans.lock().delete(span) };
  }

  /// Hands out a run of `k` pages, marked owned.
  ///
  /// Runs up to [`MAX_PAGES`] have every page registered in the index so
  /// that any block inside can be traced back; larger runs come straight
  /// from the OS and only their first page is registered.
  pub(crate) fn new_span(&self, k: usize) -> Result<NonNull<Span>> {
    assert!(k > 0, "empty page run requested");

    if k > MAX_PAGES {
      let span = self.new_oversized(k)?;
      trace!("page cache: mapped oversized run of {k} pages at {:p}", unsafe { span.as_ref() }.base());
      return Ok(span);
    }

    let mut heap = self.heap.lock();
    if let Some(span) = self.take(&mut heap, k)? {
      return Ok(span);
    }

    self.refill(&mut heap)?;
    let Some(span) = self.take(&mut heap, k)? else {
      panic!("page cache refill did not satisfy a {k}-page request");
    };
    drop(heap);

    debug!("page cache: mapped {MAX_PAGES} pages from the OS to serve {k}");
    Ok(span)
  }

  fn new_oversized(&self, k: usize) -> Result<NonNull<Span>> {
    let mut heap = self.heap.lock();
    let base = os::acquire_pages(k)?;
    let page_id = base.as_ptr() as usize >> PAGE_SHIFT;

    let registered = self
      .map
      .ensure(page_id, 1)
      .and_then(|()| self.new_descriptor(page_id, k));
    let mut span = match registered {
      Ok(span) => span,
      Err(err) => {
        unsafe { os::release_pages(base, k) };
        return Err(err);
      }
    };

    unsafe { span.as_mut() }.owned = true;
    self.map.set(page_id, span);
    heap.stats.oversized_pages += k;
    Ok(span)
  }

  /// Pops a run of exactly `k` pages, splitting a larger free run if needed.
  fn take(&self, heap: &mut SpinGuard<'_, PageHeap>, k: usize) -> Result<Option<NonNull<Span>>> {
    if let Some(mut span) = heap.buckets[k].pop_front() {
      let s = unsafe { span.as_mut() };
      s.owned = true;
      heap.stats.idle_pages -= k;
      self.register_all(span);
      return Ok(Some(span));
    }

    let Some(n) = (k + 1..=MAX_PAGES).find(|&n| !heap.buckets[n].is_empty()) else {
      return Ok(None);
    };

    let Some(mut rest) = heap.buckets[n].pop_front() else {
      return Ok(None);
    };
    let mut piece = match self.new_descriptor(unsafe { rest.as_ref() }.page_id, k) {
      Ok(piece) => piece,
      Err(err) => {
        unsafe { heap.buckets[n].push_front(rest) };
        return Err(err);
      }
    };

    let r = unsafe { rest.as_mut() };
    r.page_id += k;
    r.pages -= k;
    unsafe { heap.buckets[r.pages].push_front(rest) };
    self.register_edges(rest);

    unsafe { piece.as_mut() }.owned = true;
    heap.stats.idle_pages -= k;
    self.register_all(piece);
    Ok(Some(piece))
  }

  /// Maps [`MAX_PAGES`] fresh pages into the largest bucket.
  fn refill(&self, heap: &mut SpinGuard<'_, PageHeap>) -> Result<()> {
    let base = os::acquire_pages(MAX_PAGES)?;
    let page_id = base.as_ptr() as usize >> PAGE_SHIFT;

    let descriptors = self.map.ensure(page_id, MAX_PAGES).and_then(|()| {
      let span = self.new_descriptor(page_id, MAX_PAGES)?;
      match self.new_descriptor(page_id, MAX_PAGES) {
        Ok(region) => Ok((span, region)),
        Err(err) => {
          unsafe { self.delete_descriptor(span) };
          Err(err)
        }
      }
    });
    let (span, region) = match descriptors {
      Ok(pair) => pair,
      Err(err) => {
        unsafe { os::release_pages(base, MAX_PAGES) };
        return Err(err);
      }
    };

    unsafe {
      heap.regions.push_front(region);
      heap.buckets[MAX_PAGES].push_front(span);
    }
    self.register_edges(span);
    heap.stats.mapped_pages += MAX_PAGES;
    heap.stats.idle_pages += MAX_PAGES;
    Ok(())
  }

  fn register_all(&self, span: NonNull<Span>) {
    let s = unsafe { span.as_ref() };
    for page in s.page_id..s.page_id + s.pages {
      self.map.set(page, span);
    }
  }

  /// Registers only the first and last page, enough to find the run from either neighbour.
  fn register_edges(&self, span: NonNull<Span>) {
    let s = unsafe { span.as_ref() };
    self.map.set(s.page_id, span);
    self.map.set(s.last_page(), span);
  }

  /// Span owning the page `ptr` points into.
  ///
  /// # Panics
  ///
  /// Panics if no span is registered for the page, which means `ptr` was
  /// never handed out by this heap or was already released.
  #[inline]
  pub(crate) fn map_object_to_span(&self, ptr: NonNull<u8>) -> NonNull<Span> {
    let page = ptr.as_ptr() as usize >> PAGE_SHIFT;
    match self.map.get(page) {
      Some(span) => span,
      None => panic!("no span owns {ptr:p}"),
    }
  }

  /// Takes back a run handed out by [`PageCache::new_span`].
  ///
  /// # Safety
  ///
  /// `span` must be owned, detached from every list, and no block inside it may be used again.
  pub(crate) unsafe fn release_span(&self, span: NonNull<Span>) {
    let (pages, base) = {
      let s = unsafe { span.as_ref() };
      assert!(s.owned, "releasing a span that is already free");
      debug_assert!(!s.is_linked());
      (s.pages, s.base())
    };

    if pages > MAX_PAGES {
      let mut heap = self.heap.lock();
      self.map.clear(base.as_ptr() as usize >> PAGE_SHIFT);
      unsafe {
        os::release_pages(base, pages);
        self.delete_descriptor(span);
      }
      heap.stats.oversized_pages -= pages;
      drop(heap);

      trace!("page cache: unmapped oversized run of {pages} pages at {base:p}");
      return;
    }

    #[cfg(feature = "release-mem")]
    unsafe {
      os::discard_pages(base, pages)
    };

    let mut heap = self.heap.lock();
    let merged = unsafe { self.coalesce(&mut heap, span) };

    let s = unsafe { &mut *span.as_ptr() };
    s.owned = false;
    s.block_size = 0;
    s.reset();
    let total = s.pages;
    unsafe { heap.buckets[total].push_front(span) };
    heap.stats.idle_pages += total;
    self.register_edges(span);
    drop(heap);

    if merged > 0 {
      trace!("page cache: merged {merged} neighbours into a {total}-page run");
    }
  }

  /// Absorbs free neighbours, left then right, while the result fits in a bucket.
  /// Returns the number of neighbours absorbed.
  ///
  /// Interior index entries of free runs may be stale; only the edges of
  /// free runs are ever consulted.
  unsafe fn coalesce(&self, heap: &mut SpinGuard<'_, PageHeap>, span: NonNull<Span>) -> usize {
    let s = unsafe { &mut *span.as_ptr() };
    let mut merged = 0;

    while let Some(left) = s.page_id.checked_sub(1).and_then(|page| self.map.get(page)) {
      if unsafe { is_owned(left) } {
        break;
      }
      let l = unsafe { left.as_ref() };
      if l.pages + s.pages > MAX_PAGES {
        break;
      }
      s.page_id = l.page_id;
      s.pages += l.pages;
      unsafe {
        heap.buckets[l.pages].erase(left);
        heap.stats.idle_pages -= l.pages;
        self.delete_descriptor(left);
      }
      merged += 1;
    }

    while let Some(right) = self.map.get(s.page_id + s.pages) {
      if unsafe { is_owned(right) } {
        break;
      }
      let r = unsafe { right.as_ref() };
      if r.pages + s.pages > MAX_PAGES {
        break;
      }
      s.pages += r.pages;
      unsafe {
        heap.buckets[r.pages].erase(right);
        heap.stats.idle_pages -= r.pages;
        self.delete_descriptor(right);
      }
      merged += 1;
    }

    merged
  }

  #[cfg(test)]
  fn bucket_len(&self, pages: usize) -> usize {
    self.heap.lock().buckets[pages].len()
  }
}

/// Reads the flag without borrowing the descriptor, which the central cache
/// may be mutating while the span is owned.
///
/// # Safety
///
/// `span` must be a live descriptor and the page-cache lock must be held.
#[inline]
unsafe fn is_owned(span: NonNull<Span>) -> bool {
  unsafe { (*span.as_ptr()).owned }
}

impl Drop for PageCache {
  /// Unmaps every pooled region. Oversized runs still alive are leaked.
  fn drop(&mut self) {
    let heap = self.heap.get_mut();
    for region in heap.regions.iter() {
      let r = unsafe { region.as_ref() };
      unsafe { os::release_pages(r.base(), r.pages) };
    }
  }
}
