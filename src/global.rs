//! The process heap: free functions, the `GlobalAlloc` adapter and the C API.

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::{Cell, RefCell},
  ptr::{self, NonNull, null_mut},
};
use std::sync::OnceLock;

use crate::{
  MAX_BYTES, PAGE_SIZE,
  error::Result,
  heap::{Handle, Heap},
  size_class,
};

static HEAP: OnceLock<Heap> = OnceLock::new();

// =============================================================================
// TLS
// =============================================================================

thread_local! {
  static HANDLE: RefCell<Option<Handle<'static>>> = const { RefCell::new(None) };
  static IN_ALLOC: Cell<bool> = const { Cell::new(false) };
}

fn heap() -> Result<&'static Heap> {
  if let Some(heap) = HEAP.get() {
    return Ok(heap);
  }
  // A heap built by a losing thread is dropped here.
  let heap = Heap::new()?;
  Ok(HEAP.get_or_init(|| heap))
}

/// Marks the thread as inside the allocator until dropped.
struct Entered;

impl Entered {
  fn enter() -> Option<Self> {
    let first = IN_ALLOC.try_with(|flag| !flag.replace(true)).ok()?;
    // Only the outermost guard may clear the flag.
    first.then(|| Entered)
  }
}

impl Drop for Entered {
  fn drop(&mut self) {
    let _ = IN_ALLOC.try_with(|flag| flag.set(false));
  }
}

/// Runs `f` on this thread's handle, creating it on first use.
///
/// Returns `None` when the thread is already inside the allocator (a logger
/// or the TLS machinery allocating) or its handle has been torn down; callers
/// then take the uncached path.
fn with_handle<R>(heap: &'static Heap, f: impl FnOnce(&mut Handle<'static>) -> Result<R>) -> Option<Result<R>> {
  let _entered = Entered::enter()?;
  HANDLE
    .try_with(|slot| -> Result<Option<R>> {
      let mut slot = slot.borrow_mut();
      if slot.is_none() {
        *slot = Some(heap.handle()?);
      }
      slot.as_mut().map(f).transpose()
    })
    .ok()?
    .transpose()
}

// =============================================================================
// Facade
// =============================================================================

/// Allocates at least `size` bytes from the process heap, 8-byte aligned.
pub fn allocate(size: usize) -> Result<NonNull<u8>> {
  let heap = heap()?;
  if size > MAX_BYTES {
    return heap.allocate_uncached(size);
  }
  with_handle(heap, |handle| handle.allocate(size)).unwrap_or_else(|| heap.allocate_uncached(size))
}

/// Returns a block to the process heap.
///
/// # Safety
///
/// `ptr` must come from [`allocate`] (or [`TcMalloc`]) and must not be used or freed again.
pub unsafe fn free(ptr: NonNull<u8>) {
  let Some(heap) = HEAP.get() else {
    panic!("free of {ptr:p} before any allocation");
  };
  let cached = with_handle(heap, |handle| {
    unsafe { handle.free(ptr) };
    Ok(())
  });
  if !matches!(cached, Some(Ok(()))) {
    unsafe { heap.free_uncached(ptr) };
  }
}

/// Bytes usable at `ptr`, at least the size it was requested with.
///
/// # Safety
///
/// `ptr` must be a live allocation of the process heap.
pub unsafe fn usable_size(ptr: NonNull<u8>) -> usize {
  let Some(heap) = HEAP.get() else {
    panic!("size query for {ptr:p} before any allocation");
  };
  unsafe { heap.usable_size(ptr) }
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// `GlobalAlloc` adapter over the process heap.
///
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: trimalloc::TcMalloc = trimalloc::TcMalloc;
/// ```
pub struct TcMalloc;

/// Request size honouring `layout`'s alignment, or `None` if it cannot be met.
///
/// Blocks of a class sit at multiples of the class size from a page-aligned
/// base, so a size that is a multiple of the alignment is enough.
#[inline]
fn request_size(layout: Layout) -> Option<usize> {
  let align = layout.align();
  if align > PAGE_SIZE {
    return None;
  }
  let size = layout.size().max(1);
  if align <= 8 { Some(size) } else { size.checked_next_multiple_of(align) }
}

unsafe impl GlobalAlloc for TcMalloc {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    request_size(layout)
      .and_then(|size| allocate(size).ok())
      .map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    if let Some(ptr) = NonNull::new(ptr) {
      unsafe { free(ptr) };
    }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    let Some(old) = NonNull::new(ptr) else {
      return unsafe { self.alloc(Layout::from_size_align_unchecked(new_size, layout.align())) };
    };
    let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };

    // Same size class: keep the block.
    if let (Some(from), Some(to)) = (request_size(layout), request_size(new_layout))
      && from <= MAX_BYTES
      && to <= MAX_BYTES
      && size_class::index(from) == size_class::index(to)
    {
      return ptr;
    }

    let new_ptr = unsafe { self.alloc(new_layout) };
    if !new_ptr.is_null() {
      unsafe {
        ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
        free(old);
      }
    }
    new_ptr
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    let ptr = unsafe { self.alloc(layout) };
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) }
    }
    ptr
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
mod c_api {
  use core::ptr::{self, NonNull, null_mut};

  use crate::{MAX_BYTES, size_class};

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
    super::allocate(size).map_or(null_mut(), NonNull::as_ptr)
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn free(ptr: *mut u8) {
    if let Some(ptr) = NonNull::new(ptr) {
      unsafe { super::free(ptr) };
    }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
    let Some(total) = nmemb.checked_mul(size) else {
      return null_mut();
    };
    let ptr = unsafe { malloc(total) };
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, total) };
    }
    ptr
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    let Some(old) = NonNull::new(ptr) else {
      return unsafe { malloc(size) };
    };
    if size == 0 {
      unsafe { super::free(old) };
      return null_mut();
    }

    // C realloc lacks the old size: the block's usable size bounds the copy.
    let usable = unsafe { super::usable_size(old) };
    if usable <= MAX_BYTES && size <= MAX_BYTES && size_class::round_up(size) == usable {
      return ptr;
    }

    let new_ptr = unsafe { malloc(size) };
    if !new_ptr.is_null() {
      unsafe {
        ptr::copy_nonoverlapping(ptr, new_ptr, usable.min(size));
        super::free(old);
      }
    }
    new_ptr
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
    NonNull::new(ptr).map_or(0, |ptr| unsafe { super::usable_size(ptr) })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn alignment_is_folded_into_size() {
    let layout = |size, align| Layout::from_size_align(size, align).unwrap();
    assert_eq!(request_size(layout(0, 1)), Some(1));
    assert_eq!(request_size(layout(5, 8)), Some(5));
    assert_eq!(request_size(layout(5, 32)), Some(32));
    assert_eq!(request_size(layout(100, 64)), Some(128));
    assert_eq!(request_size(layout(1, PAGE_SIZE)), Some(PAGE_SIZE));
    assert_eq!(request_size(layout(1, 2 * PAGE_SIZE)), None);
  }

  #[test]
  fn aligned_requests_land_aligned() {
    for align in [16, 32, 64, 256, 1024, 4096, PAGE_SIZE] {
      for size in [1, 24, 100, 3000, 70_000, MAX_BYTES + 1] {
        let layout = Layout::from_size_align(size, align).unwrap();
        let ptr = unsafe { TcMalloc.alloc(layout) };
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % align, 0, "size {size} align {align}");
        unsafe { TcMalloc.dealloc(ptr, layout) };
      }
    }
  }

  #[test]
  fn realloc_keeps_contents() {
    let layout = Layout::from_size_align(10, 8).unwrap();
    unsafe {
      let ptr = TcMalloc.alloc(layout);
      ptr.copy_from_nonoverlapping(b"0123456789".as_ptr(), 10);

      // Same class.
      let same = TcMalloc.realloc(ptr, layout, 12);
      assert_eq!(same, ptr);

      let grown = TcMalloc.realloc(same, Layout::from_size_align(12, 8).unwrap(), 5000);
      assert_eq!(core::slice::from_raw_parts(grown, 10), b"0123456789");
      assert!(usable_size(NonNull::new(grown).unwrap()) >= 5000);
      TcMalloc.dealloc(grown, Layout::from_size_align(5000, 8).unwrap());
    }
  }

  #[test]
  fn nested_enter_keeps_the_thread_marked() {
    let outer = Entered::enter().unwrap();
    assert!(Entered::enter().is_none());
    assert!(IN_ALLOC.with(Cell::get));
    assert!(Entered::enter().is_none());
    assert!(IN_ALLOC.with(Cell::get));
    drop(outer);
    assert!(!IN_ALLOC.with(Cell::get));
  }

  #[test]
  fn reentrant_calls_bypass_the_thread_cache() {
    let heap = heap().unwrap();
    let nested = with_handle(heap, |handle| {
      let outer = handle.allocate(24)?;
      // Both run while this thread's handle is borrowed.
      let a = allocate(16)?;
      let b = allocate(16)?;
      assert_ne!(a, b);
      assert_eq!(unsafe { usable_size(a) }, 16);
      unsafe {
        free(a);
        free(b);
        handle.free(outer);
      }
      Ok(())
    });
    assert!(matches!(nested, Some(Ok(()))));
    assert!(!IN_ALLOC.with(Cell::get));

    // The handle is usable again afterwards.
    let ptr = allocate(40).unwrap();
    unsafe { free(ptr) };
  }
}
