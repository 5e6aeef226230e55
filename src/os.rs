//! Page provider backed by anonymous `mmap`.

use core::ptr::{NonNull, null_mut};

use thiserror::Error;

use crate::PAGE_SHIFT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OsError {
  #[error("mmap of {pages} pages failed (errno {errno})")]
  Map { pages: usize, errno: i32 },
}

/// Maps `pages` fresh, zero-filled pages aligned to [`crate::PAGE_SIZE`].
///
/// `mmap` only guarantees system-page alignment, so the mapping is
/// over-allocated by one allocator page and the misaligned head and tail are
/// unmapped again.
pub(crate) fn acquire_pages(pages: usize) -> Result<NonNull<u8>, OsError> {
  debug_assert!(pages > 0);
  let align = 1usize << PAGE_SHIFT;
  let Some(size) = pages.checked_mul(align).filter(|s| *s <= isize::MAX as usize - align) else {
    return Err(OsError::Map {
      pages,
      errno: libc::ENOMEM,
    });
  };

  let raw = unsafe { os_mmap(size + align) };
  let Some(raw) = NonNull::new(raw) else {
    return Err(OsError::Map {
      pages,
      errno: errno(),
    });
  };

  let start = raw.as_ptr() as usize;
  let aligned = (start + align - 1) & !(align - 1);
  let head = aligned - start;
  let tail = align - head;
  unsafe {
    if head > 0 {
      os_munmap(raw.as_ptr(), head);
    }
    if tail > 0 {
      os_munmap((aligned + size) as *mut u8, tail);
    }
  }

  // Safety: inside a successful mapping
  Ok(unsafe { NonNull::new_unchecked(aligned as *mut u8) })
}

/// Unmaps a region previously returned by [`acquire_pages`].
///
/// # Safety
///
/// `ptr` must come from [`acquire_pages`] with the same `pages`, and nothing
/// may access the region afterwards.
pub(crate) unsafe fn release_pages(ptr: NonNull<u8>, pages: usize) {
  unsafe { os_munmap(ptr.as_ptr(), pages << PAGE_SHIFT) };
}

/// Drops the physical backing of a still-mapped region.
#[cfg(feature = "release-mem")]
pub(crate) unsafe fn discard_pages(ptr: NonNull<u8>, pages: usize) {
  unsafe {
    libc::madvise(
      ptr.as_ptr().cast(),
      pages << PAGE_SHIFT,
      libc::MADV_DONTNEED,
    )
  };
}

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

fn errno() -> i32 {
  std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::PAGE_SIZE;

  #[test]
  fn pages_are_aligned_and_zeroed() {
    let ptr = acquire_pages(3).unwrap();
    assert_eq!(ptr.as_ptr() as usize % PAGE_SIZE, 0);
    let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), 3 * PAGE_SIZE) };
    assert!(bytes.iter().all(|&b| b == 0));
    unsafe { release_pages(ptr, 3) };
  }

  #[test]
  fn absurd_request_fails() {
    let err = acquire_pages(usize::MAX >> (PAGE_SHIFT + 1)).unwrap_err();
    assert!(matches!(err, OsError::Map { .. }));
  }
}
