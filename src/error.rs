use thiserror::Error;

use crate::os::OsError;

/// Failure surfaced by an allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
  /// The OS refused to map more pages.
  #[error("out of memory: {0}")]
  OutOfMemory(#[from] OsError),
  /// The request cannot be expressed as a page run.
  #[error("request of {size} bytes exceeds the address space")]
  TooLarge { size: usize },
}

pub type Result<T, E = AllocError> = core::result::Result<T, E>;
