//! Thread-caching memory allocator.
//!
//! Requests up to [`MAX_BYTES`] are served from per-thread free lists, which
//! refill from and drain into a central cache of carved spans. Spans come from
//! a page cache that splits and coalesces runs of up to [`MAX_PAGES`] pages.
//! Larger requests map page runs directly.
//!
//! Use [`Heap`] for a private instance, the free functions for the process
//! heap, or [`TcMalloc`] as the global allocator.

mod central_cache;
mod error;
mod free_list;
mod global;
mod heap;
mod os;
mod page_cache;
mod page_map;
mod pool;
pub mod size_class;
mod span;
mod sync;
mod thread_cache;

pub use error::{AllocError, Result};
pub use global::{TcMalloc, allocate, free, usable_size};
pub use heap::{Handle, Heap};
pub use os::OsError;
pub use page_cache::PageStats;

// =============================================================================
// Constants
// =============================================================================

pub const PAGE_SHIFT: usize = 13;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT; // 8KB

/// Largest request served through the thread caches.
pub const MAX_BYTES: usize = 256 * 1024;

/// Number of size classes below `MAX_BYTES`.
pub const NUM_CLASSES: usize = 208;

/// Longest page run kept in the page cache. Longer runs go straight to the OS.
pub const MAX_PAGES: usize = 128;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(MAX_BYTES % PAGE_SIZE == 0);
const _: () = assert!(MAX_BYTES <= MAX_PAGES * PAGE_SIZE);
// The smallest class must hold a free-list link.
const _: () = assert!(size_of::<free_list::FreeBlock>() <= size_class::class_size(0));
