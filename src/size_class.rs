//! Mapping from request sizes to size classes and transfer quotas.

use crate::{MAX_BYTES, NUM_CLASSES, PAGE_SHIFT, PAGE_SIZE};

/// Largest number of blocks moved between a thread cache and the central cache at once.
const MAX_BATCH: usize = 512;
/// Smallest batch cap, so that even the largest classes move in pairs.
const MIN_BATCH: usize = 2;

/// A contiguous byte-size band sharing one alignment.
struct Band {
  /// Largest size (inclusive) in this band.
  limit: usize,
  align: usize,
  buckets: usize,
}

// Internal fragmentation stays around 10% within every band.
const BANDS: [Band; 5] = [
  Band { limit: 128, align: 8, buckets: 16 },
  Band { limit: 1024, align: 16, buckets: 56 },
  Band { limit: 8 * 1024, align: 128, buckets: 56 },
  Band { limit: 64 * 1024, align: 1024, buckets: 56 },
  Band { limit: 256 * 1024, align: 8 * 1024, buckets: 24 },
];

const fn total_buckets() -> usize {
  let mut total = 0;
  let mut i = 0;
  while i < BANDS.len() {
    total += BANDS[i].buckets;
    i += 1;
  }
  total
}

const _: () = assert!(total_buckets() == NUM_CLASSES);
const _: () = assert!(BANDS[BANDS.len() - 1].limit == MAX_BYTES);

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

/// Alignment of the band `size` falls into. Sizes above [`MAX_BYTES`] are page aligned.
#[inline]
pub const fn alignment(size: usize) -> usize {
  let mut i = 0;
  while i < BANDS.len() {
    if size <= BANDS[i].limit {
      return BANDS[i].align;
    }
    i += 1;
  }
  PAGE_SIZE
}

/// Rounds `size` up to the alignment of its band.
#[inline]
pub const fn round_up(size: usize) -> usize {
  align_up(size, alignment(size))
}

/// Bucket index of `size`, in `0..NUM_CLASSES`.
///
/// # Panics
///
/// Panics if `size` is zero or larger than [`MAX_BYTES`].
#[inline]
pub const fn index(size: usize) -> usize {
  assert!(size > 0 && size <= MAX_BYTES, "size out of the bucketed range");

  let mut floor = 0;
  let mut offset = 0;
  let mut i = 0;
  loop {
    let band = &BANDS[i];
    if size <= band.limit {
      return offset + (size - floor + band.align - 1) / band.align - 1;
    }
    floor = band.limit;
    offset += band.buckets;
    i += 1;
  }
}

/// Block size of the bucket `class` (inverse of [`index`] on rounded sizes).
pub const fn class_size(class: usize) -> usize {
  assert!(class < NUM_CLASSES);

  let mut floor = 0;
  let mut first = 0;
  let mut i = 0;
  loop {
    let band = &BANDS[i];
    if class < first + band.buckets {
      return floor + (class - first + 1) * band.align;
    }
    floor = band.limit;
    first += band.buckets;
    i += 1;
  }
}

/// Upper bound on blocks fetched from the central cache in one refill of a `size`-byte class.
#[inline]
pub const fn num_move_size(size: usize) -> usize {
  assert!(size > 0);
  let num = MAX_BYTES / size;
  if num < MIN_BATCH {
    MIN_BATCH
  } else if num > MAX_BATCH {
    MAX_BATCH
  } else {
    num
  }
}

/// Pages the central cache requests from the page cache when a `size`-byte class runs dry.
#[inline]
pub const fn num_move_page(size: usize) -> usize {
  let bytes = num_move_size(size) * size;
  let pages = bytes.div_ceil(PAGE_SIZE);
  if pages == 0 { 1 } else { pages }
}

/// Pages needed to hold `size` bytes.
#[inline]
pub const fn pages_for(size: usize) -> usize {
  align_up(size, PAGE_SIZE) >> PAGE_SHIFT
}
