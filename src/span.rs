//! Slice records, span bins and span queues.

use crate::{SLICES_PER_SEGMENT, SegmentId};

// =============================================================================
// Bins
// =============================================================================

/// Bin for a run of `slice_count` slices: exact up to 8, then 4 bins per doubling.
#[inline]
pub const fn slice_bin(slice_count: usize) -> usize {
  if slice_count <= 1 {
    return slice_count;
  }
  let c = slice_count - 1;
  let s = (usize::BITS - 1 - c.leading_zeros()) as usize;
  if s <= 2 {
    return c + 1;
  }
  ((s << 2) | ((c >> (s - 2)) & 0x03)) - 4
}

/// Highest bin index; a full segment of free slices lands here.
pub const SEGMENT_BIN_MAX: usize = slice_bin(SLICES_PER_SEGMENT);
pub const SEGMENT_BINS: usize = SEGMENT_BIN_MAX + 1;

/// Largest run length that maps to `bin`.
pub const fn bin_max_count(bin: usize) -> usize {
  let mut n = SLICES_PER_SEGMENT;
  while n > 0 && slice_bin(n) > bin {
    n -= 1;
  }
  n
}

const _: () = assert!(slice_bin(8) == 8);
const _: () = assert!(bin_max_count(SEGMENT_BIN_MAX) == SLICES_PER_SEGMENT);

// =============================================================================
// Slices
// =============================================================================

/// A span or page, named by the segment and the index of its first slice.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SpanRef {
  pub segment: SegmentId,
  pub slice: u32,
}

impl SpanRef {
  #[inline]
  pub fn new(segment: SegmentId, slice: usize) -> Self {
    debug_assert!(slice < SLICES_PER_SEGMENT);
    Self {
      segment,
      slice: slice as u32,
    }
  }

  #[inline]
  pub fn index(self) -> usize {
    self.slice as usize
  }
}

/// Page-level header fields, meaningful while the slice starts a used page.
#[derive(Clone, Copy, Default, Debug)]
pub struct PageFlags {
  pub is_reset: bool,
  pub is_committed: bool,
  pub is_zero_init: bool,
}

/// Per-slice metadata.
///
/// `xblock_size` is 0 for a free span, 1 for an interior or taken slice and
/// the block size for the first slice of a used page.
#[derive(Clone, Copy, Default, Debug)]
pub struct Slice {
  /// Slices in the run; 0 for interior slices.
  pub slice_count: u32,
  /// Distance (in slices) back to the first slice of the run.
  pub slice_offset: u32,
  pub xblock_size: u32,
  pub prev: Option<SpanRef>,
  pub next: Option<SpanRef>,
  pub page: PageFlags,
}

impl Slice {
  #[inline]
  pub fn is_used(&self) -> bool {
    self.xblock_size > 0
  }

  #[inline]
  pub fn is_free(&self) -> bool {
    self.xblock_size == 0
  }
}

// =============================================================================
// Span queues
// =============================================================================

/// Ends of one bin's doubly-linked list; the links themselves live in the slices.
#[derive(Clone, Copy, Debug)]
pub struct SpanQueue {
  pub first: Option<SpanRef>,
  pub last: Option<SpanRef>,
  /// Largest span length accepted by this bin.
  pub slice_count: usize,
}

impl SpanQueue {
  pub const fn new(bin: usize) -> Self {
    Self {
      first: None,
      last: None,
      slice_count: bin_max_count(bin),
    }
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.first.is_none()
  }
}

/// One empty queue per bin.
pub fn span_queues() -> [SpanQueue; SEGMENT_BINS] {
  core::array::from_fn(SpanQueue::new)
}
