#![allow(clippy::missing_safety_doc)]

//! Segment and slice-span page allocation.
//!
//! Memory is mapped in `SEGMENT_SIZE` segments that are cut into `SLICE_SIZE`
//! slices. Runs of free slices ("spans") are kept in per-thread bins and handed
//! out as pages to a block-level heap. Segments whose live pages all belong to
//! exited threads are parked on a global lock-free list until another thread
//! reclaims them.

mod commit;
pub mod heap;
pub mod options;
pub mod os;
mod runtime;
mod segment;
mod segments;
mod span;
#[cfg(test)]
mod testing;

pub use heap::Heap;
pub use options::Options;
pub use os::{Arena, ArenaBlock, Clock, MemId, Msecs, Os, SystemArena, SystemClock, SystemOs};
pub use runtime::Runtime;
pub use segments::{Reclaimed, Segments, SpanInfo, ThreadStats};
pub use span::{SEGMENT_BINS, slice_bin};

// =============================================================================
// Constants
// =============================================================================

pub const SLICE_SHIFT: usize = 16;
pub const SLICE_SIZE: usize = 1 << SLICE_SHIFT; // 64KB
pub const SEGMENT_SHIFT: usize = SLICE_SHIFT + 9;
pub const SEGMENT_SIZE: usize = 1 << SEGMENT_SHIFT; // 32MB
pub const SLICES_PER_SEGMENT: usize = SEGMENT_SIZE / SLICE_SIZE;

/// Granule of commit tracking: one bit of a segment's commit mask.
pub const COMMIT_SIZE: usize = SEGMENT_SIZE / commit::COMMIT_BITS;

pub const SMALL_PAGE_SIZE: usize = SLICE_SIZE;
pub const MEDIUM_PAGE_SIZE: usize = 8 * SLICE_SIZE; // 512KB

pub const SMALL_OBJ_SIZE_MAX: usize = SMALL_PAGE_SIZE / 4;
pub const MEDIUM_OBJ_SIZE_MAX: usize = MEDIUM_PAGE_SIZE / 4;
pub const LARGE_OBJ_SIZE_MAX: usize = SEGMENT_SIZE / 2;

/// Block size recorded for pages whose blocks do not fit in `u32`.
pub const HUGE_BLOCK_SIZE: u32 = 1 << 31; // 2GB

/// Back offsets are kept for this many slices after a page's first slice.
pub const MAX_SLICE_OFFSET: usize = (SEGMENT_SIZE / 2) / SLICE_SIZE - 1;

/// Bytes reserved at the start of every segment for its header.
pub const SEGMENT_META_SIZE: usize = SLICES_PER_SEGMENT * 128 + 512;

const _: () = assert!(SEGMENT_SIZE.is_power_of_two());
const _: () = assert!(SLICES_PER_SEGMENT == 512);
const _: () = assert!(COMMIT_SIZE % SLICE_SIZE == 0);
const _: () = assert!(MEDIUM_PAGE_SIZE % COMMIT_SIZE == 0);
const _: () = assert!(MAX_SLICE_OFFSET == 255);
const _: () = assert!(LARGE_OBJ_SIZE_MAX < HUGE_BLOCK_SIZE as usize);

// =============================================================================
// Handles
// =============================================================================

/// Slot of a segment in the runtime's segment table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct SegmentId(u32);

impl SegmentId {
  #[inline]
  pub(crate) const fn new(index: usize) -> Self {
    Self(index as u32)
  }

  #[inline]
  pub const fn index(self) -> usize {
    self.0 as usize
  }
}

/// A page handed out by [`Segments::page_alloc`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PageRef {
  segment: SegmentId,
  slice: u32,
}

impl PageRef {
  #[inline]
  pub(crate) fn new(segment: SegmentId, slice: usize) -> Self {
    Self {
      segment,
      slice: slice as u32,
    }
  }

  #[inline]
  pub fn segment(self) -> SegmentId {
    self.segment
  }

  /// Index of the page's first slice within its segment.
  #[inline]
  pub fn slice(self) -> usize {
    self.slice as usize
  }
}

impl From<PageRef> for span::SpanRef {
  fn from(page: PageRef) -> Self {
    span::SpanRef::new(page.segment, page.slice())
  }
}

impl From<span::SpanRef> for PageRef {
  fn from(span: span::SpanRef) -> Self {
    PageRef::new(span.segment, span.index())
  }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum SegmentKind {
  /// `SEGMENT_SIZE` bytes shared by many pages.
  #[default]
  Normal,
  /// A single page larger than `LARGE_OBJ_SIZE_MAX`.
  Huge,
}

// =============================================================================
// Errors
// =============================================================================

/// A segment whose metadata is inconsistent, as reported by [`Segments::validate`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvariantError {
  #[error("segment {0:?} is not owned by the calling thread")]
  NotOwned(SegmentId),
  #[error("{abandoned} abandoned pages exceed {used} used pages")]
  AbandonedExceedsUsed { used: usize, abandoned: usize },
  #[error("decommit mask {decommit:#x} is not a subset of commit mask {commit:#x}")]
  DecommitNotCommitted { commit: u64, decommit: u64 },
  #[error("slice {index} does not start a span")]
  Gap { index: usize },
  #[error("slice {index} has a wrong back offset")]
  BadBackOffset { index: usize },
  #[error("free span at slice {index} is not in its bin")]
  UnqueuedFreeSpan { index: usize },
  #[error("free span at slice {index} is queued in bin {bin}, which does not hold its length")]
  MisbinnedSpan { index: usize, bin: usize },
  #[error("slice walk ended at {end}, expected {expected}")]
  Overrun { end: usize, expected: usize },
  #[error("found {found} used spans, expected {expected}")]
  UsedCount { expected: usize, found: usize },
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

#[inline(always)]
pub(crate) const fn align_down(x: usize, align: usize) -> usize {
  x & !(align - 1)
}

#[inline(always)]
pub(crate) const fn divide_up(x: usize, d: usize) -> usize {
  x.div_ceil(d)
}
