//! Segment header and commit tracking.

use core::ptr::null_mut;

use crate::{
  COMMIT_SIZE, SEGMENT_META_SIZE, SEGMENT_SIZE, SLICE_SIZE, SLICES_PER_SEGMENT, SegmentKind,
  align_down, align_up,
  commit::{COMMIT_BITS, CommitMask},
  os::{MemId, Msecs},
  runtime::Runtime,
  span::Slice,
};

/// Metadata of one segment. Lives in a slot of the runtime's table, outside
/// the segment's memory; the first `segment_info_slices` of the region are
/// still reserved as if the header were stored there.
pub(crate) struct Segment {
  /// Start of the mapped region; null while the slot holds no segment.
  pub(crate) base: *mut u8,
  pub(crate) memid: MemId,
  pub(crate) mem_is_pinned: bool,
  pub(crate) mem_is_large: bool,
  pub(crate) mem_is_committed: bool,

  pub(crate) allow_decommit: bool,
  pub(crate) decommit_expire: Msecs,
  pub(crate) decommit_mask: CommitMask,
  pub(crate) commit_mask: CommitMask,

  /// Slices at or above this index were never handed out since the memory was zeroed.
  pub(crate) zero_from: usize,

  pub(crate) abandoned_visits: usize,
  /// Pages in use; the header span is not counted.
  pub(crate) used: usize,
  /// Pages in use whose owner abandoned them.
  pub(crate) abandoned: usize,

  pub(crate) segment_slices: usize,
  pub(crate) segment_info_slices: usize,
  /// Slices with metadata; below `segment_slices` for huge segments and with guard pages.
  pub(crate) slice_entries: usize,
  pub(crate) kind: SegmentKind,
  pub(crate) slices: Vec<Slice>,
}

/// Geometry of a segment about to be initialized.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Layout {
  pub(crate) segment_slices: usize,
  /// Header bytes before the guard page.
  pub(crate) pre_size: usize,
  pub(crate) info_slices: usize,
}

/// Slices needed for a segment holding `required` bytes (0 for a normal segment).
pub(crate) fn calculate_slices(required: usize, page_size: usize, guard: bool) -> Layout {
  let pre_size = align_up(SEGMENT_META_SIZE, page_size);
  let (guard_size, required) = if guard {
    (page_size, align_up(required, page_size))
  } else {
    (0, required)
  };

  let isize = align_up(pre_size + guard_size, SLICE_SIZE);
  let segment_size = if required == 0 {
    SEGMENT_SIZE
  } else {
    align_up(required + isize + guard_size, SLICE_SIZE)
  };
  Layout {
    segment_slices: segment_size / SLICE_SIZE,
    pre_size,
    info_slices: isize / SLICE_SIZE,
  }
}

impl Segment {
  pub(crate) const fn empty() -> Self {
    Self {
      base: null_mut(),
      memid: MemId(0),
      mem_is_pinned: false,
      mem_is_large: false,
      mem_is_committed: false,
      allow_decommit: false,
      decommit_expire: 0,
      decommit_mask: CommitMask::EMPTY,
      commit_mask: CommitMask::EMPTY,
      zero_from: 0,
      abandoned_visits: 0,
      used: 0,
      abandoned: 0,
      segment_slices: 0,
      segment_info_slices: 0,
      slice_entries: 0,
      kind: SegmentKind::Normal,
      slices: Vec::new(),
    }
  }

  #[inline]
  pub(crate) fn is_mapped(&self) -> bool {
    !self.base.is_null()
  }

  #[inline]
  pub(crate) fn size(&self) -> usize {
    self.segment_slices * SLICE_SIZE
  }

  #[inline]
  pub(crate) fn info_size(&self) -> usize {
    self.segment_info_slices * SLICE_SIZE
  }

  /// Address `offset` bytes into the region. Never dereferenced here.
  #[inline]
  pub(crate) fn at(&self, offset: usize) -> *mut u8 {
    self.base.wrapping_add(offset)
  }

  #[inline]
  pub(crate) fn page_start(&self, slice_index: usize) -> *mut u8 {
    self.at(slice_index * SLICE_SIZE)
  }

  /// Clears all slice records, allocating the table on first use.
  pub(crate) fn reset_slices(&mut self) {
    if self.slices.is_empty() {
      self.slices = vec![Slice::default(); SLICES_PER_SEGMENT];
    } else {
      self.slices.fill(Slice::default());
    }
  }

  /// Index of the first slice of the run containing slice `index`.
  #[inline]
  pub(crate) fn slice_first(&self, index: usize) -> usize {
    let offset = self.slices[index].slice_offset as usize;
    debug_assert!(offset <= index, "slice {index} points before the segment");
    let first = index.saturating_sub(offset);
    debug_assert!(self.slices[first].slice_count > 0);
    first
  }

  // ===========================================================================
  // Commit masks
  // ===========================================================================

  /// Granules covered by `[offset, offset + size)`, rounded inward when
  /// `conservative` and outward otherwise. Also returns the rounded byte range.
  pub(crate) fn commit_mask_for(
    &self,
    conservative: bool,
    offset: usize,
    size: usize,
  ) -> (CommitMask, usize, usize) {
    if size == 0 || size > SEGMENT_SIZE || offset >= self.size() {
      return (CommitMask::EMPTY, 0, 0);
    }

    let (start, end) = if conservative {
      (align_up(offset, COMMIT_SIZE), align_down(offset + size, COMMIT_SIZE))
    } else {
      (align_down(offset, COMMIT_SIZE), align_up(offset + size, COMMIT_SIZE))
    };
    if end <= start {
      return (CommitMask::EMPTY, start, 0);
    }

    let bitidx = start / COMMIT_SIZE;
    let mut bitcount = (end - start) / COMMIT_SIZE;
    if bitidx >= COMMIT_BITS {
      log::warn!("commit range {:#x}+{:#x} lies past the commit mask", offset, size);
      return (CommitMask::EMPTY, start, 0);
    }
    if bitidx + bitcount > COMMIT_BITS {
      log::warn!(
        "commit mask overflow: bit {} count {} (range {:#x}+{:#x})",
        bitidx,
        bitcount,
        offset,
        size
      );
      bitcount = COMMIT_BITS - bitidx;
    }
    (CommitMask::new(bitidx, bitcount), start, bitcount * COMMIT_SIZE)
  }

  /// Commits (liberally) or decommits (conservatively) a byte range.
  /// Returns false only when the OS refused to commit.
  pub(crate) fn commitx(&mut self, rt: &Runtime, commit: bool, offset: usize, size: usize) -> bool {
    let (mask, start, full_size) = self.commit_mask_for(!commit, offset, size);
    if mask.is_empty() || full_size == 0 {
      return true;
    }

    if commit && !self.commit_mask.all_set(mask) {
      // Only granules that are not committed yet; committed ones may hold guard pages
      let mut missing = mask;
      missing.clear(self.commit_mask);
      for (idx, count) in missing.runs() {
        let (run_start, run_size) = CommitMask::run_range(idx, count);
        let mut is_zero = false;
        if !unsafe { rt.os().commit(self.at(run_start), run_size, &mut is_zero) } {
          return false;
        }
        self.commit_mask.set(CommitMask::new(idx, count));
      }
    } else if !commit && self.commit_mask.any_set(mask) {
      debug_assert!(start != 0, "decommitting the segment header");
      if self.allow_decommit {
        // A failed decommit only leaves the memory resident.
        unsafe { rt.os().decommit(self.at(start), full_size) };
      }
      self.commit_mask.clear(mask);
    }

    if commit && self.decommit_mask.any_set(mask) {
      self.decommit_expire = rt.clock().now() + rt.options().decommit_delay;
    }
    self.decommit_mask.clear(mask);
    debug_assert!(self.commit_mask.all_set(self.decommit_mask));
    true
  }

  pub(crate) fn ensure_committed(&mut self, rt: &Runtime, offset: usize, size: usize) -> bool {
    debug_assert!(self.commit_mask.all_set(self.decommit_mask));
    if self.commit_mask.is_full() && self.decommit_mask.is_empty() {
      return true;
    }
    self.commitx(rt, true, offset, size)
  }

  /// Decommits a freed range now, or stages it when a decommit delay is set.
  pub(crate) fn perhaps_decommit(&mut self, rt: &Runtime, offset: usize, size: usize) {
    if !self.allow_decommit {
      return;
    }
    let delay = rt.options().decommit_delay;
    if delay <= 0 {
      self.commitx(rt, false, offset, size);
      return;
    }

    let (mask, _, full_size) = self.commit_mask_for(true, offset, size);
    if mask.is_empty() || full_size == 0 {
      return;
    }
    // span_free may cover granules that were never committed
    self.decommit_mask.set(mask.intersect(self.commit_mask));
    self.decommit_expire = rt.clock().now() + delay;
  }

  /// Performs the staged decommits once they expired, or right away when `force`.
  pub(crate) fn delayed_decommit(&mut self, rt: &Runtime, force: bool) {
    if !self.allow_decommit || self.decommit_mask.is_empty() {
      return;
    }
    if !force && rt.clock().now() < self.decommit_expire {
      return;
    }

    let mask = self.decommit_mask;
    self.decommit_expire = 0;
    self.decommit_mask = CommitMask::EMPTY;
    for (idx, count) in mask.runs() {
      let (offset, size) = CommitMask::run_range(idx, count);
      self.commitx(rt, false, offset, size);
    }
    debug_assert!(self.decommit_mask.is_empty());
  }
}
