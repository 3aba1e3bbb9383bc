//! Commit masks: one bit per `COMMIT_SIZE` granule of a segment.

use crate::COMMIT_SIZE;

/// Number of granules a mask can describe.
pub const COMMIT_BITS: usize = u64::BITS as usize;

/// Bitmask over the commit granules of a segment.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct CommitMask(u64);

impl CommitMask {
  pub const EMPTY: Self = Self(0);
  pub const FULL: Self = Self(!0);

  /// Mask with `bitcount` bits set starting at `bitidx`.
  pub const fn new(bitidx: usize, bitcount: usize) -> Self {
    debug_assert!(bitidx + bitcount <= COMMIT_BITS);
    if bitcount == COMMIT_BITS {
      debug_assert!(bitidx == 0);
      Self::FULL
    } else if bitcount == 0 {
      Self::EMPTY
    } else {
      Self(((1u64 << bitcount) - 1) << bitidx)
    }
  }

  #[inline]
  pub const fn bits(self) -> u64 {
    self.0
  }

  #[inline]
  pub const fn is_empty(self) -> bool {
    self.0 == 0
  }

  #[inline]
  pub const fn is_full(self) -> bool {
    self.0 == !0
  }

  /// True if every bit of `other` is set in `self`.
  #[inline]
  pub const fn all_set(self, other: Self) -> bool {
    (self.0 & other.0) == other.0
  }

  #[inline]
  pub const fn any_set(self, other: Self) -> bool {
    (self.0 & other.0) != 0
  }

  #[inline]
  pub const fn intersect(self, other: Self) -> Self {
    Self(self.0 & other.0)
  }

  #[inline]
  pub fn set(&mut self, other: Self) {
    self.0 |= other.0;
  }

  #[inline]
  pub fn clear(&mut self, other: Self) {
    self.0 &= !other.0;
  }

  /// Committed bytes described by the mask for a region of `total` bytes.
  pub fn committed_size(self, total: usize) -> usize {
    if self.is_full() {
      total
    } else {
      self.0.count_ones() as usize * (total / COMMIT_BITS)
    }
  }

  /// Maximal runs of set bits as `(first_bit, bit_count)`, lowest first.
  pub fn runs(self) -> Runs {
    Runs { mask: self.0 }
  }

  /// Byte range covered by a run.
  #[inline]
  pub const fn run_range(idx: usize, count: usize) -> (usize, usize) {
    (idx * COMMIT_SIZE, count * COMMIT_SIZE)
  }
}

pub struct Runs {
  mask: u64,
}

impl Iterator for Runs {
  type Item = (usize, usize);

  fn next(&mut self) -> Option<Self::Item> {
    if self.mask == 0 {
      return None;
    }
    let idx = self.mask.trailing_zeros() as usize;
    let shifted = self.mask >> idx;
    let count = (!shifted).trailing_zeros() as usize;
    if idx + count >= COMMIT_BITS {
      self.mask = 0;
    } else {
      self.mask &= !(((1u64 << count) - 1) << idx);
    }
    Some((idx, count))
  }
}
