//! The block layer that sits on top of pages.

use core::ptr::NonNull;

use crate::PageRef;

/// Block-level bookkeeping for pages, implemented by the caller's heap.
///
/// The segment layer asks the heap about pages of abandoned segments while
/// deciding whether to reclaim them, so an implementation must be able to
/// answer for any page it handed blocks out of, including pages of exited
/// threads.
pub trait Heap {
  /// Moves blocks freed concurrently by other threads back into the page.
  fn collect(&mut self, page: PageRef);

  /// True when no block of the page is live.
  fn all_free(&self, page: PageRef) -> bool;

  /// True when the page can serve at least one more block.
  fn has_available(&self, page: PageRef) -> bool;

  /// Takes ownership of a page from a reclaimed segment.
  fn reclaim(&mut self, page: PageRef);

  /// Returns `block` to the page before the page itself is freed.
  fn free_block(&mut self, page: PageRef, block: NonNull<u8>);
}
