//! Per-thread segment management: span queues, the segment cache, page
//! allocation and the abandon/reclaim protocol.

use core::{mem::size_of, ptr::NonNull, sync::atomic::Ordering};
use std::{collections::VecDeque, sync::Arc};

use crate::{
  HUGE_BLOCK_SIZE, InvariantError, LARGE_OBJ_SIZE_MAX, MAX_SLICE_OFFSET, MEDIUM_OBJ_SIZE_MAX,
  MEDIUM_PAGE_SIZE, PageRef, SLICE_SIZE, SLICES_PER_SEGMENT, SMALL_OBJ_SIZE_MAX, SegmentId,
  SegmentKind, align_up,
  commit::CommitMask,
  divide_up,
  heap::Heap,
  runtime::{NO_THREAD, Runtime},
  segment::{Segment, calculate_slices},
  span::{PageFlags, SEGMENT_BINS, Slice, SpanQueue, SpanRef, slice_bin, span_queues},
  COMMIT_SIZE,
};

/// Outcome of [`Segments::try_reclaim`].
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Reclaimed {
  /// A reclaimed segment with a large enough free span.
  pub segment: Option<SegmentId>,
  /// A non-full page of the requested block size went to the heap.
  pub right_page_reclaimed: bool,
}

/// One run of slices, as seen by the introspection calls.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SpanInfo {
  pub segment: SegmentId,
  pub index: usize,
  pub slice_count: usize,
  pub is_used: bool,
}

/// Segment accounting of one thread. Cached segments still count.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ThreadStats {
  pub count: usize,
  pub peak_count: usize,
  pub current_size: usize,
  pub peak_size: usize,
}

/// Why no span was found.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Miss {
  NoSpan,
  CommitFailed,
}

/// Block size recorded in a page's first slice.
#[inline]
fn block_size_marker(block_size: usize) -> u32 {
  block_size
    .max(size_of::<usize>())
    .min(HUGE_BLOCK_SIZE as usize) as u32
}

/// The segments of one thread.
///
/// Every segment it allocates or reclaims is owned by this instance until it
/// is freed or abandoned. Dropping it returns the cached segments; segments
/// with live pages stay mapped until their pages are abandoned or the runtime
/// is dropped.
pub struct Segments {
  rt: Arc<Runtime>,
  thread_id: usize,
  spans: [SpanQueue; SEGMENT_BINS],
  /// Empty segments, most recently cached first.
  cache: VecDeque<SegmentId>,
  count: usize,
  peak_count: usize,
  current_size: usize,
  peak_size: usize,
}

impl Segments {
  pub fn new(rt: &Arc<Runtime>) -> Self {
    let thread_id = rt.new_thread_id();
    log::debug!("segments for thread {}", thread_id);
    Self {
      rt: Arc::clone(rt),
      thread_id,
      spans: span_queues(),
      cache: VecDeque::new(),
      count: 0,
      peak_count: 0,
      current_size: 0,
      peak_size: 0,
    }
  }

  pub fn runtime(&self) -> &Arc<Runtime> {
    &self.rt
  }

  pub fn thread_id(&self) -> usize {
    self.thread_id
  }

  pub fn cache_count(&self) -> usize {
    self.cache.len()
  }

  pub fn stats(&self) -> ThreadStats {
    ThreadStats {
      count: self.count,
      peak_count: self.peak_count,
      current_size: self.current_size,
      peak_size: self.peak_size,
    }
  }

  // ===========================================================================
  // Metadata access
  // ===========================================================================
  //
  // A segment's metadata is only touched by the thread recorded as its owner
  // (asserted by `check_owner` on the public entry points), by the one thread
  // that popped it off an abandoned list, or read by any thread while it holds
  // an ownerless huge page (`check_reader`). Every internal path reaches a
  // segment through these accessors, so the borrow checker keeps the
  // references of one thread from overlapping.

  #[inline]
  fn seg(&self, id: SegmentId) -> &Segment {
    unsafe { &*self.rt.segment_ptr(id) }
  }

  #[inline]
  fn seg_mut(&mut self, id: SegmentId) -> &mut Segment {
    unsafe { &mut *self.rt.segment_ptr(id) }
  }

  /// The segment together with the runtime its OS calls go through.
  #[inline]
  fn seg_rt(&mut self, id: SegmentId) -> (&mut Segment, &Runtime) {
    let seg = unsafe { &mut *self.rt.segment_ptr(id) };
    (seg, &*self.rt)
  }

  #[inline]
  fn slice_at(&self, id: SegmentId, index: usize) -> Slice {
    self.seg(id).slices[index]
  }

  #[inline]
  fn slice_mut(&mut self, span: SpanRef) -> &mut Slice {
    &mut self.seg_mut(span.segment).slices[span.index()]
  }

  #[inline]
  fn is_abandoned(&self, id: SegmentId) -> bool {
    self.rt.owner(id) == NO_THREAD
  }

  fn check_owner(&self, id: SegmentId) {
    let owner = self.rt.owner(id);
    assert!(
      owner == self.thread_id,
      "segment {:?} belongs to thread {}, not {}",
      id,
      owner,
      self.thread_id
    );
  }

  /// Like `check_owner`, but any thread may read an ownerless huge segment.
  fn check_reader(&self, id: SegmentId) {
    let slot = self.rt.slot(id);
    let owner = slot.thread_id.load(Ordering::Acquire);
    assert!(
      owner == self.thread_id || (owner == NO_THREAD && slot.huge.load(Ordering::Relaxed)),
      "segment {:?} belongs to thread {}, not {}",
      id,
      owner,
      self.thread_id
    );
  }

  #[inline]
  fn tripwire(&self, id: SegmentId) {
    #[cfg(feature = "debug-tripwire")]
    if let Err(e) = self.validate(id) {
      panic!("segment {:?} is corrupt: {}", id, e);
    }
    #[cfg(not(feature = "debug-tripwire"))]
    let _ = id;
  }

  fn track_alloc(&mut self, size: usize) {
    self.count += 1;
    self.peak_count = self.peak_count.max(self.count);
    self.current_size += size;
    self.peak_size = self.peak_size.max(self.current_size);
  }

  fn track_free(&mut self, size: usize) {
    self.count = self.count.saturating_sub(1);
    self.current_size = self.current_size.saturating_sub(size);
  }

  // ===========================================================================
  // Span queues
  // ===========================================================================

  fn queue_push(&mut self, bin: usize, span: SpanRef) {
    let first = self.spans[bin].first;
    let s = self.slice_mut(span);
    s.prev = None;
    s.next = first;
    s.xblock_size = 0;
    match first {
      Some(first) => self.slice_mut(first).prev = Some(span),
      None => self.spans[bin].last = Some(span),
    }
    self.spans[bin].first = Some(span);
  }

  /// Unlinks `span`; a span that is not on any queue is only marked taken.
  fn queue_delete(&mut self, bin: usize, span: SpanRef) {
    let Slice { prev, next, .. } = self.slice_at(span.segment, span.index());
    if let Some(p) = prev {
      self.slice_mut(p).next = next;
    }
    if let Some(n) = next {
      self.slice_mut(n).prev = prev;
    }
    let q = &mut self.spans[bin];
    if q.first == Some(span) {
      q.first = next;
    }
    if q.last == Some(span) {
      q.last = prev;
    }
    let s = self.slice_mut(span);
    s.prev = None;
    s.next = None;
    s.xblock_size = 1;
  }

  fn queue_contains(&self, bin: usize, span: SpanRef) -> bool {
    let mut cur = self.spans[bin].first;
    while let Some(r) = cur {
      if r == span {
        return true;
      }
      cur = self.slice_at(r.segment, r.index()).next;
    }
    false
  }

  fn remove_from_queue(&mut self, span: SpanRef) {
    let s = self.slice_at(span.segment, span.index());
    debug_assert!(s.slice_count > 0 && s.slice_offset == 0 && s.xblock_size == 0);
    self.queue_delete(slice_bin(s.slice_count as usize), span);
  }

  // ===========================================================================
  // Spans
  // ===========================================================================

  /// Marks `count` slices at `index` free, stages their decommit and queues
  /// them unless the segment is huge or abandoned.
  fn span_free(&mut self, id: SegmentId, index: usize, count: usize) {
    let queued = !self.is_abandoned(id);
    let count = count.max(1);
    let (seg, rt) = self.seg_rt(id);
    let queued = queued && seg.kind != SegmentKind::Huge;
    debug_assert!(index + count - 1 < seg.slice_entries);

    let first = &mut seg.slices[index];
    first.slice_count = count as u32;
    first.slice_offset = 0;
    if count > 1 {
      let last = &mut seg.slices[index + count - 1];
      last.slice_count = 0;
      last.slice_offset = (count - 1) as u32;
      last.xblock_size = 0;
    }

    seg.perhaps_decommit(rt, index * SLICE_SIZE, count * SLICE_SIZE);

    if queued {
      self.queue_push(slice_bin(count), SpanRef::new(id, index));
    } else {
      // Unqueued spans keep no links, so a later tolerant delete is a no-op
      let s = &mut seg.slices[index];
      s.prev = None;
      s.next = None;
      s.xblock_size = 0;
    }
  }

  /// Frees the span at `span` merged with its free neighbours. Returns the merged span.
  fn span_free_coalesce(&mut self, span: SpanRef) -> SpanRef {
    let id = span.segment;
    let abandoned = self.is_abandoned(id);
    let (kind, entries) = {
      let seg = self.seg(id);
      (seg.kind, seg.slice_entries)
    };

    if kind == SegmentKind::Huge {
      // The segment is freed right after; the last slice is left as is
      self.slice_mut(span).xblock_size = 0;
      return span;
    }

    let mut index = span.index();
    let mut count = self.slice_at(id, index).slice_count as usize;
    debug_assert!(count > 0);

    let next = index + count;
    if next < entries && self.slice_at(id, next).is_free() {
      count += self.slice_at(id, next).slice_count as usize;
      if !abandoned {
        self.remove_from_queue(SpanRef::new(id, next));
      }
    }
    if index > 0 {
      let prev = self.seg(id).slice_first(index - 1);
      if self.slice_at(id, prev).is_free() {
        count += self.slice_at(id, prev).slice_count as usize;
        if !abandoned {
          self.remove_from_queue(SpanRef::new(id, prev));
        }
        index = prev;
      }
    }

    self.span_free(id, index, count);
    SpanRef::new(id, index)
  }

  /// Shrinks the taken span at `index` to `count` slices, freeing the rest.
  fn slice_split(&mut self, id: SegmentId, index: usize, count: usize) {
    let have = self.slice_at(id, index).slice_count as usize;
    debug_assert!(self.slice_at(id, index).is_used());
    if have <= count {
      return;
    }
    self.span_free(id, index + count, have - count);
    self.seg_mut(id).slices[index].slice_count = count as u32;
  }

  /// Turns `count` slices at `index` into a page. None if committing failed.
  fn span_allocate(&mut self, id: SegmentId, index: usize, count: usize) -> Option<PageRef> {
    let (seg, rt) = self.seg_rt(id);
    debug_assert!(index < seg.slice_entries);
    debug_assert!(seg.slices[index].xblock_size <= 1);

    if !seg.ensure_committed(rt, index * SLICE_SIZE, count * SLICE_SIZE) {
      return None;
    }

    let entries = seg.slice_entries;
    let is_zero_init = index >= seg.zero_from;
    seg.zero_from = seg.zero_from.max(index.saturating_add(count));

    let first = &mut seg.slices[index];
    first.slice_offset = 0;
    first.slice_count = count as u32;
    first.xblock_size = (count * SLICE_SIZE).min(HUGE_BLOCK_SIZE as usize) as u32;
    first.page = PageFlags {
      is_reset: false,
      is_committed: true,
      is_zero_init,
    };

    // Huge pages may have more slices than the segment has entries
    let mut extra = (count - 1).min(MAX_SLICE_OFFSET);
    if index + extra >= entries {
      extra = entries - index - 1;
    }
    for i in 1..=extra {
      let s = &mut seg.slices[index + i];
      s.slice_offset = i as u32;
      s.slice_count = 0;
      s.xblock_size = 1;
    }

    let last = index + count - 1;
    if last < entries && last > index + extra {
      let s = &mut seg.slices[last];
      s.slice_offset = (count - 1) as u32;
      s.slice_count = 0;
      s.xblock_size = 1;
    }

    seg.used += 1;
    Some(PageRef::new(id, index))
  }

  /// Best fit from the bin of `count` upward.
  fn find_and_allocate(&mut self, count: usize) -> Result<PageRef, Miss> {
    debug_assert!(count * SLICE_SIZE <= LARGE_OBJ_SIZE_MAX);
    let start = slice_bin(count);
    let count = count.max(1);
    for bin in start..SEGMENT_BINS {
      let q = &self.spans[bin];
      if q.is_empty() {
        continue;
      }
      debug_assert!(q.slice_count >= count);
      let mut cur = q.first;
      while let Some(span) = cur {
        let s = self.slice_at(span.segment, span.index());
        if s.slice_count as usize >= count {
          self.queue_delete(bin, span);
          self.slice_split(span.segment, span.index(), count);
          return match self.span_allocate(span.segment, span.index(), count) {
            Some(page) => Ok(page),
            None => {
              self.span_free_coalesce(span);
              Err(Miss::CommitFailed)
            }
          };
        }
        cur = s.next;
      }
    }
    Err(Miss::NoSpan)
  }

  // ===========================================================================
  // Segment lifecycle
  // ===========================================================================

  /// Sets up a fresh segment (or the cached `existing` one). `required` is 0
  /// for a normal segment, else the byte size of the single huge page, which
  /// is returned alongside.
  fn segment_init(
    &mut self,
    existing: Option<SegmentId>,
    required: usize,
  ) -> Option<(SegmentId, Option<PageRef>)> {
    debug_assert!(existing.is_none() || required == 0);
    let opts = self.rt.options();
    let guard = opts.guard_pages;
    let allow_decommit = opts.allow_decommit;
    let eager_delay = self.count < opts.eager_commit_delay;
    let eager = !eager_delay && opts.eager_commit;
    let page_size = self.rt.os().page_size();

    let layout = calculate_slices(required, page_size, guard);
    let segment_slices = layout.segment_slices;
    let info_slices = layout.info_slices;
    let slice_entries = segment_slices.min(SLICES_PER_SEGMENT);
    let segment_size = segment_slices * SLICE_SIZE;
    // Huge segments have no commit mask past their first 32 MiB, so they are always committed
    let commit = eager || required > 0;

    let id = match existing {
      Some(id) => id,
      None => self.segment_map(segment_size, info_slices, commit, eager_delay || guard)?,
    };

    let thread_id = self.thread_id;
    let (seg, rt) = self.seg_rt(id);
    debug_assert!(seg.is_mapped());
    seg.reset_slices();
    if existing.is_none() {
      seg.allow_decommit = allow_decommit && !seg.mem_is_pinned && !seg.mem_is_large;
      seg.decommit_expire = 0;
      seg.decommit_mask = CommitMask::EMPTY;
    }
    seg.segment_slices = segment_slices;
    seg.segment_info_slices = info_slices;
    seg.slice_entries = slice_entries;
    seg.kind = if required == 0 {
      SegmentKind::Normal
    } else {
      SegmentKind::Huge
    };
    seg.used = 0;
    seg.abandoned = 0;
    seg.abandoned_visits = 0;
    rt.slot(id).thread_id.store(thread_id, Ordering::Relaxed);

    let mut guard_slices = 0;
    if guard {
      let info_end = seg.info_size() - page_size;
      let end = seg.size() - page_size;
      debug_assert!(info_end >= layout.pre_size);
      let os = rt.os();
      // Huge segments are mapped committed and their tail lies past the commit mask.
      // Both guards sit in granules that stay committed, so later commits skip them.
      let ok = unsafe { os.protect(seg.at(info_end), page_size) }
        && (required > 0 || seg.ensure_committed(rt, end, page_size))
        && unsafe { os.protect(seg.at(end), page_size) };
      if !ok {
        log::warn!("unable to set guard pages of segment {:?}", id);
        self.segment_os_free(id);
        return None;
      }
      if slice_entries == segment_slices {
        seg.slice_entries -= 1;
      }
      guard_slices = 1;
    }

    // The header is a permanently used span that `used` does not count
    if self.span_allocate(id, 0, info_slices).is_none() {
      log::warn!("unable to commit the header of segment {:?}", id);
      self.segment_os_free(id);
      return None;
    }
    self.seg_mut(id).used = 0;

    if required == 0 {
      let entries = self.seg(id).slice_entries;
      self.span_free(id, info_slices, entries - info_slices);
      log::debug!("segment {:?} ready ({} slices)", id, entries - info_slices);
      self.tripwire(id);
      return Some((id, None));
    }

    let page_slices = segment_slices - info_slices - guard_slices;
    match self.span_allocate(id, info_slices, page_slices) {
      Some(page) => {
        log::debug!("huge segment {:?} ready ({} bytes)", id, segment_size);
        Some((id, Some(page)))
      }
      None => {
        log::warn!("unable to commit huge segment {:?}", id);
        self.segment_os_free(id);
        None
      }
    }
  }

  /// Claims a slot and maps memory for it with at least the header committed.
  /// When `commit` is asked for, the whole segment comes back committed even
  /// if the arena only reserved it.
  fn segment_map(
    &mut self,
    segment_size: usize,
    info_slices: usize,
    commit: bool,
    lazy: bool,
  ) -> Option<SegmentId> {
    let Some(id) = self.rt.alloc_slot() else {
      log::warn!("segment table is full ({} slots)", self.rt.options().max_segments);
      return None;
    };

    let mut committed = commit;
    let mut mem_large = !lazy;
    let mut pinned = false;
    let mut is_zero = false;
    let block = self.rt.arena().alloc_aligned(
      segment_size,
      crate::SEGMENT_SIZE,
      &mut committed,
      &mut mem_large,
      &mut pinned,
      &mut is_zero,
    );
    let Some(block) = block else {
      log::warn!("unable to allocate a segment of {} bytes", segment_size);
      self.rt.release_slot(id);
      return None;
    };

    let mut commit_mask = if committed {
      CommitMask::FULL
    } else {
      CommitMask::EMPTY
    };
    let (commit_size, wanted) = if commit {
      (segment_size, CommitMask::FULL)
    } else {
      let granules = divide_up(info_slices * SLICE_SIZE, COMMIT_SIZE);
      (granules * COMMIT_SIZE, CommitMask::new(0, granules))
    };
    if !commit_mask.all_set(wanted) {
      let ok = unsafe {
        self
          .rt
          .os()
          .commit(block.ptr.as_ptr(), commit_size, &mut is_zero)
      };
      if !ok {
        log::warn!("unable to commit {} bytes of a new segment", commit_size);
        unsafe { self.rt.arena().free(block.ptr, segment_size, block.memid, false) };
        self.rt.release_slot(id);
        return None;
      }
      commit_mask.set(wanted);
    }

    self.track_alloc(segment_size);
    let seg = self.seg_mut(id);
    seg.base = block.ptr.as_ptr();
    seg.memid = block.memid;
    seg.mem_is_pinned = pinned;
    seg.mem_is_large = mem_large;
    seg.mem_is_committed = commit_mask.is_full();
    seg.commit_mask = commit_mask;
    seg.zero_from = if is_zero { 0 } else { usize::MAX };
    seg.segment_slices = segment_size / SLICE_SIZE;
    log::debug!("mapped segment {:?} at {:p}", id, seg.base);
    Some(id)
  }

  /// Returns the segment's memory to the arena and releases its slot.
  fn segment_os_free(&mut self, id: SegmentId) {
    self.rt.slot(id).thread_id.store(NO_THREAD, Ordering::Relaxed);
    let size = self.seg(id).size();
    self.track_free(size);

    let (seg, rt) = self.seg_rt(id);
    if rt.options().guard_pages {
      // Parts of the segment may be decommitted, so only the guards are unprotected
      let page_size = rt.os().page_size();
      unsafe {
        rt.os().unprotect(seg.at(seg.info_size() - page_size), page_size);
        rt.os().unprotect(seg.at(size - page_size), page_size);
      }
    }

    let Some(base) = NonNull::new(seg.base) else {
      debug_assert!(false, "segment {id:?} is not mapped");
      return;
    };
    let committed = seg.commit_mask.committed_size(size.min(crate::SEGMENT_SIZE));
    rt.await_readers();
    unsafe { rt.arena().free(base, size, seg.memid, seg.commit_mask.is_full()) };
    seg.base = core::ptr::null_mut();
    rt.release_slot(id);
    log::debug!("returned segment {:?} ({} bytes, {} committed)", id, size, committed);
  }

  /// Frees an empty segment into the cache, or to the arena when `force`d or
  /// the cache refuses it.
  fn segment_free(&mut self, id: SegmentId, force: bool) {
    let (kind, entries) = {
      let seg = self.seg(id);
      debug_assert_eq!(seg.used, 0);
      (seg.kind, seg.slice_entries)
    };

    let mut i = 0;
    while i < entries {
      let s = self.slice_at(id, i);
      debug_assert!(s.slice_count > 0 && s.slice_offset == 0);
      debug_assert!(i == 0 || s.is_free(), "freeing segment {id:?} with a used page");
      if s.is_free() && kind != SegmentKind::Huge {
        self.remove_from_queue(SpanRef::new(id, i));
      }
      i += (s.slice_count as usize).max(1);
    }

    if !force && self.cache_push(id) {
      log::debug!("cached segment {:?} ({} cached)", id, self.cache.len());
    } else {
      self.segment_os_free(id);
    }
  }

  fn cache_push(&mut self, id: SegmentId) -> bool {
    if self.seg(id).segment_slices != SLICES_PER_SEGMENT {
      return false;
    }
    let opts = self.rt.options();
    let bound = opts
      .segment_cache
      .min(1 + self.peak_count / opts.cache_fraction.max(1));
    if bound == 0 {
      return false;
    }
    while self.cache.len() >= bound {
      let Some(oldest) = self.cache.pop_back() else {
        break;
      };
      log::debug!("evicting cached segment {:?}", oldest);
      self.segment_os_free(oldest);
    }
    self.cache.push_front(id);
    true
  }

  fn cache_pop(&mut self) -> Option<SegmentId> {
    let id = self.cache.pop_front()?;
    debug_assert_eq!(self.seg(id).segment_slices, SLICES_PER_SEGMENT);
    Some(id)
  }

  /// Returns every cached segment to the arena.
  pub fn collect(&mut self) {
    while let Some(id) = self.cache_pop() {
      self.segment_os_free(id);
    }
  }

  // ===========================================================================
  // Pages
  // ===========================================================================

  /// Frees the page's span. Works on abandoned segments.
  fn page_clear(&mut self, page: PageRef) -> SpanRef {
    let id = page.segment();
    let index = page.slice();
    let reset = self.rt.options().page_reset;
    let (seg, rt) = self.seg_rt(id);
    debug_assert!(seg.used > 0);
    debug_assert!(seg.slices[index].is_used());

    if reset && !seg.mem_is_pinned && !seg.slices[index].page.is_reset {
      let size = seg.slices[index].slice_count as usize * SLICE_SIZE;
      seg.slices[index].page.is_reset = true;
      // Failing to reset only keeps the contents resident
      unsafe { rt.os().reset(seg.page_start(index), size) };
    }

    let s = &mut seg.slices[index];
    s.page.is_zero_init = false;
    s.xblock_size = 1;

    let span = self.span_free_coalesce(SpanRef::new(id, index));
    self.seg_mut(id).used -= 1;
    span
  }

  /// Frees a page whose blocks are all free.
  ///
  /// An empty segment goes to the cache (or the arena when `force`); a
  /// segment left with only abandoned pages is abandoned. Huge pages are
  /// released with [`Segments::huge_page_free`].
  pub fn page_free(&mut self, page: PageRef, force: bool) {
    self.check_owner(page.segment());
    log::trace!("page free {:?}", page);
    self.page_free_owned(page, force);
  }

  fn page_free_owned(&mut self, page: PageRef, force: bool) {
    let id = page.segment();
    self.page_clear(page);
    let seg = self.seg(id);
    let (used, abandoned) = (seg.used, seg.abandoned);
    if used == 0 {
      self.segment_free(id, force);
    } else if used == abandoned {
      self.segment_abandon(id);
    } else {
      self.tripwire(id);
    }
  }

  /// Gives up ownership of a page that still has live blocks. Once every
  /// used page of the segment is abandoned the whole segment is put on the
  /// abandoned list for other threads to reclaim.
  pub fn page_abandon(&mut self, page: PageRef) {
    let id = page.segment();
    self.check_owner(id);
    let seg = self.seg_mut(id);
    debug_assert_eq!(seg.kind, SegmentKind::Normal, "huge pages are never abandoned");
    seg.abandoned += 1;
    debug_assert!(seg.abandoned <= seg.used);
    let all_abandoned = seg.used == seg.abandoned;
    log::trace!("page abandon {:?}", page);
    if all_abandoned {
      self.segment_abandon(id);
    } else {
      self.tripwire(id);
    }
  }

  fn segment_abandon(&mut self, id: SegmentId) {
    {
      let seg = self.seg(id);
      debug_assert!(seg.used > 0 && seg.used == seg.abandoned);
      debug_assert_eq!(seg.abandoned_visits, 0);
    }
    self.tripwire(id);

    // Free spans leave the queues but stay free
    let entries = self.seg(id).slice_entries;
    let mut i = 0;
    while i < entries {
      let s = self.slice_at(id, i);
      if s.is_free() {
        self.remove_from_queue(SpanRef::new(id, i));
        self.seg_mut(id).slices[i].xblock_size = 0;
      }
      i += (s.slice_count as usize).max(1);
    }

    let force = self.rt.options().abandoned_page_reset;
    let (seg, rt) = self.seg_rt(id);
    seg.delayed_decommit(rt, force);
    seg.abandoned_visits = 1;
    let size = seg.size();
    self.track_free(size);
    self.rt.slot(id).thread_id.store(NO_THREAD, Ordering::Release);
    self.rt.abandoned_push(id);
    log::debug!("abandoned segment {:?}", id);
  }

  // ===========================================================================
  // Reclaim
  // ===========================================================================

  /// Slice indices of the spans after the header, re-read after each step.
  fn first_after_header(&self, id: SegmentId) -> (usize, usize) {
    let seg = self.seg(id);
    debug_assert!(seg.slices[0].slice_count > 0 && seg.slices[0].is_used());
    (seg.slices[0].slice_count as usize, seg.slice_entries)
  }

  /// Collects concurrent frees in an abandoned segment, clearing pages that
  /// became empty. True if a free span of `slices_needed` or a non-full page
  /// of `block_size` exists.
  fn check_free(
    &mut self,
    id: SegmentId,
    slices_needed: usize,
    block_size: u32,
    heap: &mut dyn Heap,
  ) -> bool {
    debug_assert!(self.is_abandoned(id));
    let mut has_page = false;
    let (mut i, entries) = self.first_after_header(id);
    while i < entries {
      let s = self.slice_at(id, i);
      debug_assert!(s.slice_count > 0 && s.slice_offset == 0);
      if s.is_used() {
        let page = PageRef::new(id, i);
        heap.collect(page);
        if heap.all_free(page) {
          self.seg_mut(id).abandoned -= 1;
          i = self.page_clear(page).index();
          if self.slice_at(id, i).slice_count as usize >= slices_needed {
            has_page = true;
          }
        } else if s.xblock_size == block_size && heap.has_available(page) {
          has_page = true;
        }
      } else if s.slice_count as usize >= slices_needed {
        has_page = true;
      }
      i += (self.slice_at(id, i).slice_count as usize).max(1);
    }
    has_page
  }

  /// Takes ownership of a popped abandoned segment. Pages go to `heap`, free
  /// spans to this thread's queues. The segment is freed (and None returned)
  /// when it ends up empty; the flag tells whether a non-full page of
  /// `requested_block_size` was handed to the heap.
  fn reclaim(
    &mut self,
    id: SegmentId,
    heap: &mut dyn Heap,
    requested_block_size: u32,
  ) -> (Option<SegmentId>, bool) {
    let mut right_page_reclaimed = false;
    self.rt.slot(id).thread_id.store(self.thread_id, Ordering::Relaxed);
    let seg = self.seg_mut(id);
    seg.abandoned_visits = 0;
    let size = seg.size();
    self.track_alloc(size);

    let (mut i, entries) = self.first_after_header(id);
    while i < entries {
      let s = self.slice_at(id, i);
      debug_assert!(s.slice_count > 0 && s.slice_offset == 0);
      if s.is_used() {
        let page = PageRef::new(id, i);
        debug_assert!(s.page.is_committed && !s.page.is_reset);
        self.seg_mut(id).abandoned -= 1;
        heap.collect(page);
        if heap.all_free(page) {
          i = self.page_clear(page).index();
        } else {
          heap.reclaim(page);
          if s.xblock_size == requested_block_size && heap.has_available(page) {
            right_page_reclaimed = true;
          }
        }
      } else {
        i = self.span_free_coalesce(SpanRef::new(id, i)).index();
      }
      i += (self.slice_at(id, i).slice_count as usize).max(1);
    }

    let seg = self.seg(id);
    debug_assert_eq!(seg.abandoned, 0);
    let used = seg.used;
    log::debug!("reclaimed segment {:?} ({} pages live)", id, used);
    if used == 0 {
      debug_assert!(!right_page_reclaimed);
      self.segment_free(id, false);
      (None, false)
    } else {
      self.tripwire(id);
      (Some(id), right_page_reclaimed)
    }
  }

  /// Reclaims every abandoned segment into this thread.
  pub fn abandoned_reclaim_all(&mut self, heap: &mut dyn Heap) {
    while let Some(id) = self.rt.abandoned_pop() {
      self.reclaim(id, heap, 0);
    }
  }

  /// Looks at a bounded number of abandoned segments for one with a free
  /// span of `needed_slices` or a non-full page of `block_size`.
  ///
  /// Empty segments are freed, often-visited ones reclaimed unconditionally and
  /// the rest parked on the visited list.
  pub fn try_reclaim(
    &mut self,
    heap: &mut dyn Heap,
    needed_slices: usize,
    block_size: usize,
  ) -> Reclaimed {
    let block_size = block_size_marker(block_size);
    let (max_tries, force_visits) = {
      let opts = self.rt.options();
      (opts.reclaim_max_tries, opts.reclaim_force_visits)
    };

    for _ in 0..max_tries {
      let Some(id) = self.rt.abandoned_pop() else {
        break;
      };
      let visits = {
        let seg = self.seg_mut(id);
        seg.abandoned_visits += 1;
        seg.abandoned_visits
      };
      let has_page = self.check_free(id, needed_slices, block_size, heap);
      if self.seg(id).used == 0 {
        self.reclaim(id, heap, 0);
      } else if has_page {
        let (segment, right_page_reclaimed) = self.reclaim(id, heap, block_size);
        return Reclaimed {
          segment,
          right_page_reclaimed,
        };
      } else if visits > force_visits {
        self.reclaim(id, heap, 0);
      } else {
        let (seg, rt) = self.seg_rt(id);
        seg.delayed_decommit(rt, false);
        rt.visited_push(id);
      }
    }
    Reclaimed::default()
  }

  /// A segment with room for `needed_slices`: cached, reclaimed or fresh.
  /// None when out of memory or when a fitting page went to the heap.
  fn reclaim_or_alloc(
    &mut self,
    heap: &mut dyn Heap,
    needed_slices: usize,
    block_size: usize,
  ) -> Option<SegmentId> {
    debug_assert!(block_size <= LARGE_OBJ_SIZE_MAX);
    if let Some(id) = self.cache_pop() {
      return self.segment_init(Some(id), 0).map(|(id, _)| id);
    }

    let reclaimed = self.try_reclaim(heap, needed_slices, block_size);
    if reclaimed.right_page_reclaimed {
      return None;
    }
    if reclaimed.segment.is_some() {
      return reclaimed.segment;
    }

    self.segment_init(None, 0).map(|(id, _)| id)
  }

  // ===========================================================================
  // Page allocation
  // ===========================================================================

  fn segments_page_alloc(
    &mut self,
    heap: &mut dyn Heap,
    required: usize,
    block_size: usize,
  ) -> Option<PageRef> {
    debug_assert!(required <= LARGE_OBJ_SIZE_MAX);
    let align = if required > MEDIUM_PAGE_SIZE {
      MEDIUM_PAGE_SIZE
    } else {
      SLICE_SIZE
    };
    let slices_needed = align_up(required, align) / SLICE_SIZE;

    loop {
      match self.find_and_allocate(slices_needed) {
        Ok(page) => {
          let (seg, rt) = self.seg_rt(page.segment());
          seg.delayed_decommit(rt, false);
          return Some(page);
        }
        Err(Miss::CommitFailed) => return None,
        Err(Miss::NoSpan) => {
          self.reclaim_or_alloc(heap, slices_needed, block_size)?;
        }
      }
    }
  }

  fn huge_page_alloc(&mut self, size: usize) -> Option<PageRef> {
    let (id, page) = self.segment_init(None, size)?;
    let page = page?;
    let seg = self.seg_mut(id);
    debug_assert_eq!(seg.used, 1);
    seg.slices[page.slice()].xblock_size = block_size_marker(size);
    let seg_size = seg.size();
    // Huge segments have no owner; any thread may read or free them
    self.track_free(seg_size);
    let slot = self.rt.slot(id);
    slot.huge.store(true, Ordering::Relaxed);
    slot.thread_id.store(NO_THREAD, Ordering::Release);
    Some(page)
  }

  /// A page for blocks of `block_size` bytes.
  ///
  /// Small blocks get a single slice, medium blocks a `MEDIUM_PAGE_SIZE`
  /// page, large blocks a page of their own and anything above
  /// `LARGE_OBJ_SIZE_MAX` a dedicated huge segment. None when memory ran out,
  /// or when reclaiming an abandoned segment handed the heap a non-full page
  /// of this block size.
  pub fn page_alloc(&mut self, heap: &mut dyn Heap, block_size: usize) -> Option<PageRef> {
    let page = if block_size <= SMALL_OBJ_SIZE_MAX {
      self.segments_page_alloc(heap, block_size, block_size)
    } else if block_size <= MEDIUM_OBJ_SIZE_MAX {
      self.segments_page_alloc(heap, MEDIUM_PAGE_SIZE, block_size)
    } else if block_size <= LARGE_OBJ_SIZE_MAX {
      self.segments_page_alloc(heap, block_size, block_size)
    } else {
      let page = self.huge_page_alloc(block_size);
      log::trace!("huge page alloc {} -> {:?}", block_size, page);
      return page;
    };

    let page = page?;
    self.seg_mut(page.segment()).slices[page.slice()].xblock_size = block_size_marker(block_size);
    log::trace!("page alloc {} -> {:?}", block_size, page);
    self.tripwire(page.segment());
    Some(page)
  }

  /// Frees the last block of a huge page from any thread, then the page and
  /// its segment.
  pub fn huge_page_free(&mut self, heap: &mut dyn Heap, page: PageRef, block: NonNull<u8>) {
    let id = page.segment();
    let claimed = self
      .rt
      .slot(id)
      .thread_id
      .compare_exchange(NO_THREAD, self.thread_id, Ordering::AcqRel, Ordering::Relaxed)
      .is_ok();
    debug_assert!(claimed, "huge segment {id:?} already has an owner");
    if !claimed {
      log::warn!("huge segment {:?} already has an owner", id);
      return;
    }

    let seg = self.seg(id);
    debug_assert_eq!(seg.kind, SegmentKind::Huge);
    let size = seg.size();
    self.track_alloc(size);
    heap.free_block(page, block);
    self.page_free_owned(page, true);
  }

  // ===========================================================================
  // Page accessors
  // ===========================================================================
  //
  // Callable by the owning thread, and by any thread on an ownerless huge
  // page; other calls panic.

  fn page_slice(&self, page: PageRef) -> Slice {
    self.check_reader(page.segment());
    self.slice_at(page.segment(), page.slice())
  }

  pub fn page_start(&self, page: PageRef) -> *mut u8 {
    self.check_reader(page.segment());
    self.seg(page.segment()).page_start(page.slice())
  }

  /// Bytes spanned by the page.
  pub fn page_size(&self, page: PageRef) -> usize {
    self.page_slice_count(page) * SLICE_SIZE
  }

  pub fn page_slice_count(&self, page: PageRef) -> usize {
    self.page_slice(page).slice_count as usize
  }

  /// Block size of the page, capped at `HUGE_BLOCK_SIZE`.
  pub fn page_block_size(&self, page: PageRef) -> usize {
    self.page_slice(page).xblock_size as usize
  }

  pub fn page_is_committed(&self, page: PageRef) -> bool {
    self.page_slice(page).page.is_committed
  }

  pub fn page_is_reset(&self, page: PageRef) -> bool {
    self.page_slice(page).page.is_reset
  }

  /// The page's memory is known to be zeroed.
  pub fn page_is_zero_init(&self, page: PageRef) -> bool {
    self.page_slice(page).page.is_zero_init
  }

  // ===========================================================================
  // Introspection
  // ===========================================================================

  /// The runs of a segment owned by this thread, in slice order.
  pub fn segment_spans(&self, id: SegmentId) -> Vec<SpanInfo> {
    self.check_owner(id);
    let entries = self.seg(id).slice_entries;
    let mut spans = Vec::new();
    let mut i = 0;
    while i < entries {
      let s = self.slice_at(id, i);
      spans.push(SpanInfo {
        segment: id,
        index: i,
        slice_count: s.slice_count as usize,
        is_used: s.is_used(),
      });
      i += (s.slice_count as usize).max(1);
    }
    spans
  }

  /// Free spans queued in `bin`, front to back.
  pub fn queued_spans(&self, bin: usize) -> Vec<SpanInfo> {
    let mut spans = Vec::new();
    let mut cur = self.spans[bin].first;
    while let Some(r) = cur {
      let s = self.slice_at(r.segment, r.index());
      spans.push(SpanInfo {
        segment: r.segment,
        index: r.index(),
        slice_count: s.slice_count as usize,
        is_used: s.is_used(),
      });
      cur = s.next;
    }
    spans
  }

  /// Every queued span of `id` lies in the length range of its bin.
  fn validate_bins(&self, id: SegmentId) -> Result<(), InvariantError> {
    let mut min = 0;
    for (bin, q) in self.spans.iter().enumerate() {
      let mut cur = q.first;
      while let Some(r) = cur {
        let s = self.slice_at(r.segment, r.index());
        let count = s.slice_count as usize;
        if r.segment == id && (count < min || count > q.slice_count) {
          return Err(InvariantError::MisbinnedSpan {
            index: r.index(),
            bin,
          });
        }
        cur = s.next;
      }
      min = q.slice_count + 1;
    }
    Ok(())
  }

  /// Checks the metadata of a segment owned by this thread. Cached segments always pass.
  pub fn validate(&self, id: SegmentId) -> Result<(), InvariantError> {
    if self.rt.owner(id) != self.thread_id {
      return Err(InvariantError::NotOwned(id));
    }
    if self.cache.contains(&id) {
      return Ok(());
    }

    let seg = self.seg(id);
    if seg.abandoned > seg.used {
      return Err(InvariantError::AbandonedExceedsUsed {
        used: seg.used,
        abandoned: seg.abandoned,
      });
    }
    if !seg.commit_mask.all_set(seg.decommit_mask) {
      return Err(InvariantError::DecommitNotCommitted {
        commit: seg.commit_mask.bits(),
        decommit: seg.decommit_mask.bits(),
      });
    }
    self.validate_bins(id)?;

    let entries = seg.slice_entries;
    let huge = seg.kind == SegmentKind::Huge;
    let mut used_count = 0;
    let mut index = 0;
    while index < entries {
      let s = seg.slices[index];
      if s.slice_count == 0 || s.slice_offset != 0 {
        return Err(InvariantError::Gap { index });
      }
      let count = s.slice_count as usize;
      let maxindex = (index + count).min(entries) - 1;

      if s.is_used() {
        used_count += 1;
        for i in 1..=MAX_SLICE_OFFSET {
          if index + i > maxindex {
            break;
          }
          let t = &seg.slices[index + i];
          if t.slice_offset as usize != i || t.slice_count != 0 || t.xblock_size != 1 {
            return Err(InvariantError::BadBackOffset { index: index + i });
          }
        }
        let last = index + count - 1;
        if last > index && last < entries {
          let t = &seg.slices[last];
          if t.slice_offset as usize != count - 1 || t.slice_count != 0 || t.xblock_size != 1 {
            return Err(InvariantError::BadBackOffset { index: last });
          }
        }
      } else {
        let last = &seg.slices[maxindex];
        let offset_checked = !huge || count <= entries - seg.segment_info_slices;
        if (offset_checked && maxindex - last.slice_offset as usize != index)
          || (maxindex != index && last.slice_count != 0)
          || !(last.xblock_size == 0 || (huge && last.xblock_size == 1))
        {
          return Err(InvariantError::BadBackOffset { index: maxindex });
        }
        if !huge && !self.queue_contains(slice_bin(count), SpanRef::new(id, index)) {
          return Err(InvariantError::UnqueuedFreeSpan { index });
        }
      }
      index = maxindex + 1;
    }

    if index != entries {
      return Err(InvariantError::Overrun {
        end: index,
        expected: entries,
      });
    }
    if used_count != seg.used + 1 {
      return Err(InvariantError::UsedCount {
        expected: seg.used + 1,
        found: used_count,
      });
    }
    Ok(())
  }
}

impl Drop for Segments {
  fn drop(&mut self) {
    self.collect();
  }
}
