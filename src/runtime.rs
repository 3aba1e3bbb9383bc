//! Process-wide state: the segment table and the abandoned lists.

use core::{
  cell::UnsafeCell,
  hint,
  sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

use crate::{
  SegmentId,
  options::Options,
  os::{Arena, Clock, Os, SystemArena, SystemClock, SystemOs},
  segment::Segment,
};

/// Index marking the end of an intrusive slot list.
pub(crate) const NIL: u32 = u32::MAX;

/// Owner id of segments that no thread owns.
pub(crate) const NO_THREAD: usize = 0;

// =============================================================================
// Slots
// =============================================================================

/// A stable entry of the segment table.
pub(crate) struct Slot {
  /// Next slot on whichever shared list this slot is on.
  link: AtomicU32,
  /// Owning thread; `NO_THREAD` while abandoned, huge or unused.
  pub(crate) thread_id: AtomicUsize,
  /// Holds a huge segment; set before the segment is made ownerless.
  pub(crate) huge: AtomicBool,
  segment: UnsafeCell<Segment>,
}

// The segment is only touched by the thread recorded in `thread_id`, or by the
// single thread that popped it from a shared list.
unsafe impl Sync for Slot {}
unsafe impl Send for Slot {}

impl Slot {
  fn new() -> Self {
    Self {
      link: AtomicU32::new(NIL),
      thread_id: AtomicUsize::new(NO_THREAD),
      huge: AtomicBool::new(false),
      segment: UnsafeCell::new(Segment::empty()),
    }
  }
}

// =============================================================================
// Tagged Stack
// =============================================================================

#[inline]
const fn pack(index: u32, tag: u32) -> u64 {
  ((tag as u64) << 32) | index as u64
}

#[inline]
fn unpack(word: u64) -> (u32, u32) {
  (word as u32, (word >> 32) as u32)
}

/// Treiber stack of slot indices. The head carries a tag that changes on
/// every update, so a slot that is popped and pushed again between a reader's
/// load and its CAS makes the CAS fail.
struct TaggedStack {
  head: AtomicU64,
}

impl TaggedStack {
  const fn new() -> Self {
    Self {
      head: AtomicU64::new(pack(NIL, 0)),
    }
  }

  fn is_empty(&self) -> bool {
    unpack(self.head.load(Ordering::Relaxed)).0 == NIL
  }

  fn push(&self, slots: &[Slot], index: u32) {
    let mut head = self.head.load(Ordering::Relaxed);
    loop {
      let (first, tag) = unpack(head);
      slots[index as usize].link.store(first, Ordering::Relaxed);
      match self.head.compare_exchange_weak(
        head,
        pack(index, tag.wrapping_add(1)),
        Ordering::Release,
        Ordering::Relaxed,
      ) {
        Ok(_) => return,
        Err(current) => head = current,
      }
    }
  }

  fn pop(&self, slots: &[Slot]) -> Option<u32> {
    let mut head = self.head.load(Ordering::Acquire);
    loop {
      let (first, tag) = unpack(head);
      if first == NIL {
        return None;
      }
      // May read the link of a slot that was popped meanwhile; the tag then fails the CAS.
      let next = slots[first as usize].link.load(Ordering::Relaxed);
      match self.head.compare_exchange_weak(
        head,
        pack(next, tag.wrapping_add(1)),
        Ordering::AcqRel,
        Ordering::Acquire,
      ) {
        Ok(_) => {
          slots[first as usize].link.store(NIL, Ordering::Relaxed);
          return Some(first);
        }
        Err(current) => head = current,
      }
    }
  }

  /// Installs the chain starting at `first` if the stack is empty.
  fn install_if_empty(&self, first: u32) -> bool {
    let head = self.head.load(Ordering::Relaxed);
    let (current, tag) = unpack(head);
    current == NIL
      && self
        .head
        .compare_exchange(head, pack(first, tag.wrapping_add(1)), Ordering::AcqRel, Ordering::Relaxed)
        .is_ok()
  }

  /// Prepends the chain `first..=last`, whose links are already set up.
  fn prepend(&self, slots: &[Slot], first: u32, last: u32) {
    let mut head = self.head.load(Ordering::Relaxed);
    loop {
      let (current, tag) = unpack(head);
      slots[last as usize].link.store(current, Ordering::Relaxed);
      match self.head.compare_exchange_weak(
        head,
        pack(first, tag.wrapping_add(1)),
        Ordering::Release,
        Ordering::Relaxed,
      ) {
        Ok(_) => return,
        Err(now) => head = now,
      }
    }
  }
}

// =============================================================================
// Runtime
// =============================================================================

/// Shared context of all [`Segments`](crate::Segments) instances.
///
/// Owns the segment table, the abandoned segment lists and the OS, arena and
/// clock collaborators. Segments still mapped when the runtime is dropped are
/// returned to the arena.
pub struct Runtime {
  slots: Box<[Slot]>,
  /// Slots below this index have been handed out at least once.
  fresh: AtomicUsize,
  free_slots: CachePadded<TaggedStack>,

  abandoned: CachePadded<TaggedStack>,
  /// Abandoned segments that were full when last visited. Only ever taken as a whole.
  visited: CachePadded<AtomicU32>,
  abandoned_count: CachePadded<AtomicUsize>,
  abandoned_visited_count: CachePadded<AtomicUsize>,
  /// Threads currently walking the abandoned list.
  abandoned_readers: CachePadded<AtomicUsize>,

  next_thread_id: AtomicUsize,

  os: Box<dyn Os>,
  arena: Box<dyn Arena>,
  clock: Box<dyn Clock>,
  options: Options,
}

impl Runtime {
  /// A runtime over the system OS, arena and clock.
  pub fn new(options: Options) -> Arc<Self> {
    Self::with_parts(options, SystemOs, SystemArena, SystemClock::default())
  }

  pub fn with_parts(
    options: Options,
    os: impl Os + 'static,
    arena: impl Arena + 'static,
    clock: impl Clock + 'static,
  ) -> Arc<Self> {
    let capacity = options.max_segments.min(NIL as usize);
    let slots = (0..capacity).map(|_| Slot::new()).collect();
    log::debug!("runtime with {} segment slots", capacity);
    Arc::new(Self {
      slots,
      fresh: AtomicUsize::new(0),
      free_slots: CachePadded::new(TaggedStack::new()),
      abandoned: CachePadded::new(TaggedStack::new()),
      visited: CachePadded::new(AtomicU32::new(NIL)),
      abandoned_count: CachePadded::new(AtomicUsize::new(0)),
      abandoned_visited_count: CachePadded::new(AtomicUsize::new(0)),
      abandoned_readers: CachePadded::new(AtomicUsize::new(0)),
      next_thread_id: AtomicUsize::new(NO_THREAD + 1),
      os: Box::new(os),
      arena: Box::new(arena),
      clock: Box::new(clock),
      options,
    })
  }

  pub fn options(&self) -> &Options {
    &self.options
  }

  pub(crate) fn os(&self) -> &dyn Os {
    &*self.os
  }

  pub(crate) fn arena(&self) -> &dyn Arena {
    &*self.arena
  }

  pub(crate) fn clock(&self) -> &dyn Clock {
    &*self.clock
  }

  /// Segments on the abandoned list. Approximate under concurrency.
  pub fn abandoned_count(&self) -> usize {
    self.abandoned_count.load(Ordering::Relaxed)
  }

  /// Segments on the visited list. Approximate under concurrency.
  pub fn abandoned_visited_count(&self) -> usize {
    self.abandoned_visited_count.load(Ordering::Relaxed)
  }

  pub(crate) fn new_thread_id(&self) -> usize {
    // Only uniqueness matters
    self.next_thread_id.fetch_add(1, Ordering::Relaxed)
  }

  // ===========================================================================
  // Slot table
  // ===========================================================================

  #[inline]
  pub(crate) fn slot(&self, id: SegmentId) -> &Slot {
    &self.slots[id.index()]
  }

  /// Raw access to a segment's metadata. Dereferencing requires owning the segment.
  #[inline]
  pub(crate) fn segment_ptr(&self, id: SegmentId) -> *mut Segment {
    self.slots[id.index()].segment.get()
  }

  #[inline]
  pub(crate) fn owner(&self, id: SegmentId) -> usize {
    self.slot(id).thread_id.load(Ordering::Relaxed)
  }

  pub(crate) fn alloc_slot(&self) -> Option<SegmentId> {
    if let Some(index) = self.free_slots.pop(&self.slots) {
      return Some(SegmentId::new(index as usize));
    }
    let capacity = self.slots.len();
    self
      .fresh
      .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| (n < capacity).then_some(n + 1))
      .ok()
      .map(SegmentId::new)
  }

  pub(crate) fn release_slot(&self, id: SegmentId) {
    self.slot(id).huge.store(false, Ordering::Relaxed);
    self.slot(id).thread_id.store(NO_THREAD, Ordering::Relaxed);
    self.free_slots.push(&self.slots, id.index() as u32);
  }

  // ===========================================================================
  // Abandoned lists
  // ===========================================================================

  pub(crate) fn abandoned_push(&self, id: SegmentId) {
    debug_assert_eq!(self.owner(id), NO_THREAD);
    self.abandoned.push(&self.slots, id.index() as u32);
    self.abandoned_count.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn visited_push(&self, id: SegmentId) {
    debug_assert_eq!(self.owner(id), NO_THREAD);
    let index = id.index() as u32;
    let mut head = self.visited.load(Ordering::Relaxed);
    loop {
      self.slots[id.index()].link.store(head, Ordering::Relaxed);
      match self
        .visited
        .compare_exchange_weak(head, index, Ordering::Release, Ordering::Relaxed)
      {
        Ok(_) => break,
        Err(current) => head = current,
      }
    }
    self.abandoned_visited_count.fetch_add(1, Ordering::Relaxed);
  }

  /// Moves the whole visited list onto the abandoned list.
  fn visited_revisit(&self) -> bool {
    if self.visited.load(Ordering::Relaxed) == NIL {
      return false;
    }
    let first = self.visited.swap(NIL, Ordering::AcqRel);
    if first == NIL {
      return false;
    }

    if self.abandoned.install_if_empty(first) {
      self.move_visited_counts();
      return true;
    }

    let mut last = first;
    loop {
      let next = self.slots[last as usize].link.load(Ordering::Relaxed);
      if next == NIL {
        break;
      }
      last = next;
    }
    self.abandoned.prepend(&self.slots, first, last);
    self.move_visited_counts();
    true
  }

  fn move_visited_counts(&self) {
    let count = self.abandoned_visited_count.load(Ordering::Relaxed);
    self.abandoned_count.fetch_add(count, Ordering::Relaxed);
    // Pushes racing with the move may drive this below zero for a moment
    let _ = self
      .abandoned_visited_count
      .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(count)));
  }

  /// Takes one segment off the abandoned list, refilling it from the visited list when empty.
  pub(crate) fn abandoned_pop(&self) -> Option<SegmentId> {
    if self.abandoned.is_empty() && !self.visited_revisit() {
      return None;
    }

    // Paired with the load in await_readers: the count is visible before the head is read
    self.abandoned_readers.fetch_add(1, Ordering::SeqCst);
    let popped = self.abandoned.pop(&self.slots);
    self.abandoned_readers.fetch_sub(1, Ordering::Release);

    let index = popped?;
    let _ = self
      .abandoned_count
      .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    Some(SegmentId::new(index as usize))
  }

  /// Spins until no thread is in the middle of popping an abandoned segment.
  pub fn await_readers(&self) {
    while self.abandoned_readers.load(Ordering::SeqCst) != 0 {
      hint::spin_loop();
      std::thread::yield_now();
    }
  }
}

impl Drop for Runtime {
  fn drop(&mut self) {
    let used = (*self.fresh.get_mut()).min(self.slots.len());
    let mut released = 0;
    for slot in &mut self.slots[..used] {
      let seg = slot.segment.get_mut();
      let Some(base) = core::ptr::NonNull::new(seg.base) else {
        continue;
      };
      unsafe {
        self
          .arena
          .free(base, seg.size(), seg.memid, seg.commit_mask.is_full())
      };
      seg.base = core::ptr::null_mut();
      released += 1;
    }
    if released > 0 {
      log::debug!("runtime teardown returned {} segments", released);
    }
  }
}
