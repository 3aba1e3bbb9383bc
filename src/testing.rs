//! Test doubles for the OS, arena, clock and heap collaborators.

use core::{
  ptr::NonNull,
  sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering},
};
use std::{
  collections::HashMap,
  sync::{Arc, Mutex},
};

use crate::{
  PageRef, SEGMENT_SIZE, align_up,
  heap::Heap,
  options::Options,
  os::{Arena, ArenaBlock, Clock, MemId, Msecs, Os},
  runtime::Runtime,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum OsOp {
  Commit,
  Decommit,
  Protect,
  Unprotect,
  Reset,
}

#[derive(Default)]
struct OsLog {
  calls: Mutex<Vec<(OsOp, usize, usize)>>,
  fail_commit: AtomicBool,
}

/// Records every call; never touches memory.
#[derive(Clone, Default)]
pub(crate) struct MockOs(Arc<OsLog>);

impl MockOs {
  pub(crate) fn calls(&self, op: OsOp) -> Vec<(usize, usize)> {
    let calls = self.0.calls.lock().unwrap();
    calls
      .iter()
      .filter(|(o, _, _)| *o == op)
      .map(|&(_, addr, size)| (addr, size))
      .collect()
  }

  /// Every call in the order it was made.
  pub(crate) fn history(&self) -> Vec<(OsOp, usize, usize)> {
    self.0.calls.lock().unwrap().clone()
  }

  /// True if the last call touching `addr` protected it.
  pub(crate) fn is_protected(&self, addr: usize) -> bool {
    self
      .history()
      .iter()
      .rev()
      .find(|&&(_, start, size)| start <= addr && addr < start + size)
      .is_some_and(|&(op, _, _)| op == OsOp::Protect)
  }

  pub(crate) fn count(&self, op: OsOp) -> usize {
    self.calls(op).len()
  }

  pub(crate) fn clear(&self) {
    self.0.calls.lock().unwrap().clear();
  }

  pub(crate) fn fail_commits(&self, fail: bool) {
    self.0.fail_commit.store(fail, Ordering::Relaxed);
  }

  fn record(&self, op: OsOp, addr: *mut u8, size: usize) {
    self.0.calls.lock().unwrap().push((op, addr as usize, size));
  }
}

impl Os for MockOs {
  fn page_size(&self) -> usize {
    4096
  }

  unsafe fn commit(&self, addr: *mut u8, size: usize, _is_zero: &mut bool) -> bool {
    self.record(OsOp::Commit, addr, size);
    !self.0.fail_commit.load(Ordering::Relaxed)
  }

  unsafe fn decommit(&self, addr: *mut u8, size: usize) -> bool {
    self.record(OsOp::Decommit, addr, size);
    true
  }

  unsafe fn protect(&self, addr: *mut u8, size: usize) -> bool {
    self.record(OsOp::Protect, addr, size);
    true
  }

  unsafe fn unprotect(&self, addr: *mut u8, size: usize) -> bool {
    self.record(OsOp::Unprotect, addr, size);
    true
  }

  unsafe fn reset(&self, addr: *mut u8, size: usize) -> bool {
    self.record(OsOp::Reset, addr, size);
    true
  }
}

struct ArenaState {
  next: AtomicUsize,
  live: Mutex<HashMap<usize, usize>>,
  freed: Mutex<Vec<usize>>,
  fail: AtomicBool,
  reserve_only: AtomicBool,
}

impl Default for ArenaState {
  fn default() -> Self {
    Self {
      next: AtomicUsize::new(1 << 40),
      live: Mutex::new(HashMap::new()),
      freed: Mutex::new(Vec::new()),
      fail: AtomicBool::new(false),
      reserve_only: AtomicBool::new(false),
    }
  }
}

/// Hands out aligned addresses that are never mapped.
#[derive(Clone, Default)]
pub(crate) struct MockArena(Arc<ArenaState>);

impl MockArena {
  pub(crate) fn live(&self) -> usize {
    self.0.live.lock().unwrap().len()
  }

  /// Base addresses returned so far, oldest first.
  pub(crate) fn freed(&self) -> Vec<usize> {
    self.0.freed.lock().unwrap().clone()
  }

  pub(crate) fn fail_allocs(&self, fail: bool) {
    self.0.fail.store(fail, Ordering::Relaxed);
  }

  /// Hands out memory that is reserved but never committed.
  pub(crate) fn reserve_only(&self, reserve: bool) {
    self.0.reserve_only.store(reserve, Ordering::Relaxed);
  }
}

impl Arena for MockArena {
  fn alloc_aligned(
    &self,
    size: usize,
    align: usize,
    commit: &mut bool,
    large: &mut bool,
    pinned: &mut bool,
    zero: &mut bool,
  ) -> Option<ArenaBlock> {
    if self.0.fail.load(Ordering::Relaxed) {
      return None;
    }
    let span = align_up(size, align.max(SEGMENT_SIZE));
    let addr = self.0.next.fetch_add(span, Ordering::Relaxed);
    self.0.live.lock().unwrap().insert(addr, size);
    if self.0.reserve_only.load(Ordering::Relaxed) {
      *commit = false;
    }
    *large = false;
    *pinned = false;
    *zero = true;
    Some(ArenaBlock {
      ptr: NonNull::new(addr as *mut u8)?,
      memid: MemId(addr),
    })
  }

  unsafe fn free(&self, ptr: NonNull<u8>, size: usize, memid: MemId, _committed: bool) {
    let addr = ptr.as_ptr() as usize;
    assert_eq!(memid, MemId(addr));
    let recorded = self.0.live.lock().unwrap().remove(&addr);
    assert_eq!(recorded, Some(size), "freeing unknown block {addr:#x}");
    self.0.freed.lock().unwrap().push(addr);
  }
}

#[derive(Clone, Default)]
pub(crate) struct MockClock(Arc<AtomicI64>);

impl MockClock {
  pub(crate) fn advance(&self, ms: Msecs) {
    self.0.fetch_add(ms, Ordering::Relaxed);
  }
}

impl Clock for MockClock {
  fn now(&self) -> Msecs {
    self.0.load(Ordering::Relaxed)
  }
}

/// A runtime over mocks, with handles to inspect them.
pub(crate) struct Rig {
  pub(crate) rt: Arc<Runtime>,
  pub(crate) os: MockOs,
  pub(crate) arena: MockArena,
  pub(crate) clock: MockClock,
}

pub(crate) fn rig(options: Options) -> Rig {
  let os = MockOs::default();
  let arena = MockArena::default();
  let clock = MockClock::default();
  let rt = Runtime::with_parts(options, os.clone(), arena.clone(), clock.clone());
  Rig { rt, os, arena, clock }
}

// =============================================================================
// Heap
// =============================================================================

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct PageState {
  pub(crate) capacity: usize,
  pub(crate) used: usize,
  /// Blocks freed by other threads, not yet collected.
  pub(crate) remote: usize,
}

pub(crate) type PageTable = Arc<Mutex<HashMap<PageRef, PageState>>>;

/// Heap whose block counts live in a table shared by all test threads.
#[derive(Default)]
pub(crate) struct TestHeap {
  pub(crate) pages: PageTable,
  pub(crate) reclaimed: Vec<PageRef>,
  pub(crate) freed_blocks: Vec<(PageRef, usize)>,
}

impl TestHeap {
  pub(crate) fn sharing(pages: &PageTable) -> Self {
    Self {
      pages: Arc::clone(pages),
      ..Self::default()
    }
  }

  pub(crate) fn fill(&self, page: PageRef, capacity: usize, used: usize) {
    let state = PageState {
      capacity,
      used,
      remote: 0,
    };
    self.pages.lock().unwrap().insert(page, state);
  }

  /// Frees `n` blocks as another thread would.
  pub(crate) fn remote_free(&self, page: PageRef, n: usize) {
    let mut pages = self.pages.lock().unwrap();
    let state = pages.get_mut(&page).unwrap();
    state.remote += n;
  }
}

impl Heap for TestHeap {
  fn collect(&mut self, page: PageRef) {
    if let Some(state) = self.pages.lock().unwrap().get_mut(&page) {
      state.used -= state.remote;
      state.remote = 0;
    }
  }

  fn all_free(&self, page: PageRef) -> bool {
    self.pages.lock().unwrap().get(&page).is_none_or(|s| s.used == 0)
  }

  fn has_available(&self, page: PageRef) -> bool {
    self
      .pages
      .lock()
      .unwrap()
      .get(&page)
      .is_some_and(|s| s.used < s.capacity)
  }

  fn reclaim(&mut self, page: PageRef) {
    self.reclaimed.push(page);
  }

  fn free_block(&mut self, page: PageRef, block: NonNull<u8>) {
    if let Some(state) = self.pages.lock().unwrap().get_mut(&page) {
      state.used = state.used.saturating_sub(1);
    }
    self.freed_blocks.push((page, block.as_ptr() as usize));
  }
}
