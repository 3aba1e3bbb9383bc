#![allow(dead_code)]

use std::{
  collections::HashMap,
  ptr::NonNull,
  sync::{Arc, Mutex},
};

use segspan::{Heap, Options, PageRef};

#[derive(Clone, Copy, Debug, Default)]
pub struct Blocks {
  pub capacity: usize,
  pub live: usize,
  /// Freed by a thread other than the page owner, not yet collected.
  pub pending: usize,
}

pub type Pages = Arc<Mutex<HashMap<PageRef, Blocks>>>;

/// Block counts per page, shared by every thread of a test.
#[derive(Default)]
pub struct SharedHeap {
  pub pages: Pages,
  pub owned: Vec<PageRef>,
}

impl SharedHeap {
  pub fn new(pages: &Pages) -> Self {
    Self {
      pages: Arc::clone(pages),
      owned: Vec::new(),
    }
  }

  pub fn track(&mut self, page: PageRef, capacity: usize, live: usize) {
    let blocks = Blocks {
      capacity,
      live,
      pending: 0,
    };
    self.pages.lock().unwrap().insert(page, blocks);
    self.owned.push(page);
  }

  pub fn free_remote(&self, page: PageRef, n: usize) {
    let mut pages = self.pages.lock().unwrap();
    if let Some(b) = pages.get_mut(&page) {
      b.pending += n;
    }
  }
}

impl Heap for SharedHeap {
  fn collect(&mut self, page: PageRef) {
    if let Some(b) = self.pages.lock().unwrap().get_mut(&page) {
      b.live -= b.pending.min(b.live);
      b.pending = 0;
    }
  }

  fn all_free(&self, page: PageRef) -> bool {
    self.pages.lock().unwrap().get(&page).is_none_or(|b| b.live == 0)
  }

  fn has_available(&self, page: PageRef) -> bool {
    self
      .pages
      .lock()
      .unwrap()
      .get(&page)
      .is_some_and(|b| b.live < b.capacity)
  }

  fn reclaim(&mut self, page: PageRef) {
    self.owned.push(page);
  }

  fn free_block(&mut self, page: PageRef, _block: NonNull<u8>) {
    self.pages.lock().unwrap().remove(&page);
  }
}

pub fn options() -> Options {
  Options {
    max_segments: 256,
    ..Options::default()
  }
}
