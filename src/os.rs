//! OS, arena and clock collaborators, with `libc`-backed defaults.

use core::ptr::{NonNull, null_mut};
use std::{sync::OnceLock, time::Instant};

/// Milliseconds on a monotonic clock.
pub type Msecs = i64;

/// Identifies how the arena produced a block, echoed back on free.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct MemId(pub usize);

/// Memory obtained from an [`Arena`].
#[derive(Clone, Copy, Debug)]
pub struct ArenaBlock {
  pub ptr: NonNull<u8>,
  pub memid: MemId,
}

/// Virtual-memory primitives over ranges handed out by an [`Arena`].
///
/// # Safety
///
/// Every method takes a range that must lie inside a block returned by the
/// arena that is still allocated. Callers guarantee no live Rust reference
/// points into a range that is decommitted, protected or reset.
pub trait Os: Send + Sync {
  fn page_size(&self) -> usize;

  /// Backs the range with memory. `is_zero` is set when the memory is known zeroed.
  unsafe fn commit(&self, addr: *mut u8, size: usize, is_zero: &mut bool) -> bool;
  unsafe fn decommit(&self, addr: *mut u8, size: usize) -> bool;
  unsafe fn protect(&self, addr: *mut u8, size: usize) -> bool;
  unsafe fn unprotect(&self, addr: *mut u8, size: usize) -> bool;
  /// Tells the OS the contents are no longer needed; the range stays committed.
  unsafe fn reset(&self, addr: *mut u8, size: usize) -> bool;
}

/// Address-space provider for segments.
pub trait Arena: Send + Sync {
  /// Allocates `size` bytes aligned to `align`. The in/out flags report what
  /// the caller wants and what it actually got.
  fn alloc_aligned(
    &self,
    size: usize,
    align: usize,
    commit: &mut bool,
    large: &mut bool,
    pinned: &mut bool,
    zero: &mut bool,
  ) -> Option<ArenaBlock>;

  /// Returns a block. `committed` is true when the caller counts the block as
  /// fully committed.
  ///
  /// # Safety
  ///
  /// `ptr`/`size`/`memid` must describe a block previously returned by
  /// [`Arena::alloc_aligned`] that is not referenced anymore.
  unsafe fn free(&self, ptr: NonNull<u8>, size: usize, memid: MemId, committed: bool);
}

pub trait Clock: Send + Sync {
  fn now(&self) -> Msecs;
}

// =============================================================================
// Platform
// =============================================================================

/// `mprotect`/`madvise` on the calling process.
#[derive(Clone, Copy, Default, Debug)]
pub struct SystemOs;

pub fn os_page_size() -> usize {
  static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
  *PAGE_SIZE.get_or_init(|| {
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n <= 0 { 4096 } else { n as usize }
  })
}

impl Os for SystemOs {
  fn page_size(&self) -> usize {
    os_page_size()
  }

  // Leaves `is_zero` alone: a range that was only reset may keep stale contents.
  unsafe fn commit(&self, addr: *mut u8, size: usize, _is_zero: &mut bool) -> bool {
    let ok = unsafe { libc::mprotect(addr.cast(), size, libc::PROT_READ | libc::PROT_WRITE) } == 0;
    if !ok {
      log::warn!("commit failed: {:p} {} bytes (errno {})", addr, size, errno());
    }
    ok
  }

  unsafe fn decommit(&self, addr: *mut u8, size: usize) -> bool {
    let ok = unsafe {
      libc::madvise(addr.cast(), size, libc::MADV_DONTNEED) == 0
        && libc::mprotect(addr.cast(), size, libc::PROT_NONE) == 0
    };
    if !ok {
      log::warn!("decommit failed: {:p} {} bytes (errno {})", addr, size, errno());
    }
    ok
  }

  unsafe fn protect(&self, addr: *mut u8, size: usize) -> bool {
    unsafe { libc::mprotect(addr.cast(), size, libc::PROT_NONE) == 0 }
  }

  unsafe fn unprotect(&self, addr: *mut u8, size: usize) -> bool {
    unsafe { libc::mprotect(addr.cast(), size, libc::PROT_READ | libc::PROT_WRITE) == 0 }
  }

  unsafe fn reset(&self, addr: *mut u8, size: usize) -> bool {
    #[cfg(target_os = "linux")]
    let advice = libc::MADV_FREE;
    #[cfg(not(target_os = "linux"))]
    let advice = libc::MADV_DONTNEED;
    unsafe { libc::madvise(addr.cast(), size, advice) == 0 }
  }
}

fn errno() -> i32 {
  std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

unsafe fn os_mmap(size: usize, commit: bool) -> *mut u8 {
  let prot = if commit {
    libc::PROT_READ | libc::PROT_WRITE
  } else {
    libc::PROT_NONE
  };
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      prot,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

/// Maps every segment straight from the OS, trimming the alignment slack.
#[derive(Clone, Copy, Default, Debug)]
pub struct SystemArena;

impl Arena for SystemArena {
  fn alloc_aligned(
    &self,
    size: usize,
    align: usize,
    commit: &mut bool,
    large: &mut bool,
    pinned: &mut bool,
    zero: &mut bool,
  ) -> Option<ArenaBlock> {
    debug_assert!(align.is_power_of_two());
    let total = size.checked_add(align)?;
    let raw = unsafe { os_mmap(total, *commit) };
    if raw.is_null() {
      log::warn!("unable to map {} bytes (errno {})", total, errno());
      return None;
    }

    let start = crate::align_up(raw as usize, align);
    let front = start - raw as usize;
    let back = total - front - size;
    unsafe {
      if front > 0 {
        os_munmap(raw, front);
      }
      if back > 0 {
        os_munmap((start + size) as *mut u8, back);
      }
    }

    *large = false;
    *pinned = false;
    *zero = true;
    NonNull::new(start as *mut u8).map(|ptr| ArenaBlock {
      ptr,
      memid: MemId::default(),
    })
  }

  unsafe fn free(&self, ptr: NonNull<u8>, size: usize, _memid: MemId, _committed: bool) {
    unsafe { os_munmap(ptr.as_ptr(), size) };
  }
}

/// Milliseconds since the clock was created.
#[derive(Clone, Copy, Debug)]
pub struct SystemClock {
  start: Instant,
}

impl Default for SystemClock {
  fn default() -> Self {
    Self {
      start: Instant::now(),
    }
  }
}

impl Clock for SystemClock {
  fn now(&self) -> Msecs {
    self.start.elapsed().as_millis() as Msecs
  }
}
