//! Runtime tuning options.

use core::str::FromStr;

use crate::os::Msecs;

/// Options read by the segment layer.
///
/// All fields only trade latency against memory; none of them is needed for
/// correctness.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Options {
  /// Maximum number of empty segments a thread keeps cached.
  pub segment_cache: usize,
  /// The cache is also bounded by `1 + peak_count / cache_fraction`.
  pub cache_fraction: usize,
  pub eager_commit: bool,
  /// The first N segments of a thread are committed lazily.
  pub eager_commit_delay: usize,
  /// Delay before a staged decommit is performed; 0 decommits right away.
  pub decommit_delay: Msecs,
  pub allow_decommit: bool,
  /// Force pending decommits when a segment is abandoned.
  pub abandoned_page_reset: bool,
  /// Reset page memory when a page is cleared.
  pub page_reset: bool,
  /// Guard pages after the segment header and at the segment end.
  pub guard_pages: bool,
  /// Abandoned segments popped per `try_reclaim` call.
  pub reclaim_max_tries: usize,
  /// A segment visited more often than this is reclaimed unconditionally.
  pub reclaim_force_visits: usize,
  /// Capacity of the runtime's segment table.
  pub max_segments: usize,
}

impl Default for Options {
  fn default() -> Self {
    Self {
      segment_cache: 4,
      cache_fraction: 8,
      eager_commit: true,
      eager_commit_delay: 1,
      decommit_delay: 100,
      allow_decommit: cfg!(feature = "release-mem"),
      abandoned_page_reset: false,
      page_reset: false,
      guard_pages: cfg!(feature = "secure"),
      reclaim_max_tries: 8,
      reclaim_force_visits: 3,
      max_segments: 1024,
    }
  }
}

impl Options {
  /// Defaults overridden by `SEGSPAN_<FIELD>` environment variables.
  pub fn from_env() -> Self {
    Self::from_lookup(|name| std::env::var(name).ok())
  }

  /// Defaults overridden through `lookup`, which maps a variable name to its value.
  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
    let mut o = Self::default();
    read(&lookup, "SEGSPAN_SEGMENT_CACHE", &mut o.segment_cache);
    read(&lookup, "SEGSPAN_CACHE_FRACTION", &mut o.cache_fraction);
    read_flag(&lookup, "SEGSPAN_EAGER_COMMIT", &mut o.eager_commit);
    read(&lookup, "SEGSPAN_EAGER_COMMIT_DELAY", &mut o.eager_commit_delay);
    read(&lookup, "SEGSPAN_DECOMMIT_DELAY", &mut o.decommit_delay);
    read_flag(&lookup, "SEGSPAN_ALLOW_DECOMMIT", &mut o.allow_decommit);
    read_flag(&lookup, "SEGSPAN_ABANDONED_PAGE_RESET", &mut o.abandoned_page_reset);
    read_flag(&lookup, "SEGSPAN_PAGE_RESET", &mut o.page_reset);
    read_flag(&lookup, "SEGSPAN_GUARD_PAGES", &mut o.guard_pages);
    read(&lookup, "SEGSPAN_RECLAIM_MAX_TRIES", &mut o.reclaim_max_tries);
    read(&lookup, "SEGSPAN_RECLAIM_FORCE_VISITS", &mut o.reclaim_force_visits);
    read(&lookup, "SEGSPAN_MAX_SEGMENTS", &mut o.max_segments);
    if o.cache_fraction == 0 {
      log::warn!("SEGSPAN_CACHE_FRACTION must be positive, using 1");
      o.cache_fraction = 1;
    }
    o
  }
}

fn read<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, slot: &mut T) {
  let Some(raw) = lookup(name) else {
    return;
  };
  match raw.trim().parse() {
    Ok(v) => *slot = v,
    Err(_) => log::warn!("ignoring {}={:?}: not a number", name, raw),
  }
}

fn read_flag(lookup: &impl Fn(&str) -> Option<String>, name: &str, slot: &mut bool) {
  let Some(raw) = lookup(name) else {
    return;
  };
  match raw.trim().to_ascii_lowercase().as_str() {
    "1" | "true" | "yes" | "on" => *slot = true,
    "0" | "false" | "no" | "off" => *slot = false,
    _ => log::warn!("ignoring {}={:?}: not a flag", name, raw),
  }
}
