use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crossbeam_utils::CachePadded;

/// A thread-safe, internal metrics collector for a store.
/// All fields are atomic to allow for lock-free updates.
#[derive(Debug)]
pub struct Metrics {
  // --- Fetches ---
  pub(crate) fetches_started: CachePadded<AtomicU64>,
  pub(crate) fetches_joined: CachePadded<AtomicU64>,
  pub(crate) fetch_failures: CachePadded<AtomicU64>,

  // --- Cache traffic ---
  pub(crate) cache_writes: CachePadded<AtomicU64>,
  pub(crate) invalidations: CachePadded<AtomicU64>,

  // --- Subscribers ---
  pub(crate) subscriptions: CachePadded<AtomicU64>,

  created_at: Instant,
}

impl Default for Metrics {
  fn default() -> Self {
    Self {
      fetches_started: CachePadded::new(AtomicU64::new(0)),
      fetches_joined: CachePadded::new(AtomicU64::new(0)),
      fetch_failures: CachePadded::new(AtomicU64::new(0)),
      cache_writes: CachePadded::new(AtomicU64::new(0)),
      invalidations: CachePadded::new(AtomicU64::new(0)),
      subscriptions: CachePadded::new(AtomicU64::new(0)),
      created_at: Instant::now(),
    }
  }
}

impl Metrics {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  #[inline]
  pub(crate) fn record(counter: &CachePadded<AtomicU64>) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  /// Creates a point-in-time snapshot of the current metrics.
  pub(crate) fn snapshot(&self) -> MetricsSnapshot {
    MetricsSnapshot {
      fetches_started: self.fetches_started.load(Ordering::Relaxed),
      fetches_joined: self.fetches_joined.load(Ordering::Relaxed),
      fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
      cache_writes: self.cache_writes.load(Ordering::Relaxed),
      invalidations: self.invalidations.load(Ordering::Relaxed),
      subscriptions: self.subscriptions.load(Ordering::Relaxed),
      uptime_secs: self.created_at.elapsed().as_secs(),
    }
  }
}

/// A point-in-time, public-facing snapshot of a store's metrics.
#[derive(Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
  /// The number of fetcher invocations actually started.
  pub fetches_started: u64,
  /// The number of callers that joined a fetch already in flight.
  pub fetches_joined: u64,
  /// The number of started fetches that returned an error.
  pub fetch_failures: u64,
  /// The number of successful fetch results written to the cache.
  pub cache_writes: u64,
  /// The number of `mark_as_stale` / `mark_store_as_stale` calls.
  pub invalidations: u64,
  /// The number of `stream` subscriptions opened.
  pub subscriptions: u64,
  /// The number of seconds the store has been running.
  pub uptime_secs: u64,
}

impl MetricsSnapshot {
  /// The share of fetch requests served by an already running fetch.
  pub fn dedup_ratio(&self) -> f64 {
    let total = self.fetches_started + self.fetches_joined;
    if total == 0 {
      0.0
    } else {
      self.fetches_joined as f64 / total as f64
    }
  }
}

impl fmt::Debug for MetricsSnapshot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MetricsSnapshot")
      .field("fetches_started", &self.fetches_started)
      .field("fetches_joined", &self.fetches_joined)
      .field("dedup_ratio", &format!("{:.2}%", self.dedup_ratio() * 100.0))
      .field("fetch_failures", &self.fetch_failures)
      .field("cache_writes", &self.cache_writes)
      .field("invalidations", &self.invalidations)
      .field("subscriptions", &self.subscriptions)
      .field("uptime_secs", &self.uptime_secs)
      .finish()
  }
}
