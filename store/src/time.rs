use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of wall-clock time in milliseconds since the Unix epoch.
///
/// Cached entries are stamped with wall-clock time so that they stay
/// meaningful across process restarts when a persistent cache is used.
pub trait Clock: Send + Sync {
  fn now_millis(&self) -> u64;
}

/// A helper to get the current wall-clock time in milliseconds.
#[inline]
pub fn now_millis() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|elapsed| elapsed.as_millis() as u64)
    .unwrap_or(0)
}

/// The default clock, backed by `SystemTime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  #[inline]
  fn now_millis(&self) -> u64 {
    now_millis()
  }
}

/// A manually driven clock for tests and simulations.
///
/// Clones share the same underlying time, so a clock handed to a mediator can
/// be advanced (or rolled back) from the test body.
#[derive(Clone, Default)]
pub struct ManualClock {
  millis: Arc<AtomicU64>,
}

impl ManualClock {
  pub fn new(start_millis: u64) -> Self {
    Self {
      millis: Arc::new(AtomicU64::new(start_millis)),
    }
  }

  pub fn set(&self, millis: u64) {
    self.millis.store(millis, Ordering::SeqCst);
  }

  pub fn advance(&self, by: Duration) {
    self
      .millis
      .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
  }

  /// Moves the clock backwards, saturating at zero.
  pub fn rewind(&self, by: Duration) {
    let by = by.as_millis() as u64;
    let _ = self
      .millis
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
        Some(now.saturating_sub(by))
      });
  }
}

impl Clock for ManualClock {
  fn now_millis(&self) -> u64 {
    self.millis.load(Ordering::SeqCst)
  }
}

impl fmt::Debug for ManualClock {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ManualClock")
      .field("now_millis", &self.now_millis())
      .finish()
  }
}
