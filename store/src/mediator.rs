//! Freshness policies deciding whether a cached entry should be refetched.
//!
//! A [`Mediator`] is a pure predicate over the current cache entry. The store
//! treats it as opaque: any combination of signals (age, emptiness, a status
//! embedded in the value) is a valid policy.

use crate::data::CachedData;
use crate::time::{Clock, SystemClock};

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

pub trait Mediator<K, T>: Send + Sync {
  /// Returns `true` if `cached` is missing or too old to serve.
  fn should_fetch(&self, cached: Option<&CachedData<K, T>>) -> bool;
}

/// The maximum age a cached entry may reach before it is considered stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FreshnessWindow(Duration);

impl FreshnessWindow {
  pub const ONE_HOUR: FreshnessWindow = FreshnessWindow(Duration::from_secs(60 * 60));
  pub const ONE_DAY: FreshnessWindow = FreshnessWindow(Duration::from_secs(24 * 60 * 60));

  pub const fn new(window: Duration) -> Self {
    FreshnessWindow(window)
  }

  pub const fn seconds(seconds: u64) -> Self {
    FreshnessWindow(Duration::from_secs(seconds))
  }

  pub const fn minutes(minutes: u64) -> Self {
    FreshnessWindow(Duration::from_secs(minutes * 60))
  }

  pub const fn hours(hours: u64) -> Self {
    FreshnessWindow(Duration::from_secs(hours * 60 * 60))
  }

  pub fn as_duration(&self) -> Duration {
    self.0
  }

  fn as_millis(&self) -> u64 {
    self.0.as_millis() as u64
  }
}

impl From<Duration> for FreshnessWindow {
  fn from(window: Duration) -> Self {
    FreshnessWindow(window)
  }
}

/// Values that can be structurally empty, such as collections.
pub trait IsEmpty {
  fn is_empty_value(&self) -> bool;
}

impl<V> IsEmpty for Vec<V> {
  fn is_empty_value(&self) -> bool {
    self.is_empty()
  }
}

impl<V> IsEmpty for VecDeque<V> {
  fn is_empty_value(&self) -> bool {
    self.is_empty()
  }
}

impl<K, V, S> IsEmpty for HashMap<K, V, S> {
  fn is_empty_value(&self) -> bool {
    self.is_empty()
  }
}

impl<V, S> IsEmpty for HashSet<V, S> {
  fn is_empty_value(&self) -> bool {
    self.is_empty()
  }
}

impl<K, V> IsEmpty for BTreeMap<K, V> {
  fn is_empty_value(&self) -> bool {
    self.is_empty()
  }
}

impl<V> IsEmpty for BTreeSet<V> {
  fn is_empty_value(&self) -> bool {
    self.is_empty()
  }
}

impl IsEmpty for String {
  fn is_empty_value(&self) -> bool {
    self.is_empty()
  }
}

impl<V: IsEmpty> IsEmpty for Arc<V> {
  fn is_empty_value(&self) -> bool {
    (**self).is_empty_value()
  }
}

/// Considers an entry stale once it is older than a fixed window.
///
/// An entry is also stale when it is missing, was explicitly invalidated,
/// holds an empty collection (for mediators built with [`for_collection`] or
/// [`stale_when_empty`]), or claims to have been fetched in the future. The
/// last case happens when the system clock is rolled back; refetching
/// restamps the entry with a sane time.
///
/// [`for_collection`]: FreshnessMediator::for_collection
/// [`stale_when_empty`]: FreshnessMediator::stale_when_empty
pub struct FreshnessMediator<T> {
  window: FreshnessWindow,
  clock: Arc<dyn Clock>,
  empty_check: Option<fn(&T) -> bool>,
}

impl<T> FreshnessMediator<T> {
  pub fn new(window: impl Into<FreshnessWindow>) -> Self {
    Self {
      window: window.into(),
      clock: Arc::new(SystemClock),
      empty_check: None,
    }
  }

  /// Creates a mediator for collection values, treating an empty collection
  /// as stale.
  pub fn for_collection(window: impl Into<FreshnessWindow>) -> Self
  where
    T: IsEmpty,
  {
    Self::new(window).stale_when_empty()
  }

  pub fn one_hour() -> Self {
    Self::new(FreshnessWindow::ONE_HOUR)
  }

  pub fn one_day() -> Self {
    Self::new(FreshnessWindow::ONE_DAY)
  }

  /// Uses the given clock instead of the system clock.
  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Treats empty collections as stale.
  pub fn stale_when_empty(mut self) -> Self
  where
    T: IsEmpty,
  {
    self.empty_check = Some(T::is_empty_value);
    self
  }

  /// Treats values matching `check` as stale.
  pub fn stale_when(mut self, check: fn(&T) -> bool) -> Self {
    self.empty_check = Some(check);
    self
  }

  pub fn window(&self) -> FreshnessWindow {
    self.window
  }
}

impl<K, T> Mediator<K, T> for FreshnessMediator<T>
where
  T: Send + Sync,
{
  fn should_fetch(&self, cached: Option<&CachedData<K, T>>) -> bool {
    let cached = match cached {
      Some(cached) => cached,
      None => return true,
    };
    if cached.is_marked_stale() {
      return true;
    }
    if let Some(check) = self.empty_check {
      if check(&cached.data) {
        return true;
      }
    }

    let now = self.clock.now_millis();
    if now < cached.last_fetched_millis {
      return true;
    }
    now - cached.last_fetched_millis >= self.window.as_millis()
  }
}

impl<T> fmt::Debug for FreshnessMediator<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FreshnessMediator")
      .field("window", &self.window)
      .field("checks_empty", &self.empty_check.is_some())
      .finish_non_exhaustive()
  }
}

/// Fetches only when nothing is cached or the entry was explicitly
/// invalidated; any previously fetched value is otherwise served forever.
#[derive(Debug, Clone, Copy, Default)]
pub struct IsCachedMediator;

impl<K, T> Mediator<K, T> for IsCachedMediator {
  fn should_fetch(&self, cached: Option<&CachedData<K, T>>) -> bool {
    cached.map_or(true, CachedData::is_marked_stale)
  }
}

/// A mediator backed by a closure, for domain-specific policies.
pub struct FnMediator<K, T, F> {
  f: F,
  _marker: PhantomData<fn(&K, &T)>,
}

impl<K, T, F> FnMediator<K, T, F>
where
  F: Fn(Option<&CachedData<K, T>>) -> bool + Send + Sync,
{
  pub fn new(f: F) -> Self {
    Self {
      f,
      _marker: PhantomData,
    }
  }
}

impl<K, T, F> Mediator<K, T> for FnMediator<K, T, F>
where
  F: Fn(Option<&CachedData<K, T>>) -> bool + Send + Sync,
{
  fn should_fetch(&self, cached: Option<&CachedData<K, T>>) -> bool {
    (self.f)(cached)
  }
}

impl<K, T, F> fmt::Debug for FnMediator<K, T, F> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FnMediator").finish_non_exhaustive()
  }
}
