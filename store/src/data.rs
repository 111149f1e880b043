use std::time::Duration;

/// The most recently known value for a key and the wall-clock time at which it
/// was fetched.
///
/// A `last_fetched_millis` of `0` marks an entry that was explicitly
/// invalidated with `mark_as_stale`; the value itself is kept so that callers
/// can keep showing it while a refetch is in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CachedData<K, T> {
  pub key: K,
  pub data: T,
  pub last_fetched_millis: u64,
}

impl<K, T> CachedData<K, T> {
  pub fn new(key: K, data: T, last_fetched_millis: u64) -> Self {
    Self {
      key,
      data,
      last_fetched_millis,
    }
  }

  /// Returns `true` if this entry was reset by `mark_as_stale`.
  #[inline]
  pub fn is_marked_stale(&self) -> bool {
    self.last_fetched_millis == 0
  }

  /// Returns a copy of this entry with its fetch time reset to `0`.
  pub(crate) fn into_stale(self) -> Self {
    Self {
      last_fetched_millis: 0,
      ..self
    }
  }
}

/// The outcome of a single [`Fetcher`](crate::Fetcher) invocation.
pub type FetcherResult<T, E> = Result<T, E>;

/// A single element of a store subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreResponse<T, E> {
  /// A fetch was started for this subscription.
  Loading,
  /// A value, either served from the cache or just fetched.
  Data(T),
  /// The fetch announced by the preceding `Loading` failed.
  Error(E),
}

impl<T, E> StoreResponse<T, E> {
  pub fn is_loading(&self) -> bool {
    matches!(self, StoreResponse::Loading)
  }

  /// Returns the carried value, if this is `Data`.
  pub fn data(&self) -> Option<&T> {
    match self {
      StoreResponse::Data(value) => Some(value),
      _ => None,
    }
  }

  pub fn map<U, F>(self, f: F) -> StoreResponse<U, E>
  where
    F: FnOnce(T) -> U,
  {
    match self {
      StoreResponse::Loading => StoreResponse::Loading,
      StoreResponse::Data(value) => StoreResponse::Data(f(value)),
      StoreResponse::Error(error) => StoreResponse::Error(error),
    }
  }
}

/// How a `Cached` request decides whether to go to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshStrategy {
  /// Fetch only when the mediator judges the cached entry stale.
  #[default]
  RefreshIfStale,
  /// Always fetch once, while still serving a fresh cached value first.
  ForceRefresh,
  /// Fetch when the mediator judges the entry stale or when it is older than
  /// the given age.
  RefreshIfOlderThan(Duration),
}

impl RefreshStrategy {
  /// Maps the boolean `force_refresh` flag onto a strategy.
  pub fn from_force_refresh(force_refresh: bool) -> Self {
    if force_refresh {
      RefreshStrategy::ForceRefresh
    } else {
      RefreshStrategy::RefreshIfStale
    }
  }

  /// Decides whether this strategy wants a fetch for the given entry.
  pub(crate) fn wants_fetch<K, T>(
    &self,
    cached: Option<&CachedData<K, T>>,
    is_stale: bool,
    now_millis: u64,
  ) -> bool {
    match self {
      RefreshStrategy::RefreshIfStale => is_stale,
      RefreshStrategy::ForceRefresh => true,
      RefreshStrategy::RefreshIfOlderThan(max_age) => {
        if is_stale {
          return true;
        }
        match cached {
          None => true,
          Some(cached) => {
            let age = now_millis.saturating_sub(cached.last_fetched_millis);
            u128::from(age) > max_age.as_millis()
          }
        }
      }
    }
  }
}

/// A request against a single-key [`Store`](crate::Store).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRequest {
  /// Always fetch, still writing the result through the cache.
  Fresh,
  /// Serve from the cache, fetching according to the strategy.
  Cached(RefreshStrategy),
}

impl StoreRequest {
  pub fn cached(force_refresh: bool) -> Self {
    StoreRequest::Cached(RefreshStrategy::from_force_refresh(force_refresh))
  }

  pub(crate) fn with_key<K>(self, key: K) -> KeyedStoreRequest<K> {
    match self {
      StoreRequest::Fresh => KeyedStoreRequest::Fresh(key),
      StoreRequest::Cached(refresh) => KeyedStoreRequest::Cached { key, refresh },
    }
  }
}

/// A request against a [`KeyedStore`](crate::KeyedStore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyedStoreRequest<K> {
  Fresh(K),
  Cached { key: K, refresh: RefreshStrategy },
}

impl<K> KeyedStoreRequest<K> {
  pub fn fresh(key: K) -> Self {
    KeyedStoreRequest::Fresh(key)
  }

  pub fn cached(key: K, force_refresh: bool) -> Self {
    KeyedStoreRequest::Cached {
      key,
      refresh: RefreshStrategy::from_force_refresh(force_refresh),
    }
  }

  pub fn cached_with(key: K, refresh: RefreshStrategy) -> Self {
    KeyedStoreRequest::Cached { key, refresh }
  }

  pub fn key(&self) -> &K {
    match self {
      KeyedStoreRequest::Fresh(key) => key,
      KeyedStoreRequest::Cached { key, .. } => key,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn older_than_fetches_only_past_the_age() {
    let strategy = RefreshStrategy::RefreshIfOlderThan(Duration::from_secs(60));
    let cached = CachedData::new("k", 1, 100_000);

    assert!(!strategy.wants_fetch(Some(&cached), false, 100_000 + 30_000));
    assert!(strategy.wants_fetch(Some(&cached), false, 100_000 + 61_000));
    assert!(strategy.wants_fetch(Some(&cached), true, 100_000));
    assert!(strategy.wants_fetch::<&str, i32>(None, false, 0));
  }

  #[test]
  fn boolean_requests_map_onto_strategies() {
    assert_eq!(
      KeyedStoreRequest::cached("k", true),
      KeyedStoreRequest::Cached {
        key: "k",
        refresh: RefreshStrategy::ForceRefresh
      }
    );
    assert_eq!(
      StoreRequest::cached(false),
      StoreRequest::Cached(RefreshStrategy::RefreshIfStale)
    );
  }
}
