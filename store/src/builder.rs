use crate::cache::Cache;
use crate::data::FetcherResult;
use crate::error::BuildError;
use crate::fetcher::{FnFetcher, Fetcher};
use crate::mediator::Mediator;
use crate::metrics::Metrics;
use crate::multicaster::Multicaster;
use crate::notifications::{CacheConfiguration, NotificationHub, ResetListener};
use crate::store::{KeyedStore, Store, StoreParts, WriteThrough};
use crate::time::{Clock, SystemClock};
use crate::TaskSpawner;

use core::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures_util::stream::{self, BoxStream, StreamExt};

/// What a store does when an entry it just fetched is immediately judged
/// stale by its mediator.
///
/// This only happens when the mediator and fetcher disagree, for instance a
/// freshness window shorter than the clock drift between fetch and check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvariantCheck {
  /// Ignore the violation.
  Off,
  /// Report the violation at `error` level.
  Log,
  /// Panic on the violation.
  Panic,
}

/// `Log` in debug builds, `Off` in release builds.
impl Default for InvariantCheck {
  fn default() -> Self {
    if cfg!(debug_assertions) {
      InvariantCheck::Log
    } else {
      InvariantCheck::Off
    }
  }
}

/// A builder for creating [`KeyedStore`] instances.
pub struct KeyedStoreBuilder<K, T, E> {
  fetcher: Option<Arc<dyn Fetcher<K, T, Error = E>>>,
  cache: Option<Arc<dyn Cache<K, T>>>,
  mediator: Option<Arc<dyn Mediator<K, T>>>,
  spawner: Option<Arc<dyn TaskSpawner>>,
  clock: Option<Arc<dyn Clock>>,
  invariant_check: InvariantCheck,
  resets: Vec<BoxStream<'static, ()>>,
}

// Manual Debug implementation for KeyedStoreBuilder.
impl<K, T, E> fmt::Debug for KeyedStoreBuilder<K, T, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("KeyedStoreBuilder")
      .field("has_fetcher", &self.fetcher.is_some())
      .field("has_cache", &self.cache.is_some())
      .field("has_mediator", &self.mediator.is_some())
      .field("has_spawner", &self.spawner.is_some())
      .field("invariant_check", &self.invariant_check)
      .field("reset_sources", &self.resets.len())
      .finish_non_exhaustive()
  }
}

impl<K, T, E> KeyedStoreBuilder<K, T, E> {
  /// Creates a new `KeyedStoreBuilder` with default settings.
  pub fn new() -> Self {
    Self {
      fetcher: None,
      cache: None,
      mediator: None,
      spawner: None,
      clock: None,
      invariant_check: InvariantCheck::default(),
      resets: Vec::new(),
    }
  }

  /// Sets the fetcher used to retrieve values.
  pub fn fetcher<F>(mut self, fetcher: F) -> Self
  where
    F: Fetcher<K, T, Error = E> + 'static,
  {
    self.fetcher = Some(Arc::new(fetcher));
    self
  }

  /// Sets an async closure as the fetcher.
  pub fn fetcher_fn<F, Fut>(self, f: F) -> Self
  where
    K: Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetcherResult<T, E>> + Send + 'static,
  {
    self.fetcher(FnFetcher::new(f))
  }

  /// Sets the cache backing the store.
  ///
  /// The cache is shared: callers may keep their own handle to it.
  pub fn cache<C>(mut self, cache: Arc<C>) -> Self
  where
    C: Cache<K, T> + 'static,
  {
    self.cache = Some(cache);
    self
  }

  /// Sets the freshness policy.
  pub fn mediator<M>(mut self, mediator: M) -> Self
  where
    M: Mediator<K, T> + 'static,
  {
    self.mediator = Some(Arc::new(mediator));
    self
  }

  /// Sets the spawner running shared fetches and reset listeners.
  ///
  /// Defaults to the current Tokio runtime when the `tokio` feature is on.
  pub fn spawner(mut self, spawner: Arc<dyn TaskSpawner>) -> Self {
    self.spawner = Some(spawner);
    self
  }

  /// Sets the clock used to stamp fetched entries. Defaults to the system
  /// clock.
  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = Some(clock);
    self
  }

  pub fn invariant_check(mut self, check: InvariantCheck) -> Self {
    self.invariant_check = check;
    self
  }

  /// Marks the whole store stale whenever `hub` carries one of the events
  /// named by `config`.
  ///
  /// The subscription is taken now, so events posted between this call and
  /// `build` are not lost.
  pub fn reset_on<Ev>(mut self, hub: &NotificationHub<Ev>, config: CacheConfiguration<Ev>) -> Self
  where
    Ev: Clone + PartialEq + Send + 'static,
  {
    if config.is_empty() {
      return self;
    }
    let listener = ResetListener::new(hub, config);
    let resets = stream::unfold(listener, |mut listener| async move {
      if listener.next_reset().await {
        Some(((), listener))
      } else {
        None
      }
    });
    self.resets.push(resets.boxed());
    self
  }
}

impl<K, T, E> Default for KeyedStoreBuilder<K, T, E> {
  fn default() -> Self {
    Self::new()
  }
}

impl<K, T, E> KeyedStoreBuilder<K, T, E>
where
  K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
  T: Clone + PartialEq + Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
{
  /// Builds the store.
  ///
  /// Must be called within a Tokio runtime unless a spawner was set.
  pub fn build(self) -> Result<KeyedStore<K, T, E>, BuildError> {
    let fetcher = self.fetcher.ok_or(BuildError::MissingFetcher)?;
    let cache = self.cache.ok_or(BuildError::MissingCache)?;
    let mediator = self.mediator.ok_or(BuildError::MissingMediator)?;
    let spawner = match self.spawner {
      Some(spawner) => spawner,
      None => default_spawner()?,
    };

    let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
    let metrics = Arc::new(Metrics::new());
    let fetcher = Arc::new(WriteThrough::new(
      fetcher,
      cache.clone(),
      clock.clone(),
      metrics.clone(),
    ));
    let multicaster = Multicaster::with_metrics(fetcher, spawner.clone(), metrics.clone());

    Ok(KeyedStore::from_parts(StoreParts {
      cache,
      mediator,
      multicaster,
      spawner,
      clock,
      invariant_check: self.invariant_check,
      metrics,
      resets: self.resets,
    }))
  }
}

#[cfg(feature = "tokio")]
fn default_spawner() -> Result<Arc<dyn TaskSpawner>, BuildError> {
  crate::runtime::TokioSpawner::try_current()
    .map(|spawner| Arc::new(spawner) as Arc<dyn TaskSpawner>)
    .ok_or(BuildError::SpawnerRequired)
}

#[cfg(not(feature = "tokio"))]
fn default_spawner() -> Result<Arc<dyn TaskSpawner>, BuildError> {
  Err(BuildError::SpawnerRequired)
}

/// A builder for single-value [`Store`] instances.
///
/// This is a thin layer over [`KeyedStoreBuilder`] with the key fixed to `()`.
pub struct StoreBuilder<T, E> {
  inner: KeyedStoreBuilder<(), T, E>,
}

impl<T, E> fmt::Debug for StoreBuilder<T, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("StoreBuilder").field(&self.inner).finish()
  }
}

impl<T, E> StoreBuilder<T, E> {
  pub fn new() -> Self {
    Self {
      inner: KeyedStoreBuilder::new(),
    }
  }

  pub fn fetcher<F>(self, fetcher: F) -> Self
  where
    F: Fetcher<(), T, Error = E> + 'static,
  {
    Self {
      inner: self.inner.fetcher(fetcher),
    }
  }

  /// Sets an async closure producing the value as the fetcher.
  pub fn fetcher_fn<F, Fut>(self, f: F) -> Self
  where
    T: Send + 'static,
    E: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetcherResult<T, E>> + Send + 'static,
  {
    Self {
      inner: self.inner.fetcher_fn(move |()| f()),
    }
  }

  pub fn cache<C>(self, cache: Arc<C>) -> Self
  where
    C: Cache<(), T> + 'static,
  {
    Self {
      inner: self.inner.cache(cache),
    }
  }

  pub fn mediator<M>(self, mediator: M) -> Self
  where
    M: Mediator<(), T> + 'static,
  {
    Self {
      inner: self.inner.mediator(mediator),
    }
  }

  pub fn spawner(self, spawner: Arc<dyn TaskSpawner>) -> Self {
    Self {
      inner: self.inner.spawner(spawner),
    }
  }

  pub fn clock(self, clock: Arc<dyn Clock>) -> Self {
    Self {
      inner: self.inner.clock(clock),
    }
  }

  pub fn invariant_check(self, check: InvariantCheck) -> Self {
    Self {
      inner: self.inner.invariant_check(check),
    }
  }

  pub fn reset_on<Ev>(self, hub: &NotificationHub<Ev>, config: CacheConfiguration<Ev>) -> Self
  where
    Ev: Clone + PartialEq + Send + 'static,
  {
    Self {
      inner: self.inner.reset_on(hub, config),
    }
  }
}

impl<T, E> Default for StoreBuilder<T, E> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T, E> StoreBuilder<T, E>
where
  T: Clone + PartialEq + Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
{
  pub fn build(self) -> Result<Store<T, E>, BuildError> {
    self.inner.build().map(Store::new)
  }
}
