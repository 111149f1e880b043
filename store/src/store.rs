use crate::builder::InvariantCheck;
use crate::cache::Cache;
use crate::data::{
  CachedData, FetcherResult, KeyedStoreRequest, RefreshStrategy, StoreRequest, StoreResponse,
};
use crate::error::StoreError;
use crate::fetcher::Fetcher;
use crate::mediator::Mediator;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::multicaster::Multicaster;
use crate::runtime::TaskSpawner;
use crate::time::Clock;

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::{BoxStream, StreamExt};
use futures_util::FutureExt;
use tokio::sync::watch;

/// The one-shot gate deciding whether a `Cached` subscription fetches.
///
/// It is resolved by the first cache emission and never reopened, so each
/// subscription performs at most one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NetworkLock {
  Pending,
  Completed,
  Cancelled,
}

enum Event<K, T, E> {
  Cached(Option<Option<CachedData<K, T>>>),
  Fetched(FetcherResult<T, E>),
}

/// Writes every successful fetch to the cache before handing it back.
///
/// The multicaster runs this inside the shared fetch task, so a result lands
/// in the cache once, stamped when the fetch completed, however many
/// subscribers joined it and whenever they are next polled.
pub(crate) struct WriteThrough<K, T, E> {
  fetcher: Arc<dyn Fetcher<K, T, Error = E>>,
  cache: Arc<dyn Cache<K, T>>,
  clock: Arc<dyn Clock>,
  metrics: Arc<Metrics>,
}

impl<K, T, E> WriteThrough<K, T, E> {
  pub(crate) fn new(
    fetcher: Arc<dyn Fetcher<K, T, Error = E>>,
    cache: Arc<dyn Cache<K, T>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
  ) -> Self {
    Self {
      fetcher,
      cache,
      clock,
      metrics,
    }
  }
}

#[async_trait]
impl<K, T, E> Fetcher<K, T> for WriteThrough<K, T, E>
where
  K: Clone + Send + Sync + 'static,
  T: Clone + Send + Sync + 'static,
  E: Send + 'static,
{
  type Error = E;

  async fn fetch(&self, key: K) -> FetcherResult<T, E> {
    let result = self.fetcher.fetch(key.clone()).await;
    if let Ok(value) = &result {
      let data = CachedData::new(key, value.clone(), self.clock.now_millis());
      self.cache.write(data).await;
      Metrics::record(&self.metrics.cache_writes);
    }
    result
  }
}

/// Everything a [`KeyedStore`] needs, assembled by the builder.
pub(crate) struct StoreParts<K, T, E> {
  pub(crate) cache: Arc<dyn Cache<K, T>>,
  pub(crate) mediator: Arc<dyn Mediator<K, T>>,
  pub(crate) multicaster: Multicaster<K, T, E>,
  pub(crate) spawner: Arc<dyn TaskSpawner>,
  pub(crate) clock: Arc<dyn Clock>,
  pub(crate) invariant_check: InvariantCheck,
  pub(crate) metrics: Arc<Metrics>,
  pub(crate) resets: Vec<BoxStream<'static, ()>>,
}

/// The internal, thread-safe core of a store.
struct StoreShared<K, T, E> {
  cache: Arc<dyn Cache<K, T>>,
  mediator: Arc<dyn Mediator<K, T>>,
  multicaster: Multicaster<K, T, E>,
  clock: Arc<dyn Clock>,
  invariant_check: InvariantCheck,
  metrics: Arc<Metrics>,
  // Never sent on; dropping it stops background listeners.
  _closed: watch::Sender<()>,
}

impl<K, T, E> StoreShared<K, T, E>
where
  K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
  T: Clone + PartialEq + Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
{
  fn fetch(self: &Arc<Self>, key: K) -> BoxFuture<'static, FetcherResult<T, E>> {
    let shared = self.clone();
    async move { shared.multicaster.fetch(key).await }.boxed()
  }

  async fn mark_as_stale(&self, key: &K) {
    Metrics::record(&self.metrics.invalidations);
    self.cache.mark_as_stale(key).await;
  }

  async fn mark_store_as_stale(&self) {
    Metrics::record(&self.metrics.invalidations);
    self.cache.mark_store_as_stale().await;
  }

  /// Reports an entry that is stale although this subscription just fetched
  /// it. Explicitly invalidated entries are expected to be stale.
  fn check_fetched_entry(&self, cached: Option<&CachedData<K, T>>) {
    let cached = match cached {
      Some(cached) if !cached.is_marked_stale() => cached,
      _ => return,
    };
    let violation = StoreError::StaleAfterFetch {
      key: format!("{:?}", cached.key),
      last_fetched_millis: cached.last_fetched_millis,
    };
    match self.invariant_check {
      InvariantCheck::Off => {}
      InvariantCheck::Log => tracing::error!(error = %violation, "store invariant violated"),
      InvariantCheck::Panic => panic!("{violation}"),
    }
  }

  fn stream_cached(
    self: Arc<Self>,
    key: K,
    refresh: RefreshStrategy,
  ) -> BoxStream<'static, StoreResponse<T, E>> {
    let responses = stream! {
      let mut reads = self.cache.read(&key);
      let mut reads_open = true;
      let mut lock = NetworkLock::Pending;
      let mut fetch: Option<BoxFuture<'static, FetcherResult<T, E>>> = None;
      let mut fetched = false;
      let mut last_data: Option<T> = None;

      loop {
        let event = match fetch.as_mut() {
          Some(in_flight) if reads_open => tokio::select! {
            biased;
            result = in_flight => Event::Fetched(result),
            cached = reads.next() => Event::Cached(cached),
          },
          Some(in_flight) => Event::Fetched(in_flight.await),
          None if reads_open => Event::Cached(reads.next().await),
          None => break,
        };

        match event {
          Event::Fetched(Ok(_)) => {
            fetch = None;
            fetched = true;
            // The shared fetch already wrote the entry; its emission delivers it.
          }
          Event::Fetched(Err(error)) => {
            fetch = None;
            last_data = None;
            yield StoreResponse::Error(error);
          }
          Event::Cached(None) => reads_open = false,
          Event::Cached(Some(cached)) => {
            let is_stale = self.mediator.should_fetch(cached.as_ref());
            if fetched && is_stale {
              self.check_fetched_entry(cached.as_ref());
            }

            let should_emit = lock == NetworkLock::Completed || !is_stale;
            tracing::trace!(key = ?key, is_stale, should_emit, lock = ?lock, "cache emission");
            if let Some(entry) = cached.as_ref().filter(|_| should_emit) {
              if last_data.as_ref() != Some(&entry.data) {
                last_data = Some(entry.data.clone());
                yield StoreResponse::Data(entry.data.clone());
              }
            }

            if lock == NetworkLock::Pending {
              let now = self.clock.now_millis();
              if refresh.wants_fetch(cached.as_ref(), is_stale, now) {
                lock = NetworkLock::Completed;
                last_data = None;
                yield StoreResponse::Loading;
                fetch = Some(self.fetch(key.clone()));
              } else {
                lock = NetworkLock::Cancelled;
              }
            }
          }
        }
      }
    };
    responses.boxed()
  }

  fn stream_fresh(self: Arc<Self>, key: K) -> BoxStream<'static, StoreResponse<T, E>> {
    let responses = stream! {
      // The first read yields the entry as it stands once the fetch is done,
      // with any writes made meanwhile folded into it. It is skipped: the
      // fetched value is emitted directly, and only later writes follow.
      let mut reads = self.cache.read(&key).skip(1);
      let mut last_data: Option<T> = None;
      yield StoreResponse::Loading;

      match self.fetch(key.clone()).await {
        Ok(value) => {
          last_data = Some(value.clone());
          yield StoreResponse::Data(value);
        }
        Err(error) => yield StoreResponse::Error(error),
      }

      while let Some(cached) = reads.next().await {
        if let Some(entry) = cached {
          if last_data.as_ref() != Some(&entry.data) {
            last_data = Some(entry.data.clone());
            yield StoreResponse::Data(entry.data);
          }
        }
      }
    };
    responses.boxed()
  }
}

/// A keyed, freshness-aware store.
///
/// Cloning a `KeyedStore` is cheap and yields a handle to the same store.
pub struct KeyedStore<K, T, E> {
  shared: Arc<StoreShared<K, T, E>>,
}

impl<K, T, E> KeyedStore<K, T, E>
where
  K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
  T: Clone + PartialEq + Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
{
  pub(crate) fn from_parts(parts: StoreParts<K, T, E>) -> Self {
    let (closed, closed_rx) = watch::channel(());
    let shared = Arc::new(StoreShared {
      cache: parts.cache,
      mediator: parts.mediator,
      multicaster: parts.multicaster,
      clock: parts.clock,
      invariant_check: parts.invariant_check,
      metrics: parts.metrics,
      _closed: closed,
    });

    if !parts.resets.is_empty() {
      Self::spawn_reset_listener(&shared, &parts.spawner, parts.resets, closed_rx);
    }
    Self { shared }
  }

  /// Marks the whole store stale whenever one of `resets` yields, until the
  /// store is dropped or every reset source ends.
  fn spawn_reset_listener(
    shared: &Arc<StoreShared<K, T, E>>,
    spawner: &Arc<dyn TaskSpawner>,
    resets: Vec<BoxStream<'static, ()>>,
    mut closed: watch::Receiver<()>,
  ) {
    let weak = Arc::downgrade(shared);
    let mut resets = futures_util::stream::select_all(resets);
    let task = async move {
      loop {
        let reset = tokio::select! {
          _ = closed.changed() => None,
          reset = resets.next() => reset,
        };
        let shared = match (reset, weak.upgrade()) {
          (Some(()), Some(shared)) => shared,
          _ => break,
        };
        tracing::debug!("resetting store after application event");
        shared.mark_store_as_stale().await;
      }
      tracing::debug!("reset listener stopped");
    };
    spawner.spawn(Box::pin(task));
  }

  /// Opens a subscription for `request`.
  ///
  /// `Cached` requests serve the cached value unless the mediator judges it
  /// stale, fetching at most once per subscription. `Fresh` requests always
  /// fetch and emit the result directly. Both keep following the cache for
  /// as long as the stream is polled.
  pub fn stream(&self, request: KeyedStoreRequest<K>) -> BoxStream<'static, StoreResponse<T, E>> {
    Metrics::record(&self.shared.metrics.subscriptions);
    let shared = self.shared.clone();
    match request {
      KeyedStoreRequest::Fresh(key) => shared.stream_fresh(key),
      KeyedStoreRequest::Cached { key, refresh } => shared.stream_cached(key, refresh),
    }
  }

  /// Resets the freshness of `key` so that its next evaluation refetches.
  pub async fn mark_as_stale(&self, key: &K) {
    self.shared.mark_as_stale(key).await;
  }

  /// Resets the freshness of every key.
  pub async fn mark_store_as_stale(&self) {
    self.shared.mark_store_as_stale().await;
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    self.shared.metrics.snapshot()
  }
}

impl<K, T, E> Clone for KeyedStore<K, T, E> {
  fn clone(&self) -> Self {
    Self {
      shared: self.shared.clone(),
    }
  }
}

impl<K, T, E> fmt::Debug for KeyedStore<K, T, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("KeyedStore")
      .field("multicaster", &self.shared.multicaster)
      .field("invariant_check", &self.shared.invariant_check)
      .field("metrics", &self.shared.metrics.snapshot())
      .finish_non_exhaustive()
  }
}

/// A store tracking a single value.
pub struct Store<T, E> {
  inner: KeyedStore<(), T, E>,
}

impl<T, E> Store<T, E>
where
  T: Clone + PartialEq + Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
{
  pub(crate) fn new(inner: KeyedStore<(), T, E>) -> Self {
    Self { inner }
  }

  pub fn stream(&self, request: StoreRequest) -> BoxStream<'static, StoreResponse<T, E>> {
    self.inner.stream(request.with_key(()))
  }

  pub async fn mark_as_stale(&self) {
    self.inner.mark_as_stale(&()).await;
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    self.inner.metrics()
  }

  /// Returns the keyed store this store delegates to.
  pub fn as_keyed(&self) -> &KeyedStore<(), T, E> {
    &self.inner
  }
}

impl<T, E> Clone for Store<T, E> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<T, E> fmt::Debug for Store<T, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("Store").field(&self.inner).finish()
  }
}
