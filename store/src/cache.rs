use crate::data::CachedData;

use std::fmt;
use std::hash::Hash;

use ahash::HashMap;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;

/// Per-key storage of the latest fetched value and its fetch time.
///
/// Implementations must re-emit to every live `read(key)` stream whenever
/// `write` or `mark_as_stale` touches that key. `mark_as_stale` keeps the
/// value but resets its fetch time to `0`.
#[async_trait]
pub trait Cache<K, T>: Send + Sync {
  /// Returns a live view of the entry for `key`.
  ///
  /// The stream yields the current entry immediately (`None` if nothing was
  /// ever written) and then once per subsequent change.
  fn read(&self, key: &K) -> BoxStream<'static, Option<CachedData<K, T>>>;

  /// Replaces the entry for `data.key`.
  async fn write(&self, data: CachedData<K, T>);

  /// Resets the fetch time of the entry for `key`, keeping its value.
  async fn mark_as_stale(&self, key: &K);

  /// Resets the fetch time of every entry, keeping their values.
  async fn mark_store_as_stale(&self);
}

/// Turns a `watch` receiver into a stream of its current and future values.
pub(crate) fn watch_stream<V>(rx: watch::Receiver<V>) -> BoxStream<'static, V>
where
  V: Clone + Send + Sync + 'static,
{
  stream::unfold((rx, true), |(mut rx, first)| async move {
    // The sender lives as long as the cache, so `changed` only fails on teardown.
    if !first && rx.changed().await.is_err() {
      return None;
    }
    let value = rx.borrow_and_update().clone();
    Some((value, (rx, false)))
  })
  .boxed()
}

/// A thread-safe, in-memory [`Cache`].
///
/// Each key owns a `watch` channel; readers that fall behind observe the
/// latest entry rather than every intermediate write.
pub struct InMemoryCache<K, T> {
  entries: Mutex<HashMap<K, watch::Sender<Option<CachedData<K, T>>>>>,
}

impl<K, T> InMemoryCache<K, T>
where
  K: Clone + Eq + Hash,
  T: Clone,
{
  pub fn new() -> Self {
    Self {
      entries: Mutex::new(HashMap::default()),
    }
  }

  /// Returns a snapshot of the current entry for `key`.
  pub fn get(&self, key: &K) -> Option<CachedData<K, T>> {
    let entries = self.entries.lock();
    entries.get(key).and_then(|sender| sender.borrow().clone())
  }

  /// Returns the number of keys that hold a value.
  pub fn len(&self) -> usize {
    let entries = self.entries.lock();
    entries
      .values()
      .filter(|sender| sender.borrow().is_some())
      .count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn with_sender<R>(
    &self,
    key: &K,
    f: impl FnOnce(&watch::Sender<Option<CachedData<K, T>>>) -> R,
  ) -> R {
    let mut entries = self.entries.lock();
    let sender = entries
      .entry(key.clone())
      .or_insert_with(|| watch::channel(None).0);
    f(sender)
  }
}

impl<K, T> Default for InMemoryCache<K, T>
where
  K: Clone + Eq + Hash,
  T: Clone,
{
  fn default() -> Self {
    Self::new()
  }
}

impl<K, T> fmt::Debug for InMemoryCache<K, T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("InMemoryCache")
      .field("keys", &self.entries.lock().len())
      .finish()
  }
}

#[async_trait]
impl<K, T> Cache<K, T> for InMemoryCache<K, T>
where
  K: Clone + Eq + Hash + Send + Sync + 'static,
  T: Clone + Send + Sync + 'static,
{
  fn read(&self, key: &K) -> BoxStream<'static, Option<CachedData<K, T>>> {
    let rx = self.with_sender(key, |sender| sender.subscribe());
    watch_stream(rx)
  }

  async fn write(&self, data: CachedData<K, T>) {
    let key = data.key.clone();
    self.with_sender(&key, |sender| {
      sender.send_replace(Some(data));
    });
  }

  async fn mark_as_stale(&self, key: &K) {
    self.with_sender(key, mark_stale);
  }

  async fn mark_store_as_stale(&self) {
    let entries = self.entries.lock();
    for sender in entries.values() {
      mark_stale(sender);
    }
  }
}

/// Resets the entry held by `sender`, notifying readers even when empty.
pub(crate) fn mark_stale<K, T>(sender: &watch::Sender<Option<CachedData<K, T>>>) {
  sender.send_modify(|entry| {
    if let Some(current) = entry.take() {
      *entry = Some(current.into_stale());
    }
  });
}
