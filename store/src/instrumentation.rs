//! Manual response injection for fetchers.
//!
//! An [`InstrumentationQueue`] holds canned fetch results per key. Wrapping a
//! fetcher in an [`InstrumentedFetcher`] makes it serve those results, in the
//! order they were pushed, before falling back to the real fetcher. The queue
//! is an ordinary value: construct one, share it (it is cheap to clone) with
//! whatever needs to inject responses, and call [`reset`] between tests.
//!
//! [`reset`]: InstrumentationQueue::reset

use crate::data::FetcherResult;
use crate::fetcher::Fetcher;

use std::collections::VecDeque;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use ahash::HashMap;
use async_trait::async_trait;
use parking_lot::Mutex;

pub struct InstrumentationQueue<K, T, E> {
  queued: Arc<Mutex<HashMap<K, VecDeque<FetcherResult<T, E>>>>>,
}

impl<K, T, E> InstrumentationQueue<K, T, E>
where
  K: Eq + Hash,
{
  pub fn new() -> Self {
    Self {
      queued: Arc::new(Mutex::new(HashMap::default())),
    }
  }

  /// Queues a result to be served by the next fetch of `key`.
  pub fn push(&self, key: K, result: FetcherResult<T, E>) {
    let mut queued = self.queued.lock();
    queued.entry(key).or_default().push_back(result);
  }

  /// Removes and returns the oldest queued result for `key`.
  pub fn take(&self, key: &K) -> Option<FetcherResult<T, E>> {
    let mut queued = self.queued.lock();
    let results = queued.get_mut(key)?;
    let result = results.pop_front();
    if results.is_empty() {
      queued.remove(key);
    }
    result
  }

  /// Returns the number of results queued for `key`.
  pub fn pending(&self, key: &K) -> usize {
    let queued = self.queued.lock();
    queued.get(key).map_or(0, VecDeque::len)
  }

  /// Drops every queued result.
  pub fn reset(&self) {
    self.queued.lock().clear();
  }
}

impl<K: Eq + Hash, T, E> Default for InstrumentationQueue<K, T, E> {
  fn default() -> Self {
    Self::new()
  }
}

impl<K, T, E> Clone for InstrumentationQueue<K, T, E> {
  fn clone(&self) -> Self {
    Self {
      queued: self.queued.clone(),
    }
  }
}

impl<K, T, E> fmt::Debug for InstrumentationQueue<K, T, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("InstrumentationQueue")
      .field("keys", &self.queued.lock().len())
      .finish()
  }
}

/// A [`Fetcher`] that serves queued results before calling its inner fetcher.
pub struct InstrumentedFetcher<K, T, E, F> {
  inner: F,
  queue: InstrumentationQueue<K, T, E>,
}

impl<K, T, E, F> InstrumentedFetcher<K, T, E, F> {
  pub fn new(inner: F, queue: InstrumentationQueue<K, T, E>) -> Self {
    Self { inner, queue }
  }
}

#[async_trait]
impl<K, T, E, F> Fetcher<K, T> for InstrumentedFetcher<K, T, E, F>
where
  K: Eq + Hash + Send + Sync + 'static,
  T: Send + 'static,
  E: Send + 'static,
  F: Fetcher<K, T, Error = E>,
{
  type Error = E;

  async fn fetch(&self, key: K) -> FetcherResult<T, E> {
    if let Some(result) = self.queue.take(&key) {
      tracing::debug!("serving injected fetch result");
      return result;
    }
    self.inner.fetch(key).await
  }
}

impl<K, T, E, F> fmt::Debug for InstrumentedFetcher<K, T, E, F> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("InstrumentedFetcher")
      .field("queue", &self.queue)
      .finish_non_exhaustive()
  }
}
