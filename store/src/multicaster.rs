//! Single-flight deduplication of fetches.
//!
//! A [`Multicaster`] keeps a mutex-guarded map from key to the fetch currently
//! running for it. Callers arriving while that fetch is active wait on it and
//! receive a clone of its result instead of starting another one.

use crate::data::FetcherResult;
use crate::fetcher::Fetcher;
use crate::metrics::Metrics;
use crate::runtime::TaskSpawner;

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use ahash::HashMap;
use parking_lot::Mutex;

/// The internal state of a shared fetch.
enum State<R> {
  Computing,
  Complete(R),
  /// The task driving the fetch was dropped before producing a result,
  /// either because the fetcher panicked or the runtime shut down.
  Abandoned,
}

struct Inner<R> {
  state: State<R>,
  waiters: VecDeque<Waker>,
}

/// A result being computed by a spawned fetch task.
/// It can be awaited by any number of tasks simultaneously.
pub(crate) struct InFlight<R> {
  inner: Mutex<Inner<R>>,
}

impl<R> InFlight<R> {
  /// Creates a new `InFlight` in the "Computing" state.
  pub(crate) fn new() -> Self {
    Self {
      inner: Mutex::new(Inner {
        state: State::Computing,
        waiters: VecDeque::new(),
      }),
    }
  }

  /// Returns `true` while the fetch has neither completed nor been abandoned.
  pub(crate) fn is_active(&self) -> bool {
    matches!(self.inner.lock().state, State::Computing)
  }

  /// Completes the fetch with a result, waking all waiters.
  pub(crate) fn complete(&self, result: R) {
    self.finish(State::Complete(result));
  }

  /// Marks a still-computing fetch as abandoned, waking all waiters.
  fn abandon(&self) {
    self.finish(State::Abandoned);
  }

  fn finish(&self, state: State<R>) {
    let mut inner = self.inner.lock();
    if !matches!(inner.state, State::Computing) {
      return;
    }
    inner.state = state;
    for waker in inner.waiters.drain(..) {
      waker.wake();
    }
  }
}

impl<R: Clone> Future for &InFlight<R> {
  /// `None` if the fetch was abandoned.
  type Output = Option<R>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let mut inner = self.inner.lock();
    match &inner.state {
      State::Complete(result) => Poll::Ready(Some(result.clone())),
      State::Abandoned => Poll::Ready(None),
      State::Computing => {
        if !inner.waiters.iter().any(|w| w.will_wake(cx.waker())) {
          inner.waiters.push_back(cx.waker().clone());
        }
        Poll::Pending
      }
    }
  }
}

/// Abandons the fetch if the owning task is dropped before completing it.
struct AbandonOnDrop<R>(Arc<InFlight<R>>);

impl<R> Drop for AbandonOnDrop<R> {
  fn drop(&mut self) {
    self.0.abandon();
  }
}

/// How many shared fetches a caller waits on before fetching inline.
const SHARED_ATTEMPTS: usize = 2;

type PendingFetches<K, T, E> = Arc<Mutex<HashMap<K, Arc<InFlight<FetcherResult<T, E>>>>>>;

/// Wraps a [`Fetcher`] so that at most one fetch per key runs at any instant.
///
/// Shared fetches run on the configured [`TaskSpawner`], so a caller that
/// stops waiting does not cancel the fetch for the others.
pub struct Multicaster<K, T, E> {
  fetcher: Arc<dyn Fetcher<K, T, Error = E>>,
  spawner: Arc<dyn TaskSpawner>,
  pending: PendingFetches<K, T, E>,
  metrics: Arc<Metrics>,
}

impl<K, T, E> Multicaster<K, T, E>
where
  K: Clone + Eq + Hash + Send + Sync + 'static,
  T: Clone + Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
{
  pub fn new(
    fetcher: Arc<dyn Fetcher<K, T, Error = E>>,
    spawner: Arc<dyn TaskSpawner>,
  ) -> Self {
    Self::with_metrics(fetcher, spawner, Arc::new(Metrics::new()))
  }

  pub(crate) fn with_metrics(
    fetcher: Arc<dyn Fetcher<K, T, Error = E>>,
    spawner: Arc<dyn TaskSpawner>,
    metrics: Arc<Metrics>,
  ) -> Self {
    Self {
      fetcher,
      spawner,
      pending: Arc::new(Mutex::new(HashMap::default())),
      metrics,
    }
  }

  /// Fetches the value for `key`, joining the fetch already running for it
  /// if there is one.
  ///
  /// If the shared fetch is abandoned, waiters go back to the map: the first
  /// starts a new shared fetch and the rest join it. After a second
  /// abandonment the caller fetches inline, so a fetcher that keeps
  /// panicking surfaces the panic instead of respawning forever.
  pub async fn fetch(&self, key: K) -> FetcherResult<T, E> {
    for _ in 0..SHARED_ATTEMPTS {
      if let Some(result) = (&*self.join_or_start(&key)).await {
        return result;
      }
      tracing::warn!("shared fetch was abandoned");
    }
    tracing::warn!("shared fetches keep failing; fetching inline");
    Metrics::record(&self.metrics.fetches_started);
    self.fetcher.fetch(key).await
  }

  fn join_or_start(&self, key: &K) -> Arc<InFlight<FetcherResult<T, E>>> {
    // A sync lock is fine here: it is only held for a couple of map lookups.
    let mut pending = self.pending.lock();
    match pending.get(key) {
      Some(flight) if flight.is_active() => {
        Metrics::record(&self.metrics.fetches_joined);
        tracing::trace!("joining in-flight fetch");
        flight.clone()
      }
      _ => {
        let flight = Arc::new(InFlight::new());
        pending.insert(key.clone(), flight.clone());
        self.spawn_fetch(key.clone(), flight.clone());
        flight
      }
    }
  }

  /// Returns the number of keys with a fetch currently running.
  pub fn in_flight(&self) -> usize {
    let pending = self.pending.lock();
    pending.values().filter(|flight| flight.is_active()).count()
  }

  fn spawn_fetch(&self, key: K, flight: Arc<InFlight<FetcherResult<T, E>>>) {
    let fetcher = self.fetcher.clone();
    let pending = self.pending.clone();
    let metrics = self.metrics.clone();
    Metrics::record(&metrics.fetches_started);

    let task = async move {
      let guard = AbandonOnDrop(flight);
      tracing::debug!("fetch started");
      let result = fetcher.fetch(key.clone()).await;
      if result.is_err() {
        Metrics::record(&metrics.fetch_failures);
      }
      tracing::debug!(success = result.is_ok(), "fetch finished");

      {
        let mut pending = pending.lock();
        let is_current = pending
          .get(&key)
          .is_some_and(|current| Arc::ptr_eq(current, &guard.0));
        if is_current {
          pending.remove(&key);
        }
      }
      guard.0.complete(result);
    };
    self.spawner.spawn(Box::pin(task));
  }
}

impl<K, T, E> fmt::Debug for Multicaster<K, T, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Multicaster")
      .field("pending_keys", &self.pending.lock().len())
      .finish_non_exhaustive()
  }
}
