#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fibre_store::{
  CachedData, Fetcher, FetcherResult, FreshnessMediator, InMemoryCache, InvariantCheck, KeyedStore,
  KeyedStoreBuilder, ManualClock, Mediator, StoreResponse,
};
use futures_util::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::time::timeout;

pub const MINUTE_MS: u64 = 60 * 1000;
pub const HOUR_MS: u64 = 60 * MINUTE_MS;
/// The time every test clock starts at.
pub const NOW: u64 = 100 * HOUR_MS;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestError(pub &'static str);

pub type Response = StoreResponse<u32, TestError>;

enum Behaviour {
  Respond,
  Hang,
}

struct FetcherState {
  calls: AtomicUsize,
  scripted: Mutex<VecDeque<FetcherResult<u32, TestError>>>,
  fallback: FetcherResult<u32, TestError>,
  delay: Duration,
  behaviour: Behaviour,
}

/// A fetcher with scripted results that counts its invocations.
#[derive(Clone)]
pub struct TestFetcher {
  state: Arc<FetcherState>,
}

impl TestFetcher {
  fn build(fallback: FetcherResult<u32, TestError>, delay: Duration, behaviour: Behaviour) -> Self {
    Self {
      state: Arc::new(FetcherState {
        calls: AtomicUsize::new(0),
        scripted: Mutex::new(VecDeque::new()),
        fallback,
        delay,
        behaviour,
      }),
    }
  }

  /// Always returns `result`.
  pub fn returning(result: FetcherResult<u32, TestError>) -> Self {
    Self::build(result, Duration::ZERO, Behaviour::Respond)
  }

  /// Returns `result` after sleeping for `delay`.
  pub fn slow(result: FetcherResult<u32, TestError>, delay: Duration) -> Self {
    Self::build(result, delay, Behaviour::Respond)
  }

  /// Never completes.
  pub fn hanging() -> Self {
    Self::build(Err(TestError("unreachable")), Duration::ZERO, Behaviour::Hang)
  }

  /// Serves `result` once before falling back to the default result.
  pub fn then(self, result: FetcherResult<u32, TestError>) -> Self {
    self.state.scripted.lock().push_back(result);
    self
  }

  pub fn calls(&self) -> usize {
    self.state.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl<K: Send + 'static> Fetcher<K, u32> for TestFetcher {
  type Error = TestError;

  async fn fetch(&self, _key: K) -> FetcherResult<u32, TestError> {
    self.state.calls.fetch_add(1, Ordering::SeqCst);
    if let Behaviour::Hang = self.state.behaviour {
      std::future::pending::<()>().await;
    }
    if !self.state.delay.is_zero() {
      tokio::time::sleep(self.state.delay).await;
    }
    let scripted = self.state.scripted.lock().pop_front();
    scripted.unwrap_or_else(|| self.state.fallback.clone())
  }
}

pub fn key(name: &str) -> String {
  name.to_string()
}

/// A cache holding `value` for `key`, fetched `age_ms` before [`NOW`].
pub async fn seeded_cache(key: &str, value: u32, age_ms: u64) -> Arc<InMemoryCache<String, u32>> {
  use fibre_store::Cache;

  let cache = Arc::new(InMemoryCache::new());
  cache
    .write(CachedData::new(key.to_string(), value, NOW - age_ms))
    .await;
  cache
}

pub fn one_hour_mediator(clock: &ManualClock) -> FreshnessMediator<u32> {
  FreshnessMediator::one_hour().clock(Arc::new(clock.clone()))
}

pub fn build_store<M>(
  cache: Arc<InMemoryCache<String, u32>>,
  fetcher: TestFetcher,
  mediator: M,
  clock: &ManualClock,
) -> KeyedStore<String, u32, TestError>
where
  M: Mediator<String, u32> + 'static,
{
  KeyedStoreBuilder::new()
    .fetcher(fetcher)
    .cache(cache)
    .mediator(mediator)
    .clock(Arc::new(clock.clone()))
    .invariant_check(InvariantCheck::Log)
    .build()
    .unwrap()
}

/// Waits for the next response, failing the test after a second.
pub async fn next(stream: &mut BoxStream<'static, Response>) -> Response {
  timeout(Duration::from_secs(1), stream.next())
    .await
    .expect("timed out waiting for a store response")
    .expect("store stream ended unexpectedly")
}

/// Collects the next `count` responses.
pub async fn take(stream: &mut BoxStream<'static, Response>, count: usize) -> Vec<Response> {
  let mut responses = Vec::with_capacity(count);
  for _ in 0..count {
    responses.push(next(stream).await);
  }
  responses
}

/// Asserts that the stream stays silent for a short while.
pub async fn expect_no_events(stream: &mut BoxStream<'static, Response>) {
  if let Ok(event) = timeout(Duration::from_millis(100), stream.next()).await {
    panic!("expected no events, got {:?}", event);
  }
}
