mod common;

use common::*;

use std::sync::Arc;
use std::time::Duration;

use fibre_store::{
  Cache, CachedData, FnMediator, InMemoryCache, IsCachedMediator, KeyedStoreRequest, ManualClock,
  RefreshStrategy, StoreResponse,
};
use futures_util::future::join_all;
use futures_util::StreamExt;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn stale_entry_is_withheld_until_the_refetch_lands() {
  let clock = ManualClock::new(NOW);
  let cache = seeded_cache("BTC", 100, 2 * HOUR_MS).await;
  let fetcher = TestFetcher::returning(Ok(150));
  let store = build_store(cache.clone(), fetcher.clone(), one_hour_mediator(&clock), &clock);

  let mut responses = store.stream(KeyedStoreRequest::cached(key("BTC"), false));

  assert_eq!(
    take(&mut responses, 2).await,
    vec![StoreResponse::Loading, StoreResponse::Data(150)]
  );
  expect_no_events(&mut responses).await;

  assert_eq!(fetcher.calls(), 1);
  let written = cache.get(&key("BTC")).unwrap();
  assert_eq!(written.data, 150);
  assert_eq!(written.last_fetched_millis, NOW);
}

#[tokio::test]
async fn empty_cache_fetches_and_emits_the_result() {
  let clock = ManualClock::new(NOW);
  let cache = Arc::new(InMemoryCache::new());
  let fetcher = TestFetcher::returning(Ok(7));
  let store = build_store(cache, fetcher.clone(), IsCachedMediator, &clock);

  let mut responses = store.stream(KeyedStoreRequest::cached(key("ETH"), false));

  assert_eq!(
    take(&mut responses, 2).await,
    vec![StoreResponse::Loading, StoreResponse::Data(7)]
  );
  assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn hanging_fetch_never_leaks_the_stale_value() {
  let clock = ManualClock::new(NOW);
  let cache = seeded_cache("BTC", 100, 2 * HOUR_MS).await;
  let fetcher = TestFetcher::hanging();
  let store = build_store(cache, fetcher.clone(), one_hour_mediator(&clock), &clock);

  let mut responses = store.stream(KeyedStoreRequest::cached(key("BTC"), false));

  assert_eq!(next(&mut responses).await, StoreResponse::Loading);
  expect_no_events(&mut responses).await;
  assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn fresh_entry_is_served_without_fetching() {
  let clock = ManualClock::new(NOW);
  let cache = seeded_cache("BTC", 100, 10 * MINUTE_MS).await;
  let fetcher = TestFetcher::returning(Ok(150));
  let store = build_store(cache.clone(), fetcher.clone(), one_hour_mediator(&clock), &clock);

  let mut responses = store.stream(KeyedStoreRequest::cached(key("BTC"), false));

  assert_eq!(next(&mut responses).await, StoreResponse::Data(100));
  expect_no_events(&mut responses).await;
  assert_eq!(fetcher.calls(), 0);

  // The subscription keeps following the cache.
  cache.write(CachedData::new(key("BTC"), 120, NOW)).await;
  assert_eq!(next(&mut responses).await, StoreResponse::Data(120));
  assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn force_refresh_serves_the_cached_value_then_refetches() {
  let clock = ManualClock::new(NOW);
  let cache = seeded_cache("BTC", 100, 10 * MINUTE_MS).await;
  let fetcher = TestFetcher::returning(Ok(150));
  let store = build_store(cache, fetcher.clone(), one_hour_mediator(&clock), &clock);

  let mut responses = store.stream(KeyedStoreRequest::cached(key("BTC"), true));

  assert_eq!(
    take(&mut responses, 3).await,
    vec![
      StoreResponse::Data(100),
      StoreResponse::Loading,
      StoreResponse::Data(150)
    ]
  );
  expect_no_events(&mut responses).await;
  assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn force_refresh_failure_keeps_following_the_cache() {
  let clock = ManualClock::new(NOW);
  let cache = seeded_cache("BTC", 100, 10 * MINUTE_MS).await;
  let fetcher = TestFetcher::returning(Err(TestError("offline")));
  let store = build_store(cache.clone(), fetcher.clone(), one_hour_mediator(&clock), &clock);

  let mut responses = store.stream(KeyedStoreRequest::cached(key("BTC"), true));

  assert_eq!(
    take(&mut responses, 3).await,
    vec![
      StoreResponse::Data(100),
      StoreResponse::Loading,
      StoreResponse::Error(TestError("offline"))
    ]
  );
  expect_no_events(&mut responses).await;

  cache.write(CachedData::new(key("BTC"), 200, NOW)).await;
  assert_eq!(next(&mut responses).await, StoreResponse::Data(200));
  assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn stale_refresh_failure_emits_the_error_and_later_writes() {
  let clock = ManualClock::new(NOW);
  let cache = seeded_cache("BTC", 100, 2 * HOUR_MS).await;
  let fetcher = TestFetcher::returning(Err(TestError("offline")));
  let store = build_store(cache.clone(), fetcher.clone(), one_hour_mediator(&clock), &clock);

  let mut responses = store.stream(KeyedStoreRequest::cached(key("BTC"), false));

  assert_eq!(
    take(&mut responses, 2).await,
    vec![
      StoreResponse::Loading,
      StoreResponse::Error(TestError("offline"))
    ]
  );
  expect_no_events(&mut responses).await;

  cache.write(CachedData::new(key("BTC"), 200, NOW)).await;
  assert_eq!(next(&mut responses).await, StoreResponse::Data(200));
  assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn refresh_if_older_than_refetches_entries_past_the_age() {
  let clock = ManualClock::new(NOW);
  let cache = seeded_cache("BTC", 100, 30 * MINUTE_MS).await;
  let fetcher = TestFetcher::returning(Ok(150));
  let store = build_store(cache, fetcher.clone(), one_hour_mediator(&clock), &clock);

  let request = KeyedStoreRequest::cached_with(
    key("BTC"),
    RefreshStrategy::RefreshIfOlderThan(Duration::from_secs(60)),
  );
  let mut responses = store.stream(request);

  assert_eq!(
    take(&mut responses, 3).await,
    vec![
      StoreResponse::Data(100),
      StoreResponse::Loading,
      StoreResponse::Data(150)
    ]
  );
  assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn refresh_if_older_than_keeps_younger_entries() {
  let clock = ManualClock::new(NOW);
  let cache = seeded_cache("BTC", 100, 30 * MINUTE_MS).await;
  let fetcher = TestFetcher::returning(Ok(150));
  let store = build_store(cache, fetcher.clone(), one_hour_mediator(&clock), &clock);

  let request = KeyedStoreRequest::cached_with(
    key("BTC"),
    RefreshStrategy::RefreshIfOlderThan(Duration::from_secs(3600)),
  );
  let mut responses = store.stream(request);

  assert_eq!(next(&mut responses).await, StoreResponse::Data(100));
  expect_no_events(&mut responses).await;
  assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn identical_consecutive_values_are_emitted_once() {
  let clock = ManualClock::new(NOW);
  let cache = seeded_cache("BTC", 100, 10 * MINUTE_MS).await;
  let store = build_store(
    cache.clone(),
    TestFetcher::returning(Ok(150)),
    one_hour_mediator(&clock),
    &clock,
  );

  let mut responses = store.stream(KeyedStoreRequest::cached(key("BTC"), false));
  assert_eq!(next(&mut responses).await, StoreResponse::Data(100));

  cache.write(CachedData::new(key("BTC"), 100, NOW)).await;
  expect_no_events(&mut responses).await;

  cache.write(CachedData::new(key("BTC"), 101, NOW)).await;
  assert_eq!(next(&mut responses).await, StoreResponse::Data(101));
}

#[tokio::test]
async fn entry_stale_right_after_fetch_is_still_emitted() {
  let clock = ManualClock::new(NOW);
  let cache = seeded_cache("KYC", 1, 10 * MINUTE_MS).await;
  let fetcher = TestFetcher::returning(Ok(2));
  // A mediator that rejects everything, including its own fetch results.
  let mediator = FnMediator::new(|_: Option<&CachedData<String, u32>>| true);
  let store = build_store(cache, fetcher.clone(), mediator, &clock);

  let mut responses = store.stream(KeyedStoreRequest::cached(key("KYC"), false));

  assert_eq!(
    take(&mut responses, 2).await,
    vec![StoreResponse::Loading, StoreResponse::Data(2)]
  );
  expect_no_events(&mut responses).await;
  assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
#[should_panic(expected = "stale right after a successful fetch")]
async fn panicking_invariant_check_reports_rejected_fetch_results() {
  use fibre_store::{InvariantCheck, KeyedStoreBuilder};

  let clock = ManualClock::new(NOW);
  let cache = seeded_cache("KYC", 1, 10 * MINUTE_MS).await;
  let store = KeyedStoreBuilder::new()
    .fetcher(TestFetcher::returning(Ok(2)))
    .cache(cache)
    .mediator(FnMediator::new(|_: Option<&CachedData<String, u32>>| true))
    .clock(Arc::new(clock))
    .invariant_check(InvariantCheck::Panic)
    .build()
    .unwrap();

  let mut responses = store.stream(KeyedStoreRequest::cached(key("KYC"), false));
  assert_eq!(next(&mut responses).await, StoreResponse::Loading);
  // The fetched entry comes back stale, which panics.
  next(&mut responses).await;
}

#[tokio::test]
async fn mark_as_stale_makes_the_next_subscription_refetch() {
  let clock = ManualClock::new(NOW);
  let cache = seeded_cache("BTC", 100, 10 * MINUTE_MS).await;
  let fetcher = TestFetcher::returning(Ok(150));
  let store = build_store(cache.clone(), fetcher.clone(), one_hour_mediator(&clock), &clock);

  let mut first = store.stream(KeyedStoreRequest::cached(key("BTC"), false));
  assert_eq!(next(&mut first).await, StoreResponse::Data(100));
  assert_eq!(fetcher.calls(), 0);

  store.mark_as_stale(&key("BTC")).await;
  assert!(cache.get(&key("BTC")).unwrap().is_marked_stale());

  let mut second = store.stream(KeyedStoreRequest::cached(key("BTC"), false));
  assert_eq!(
    take(&mut second, 2).await,
    vec![StoreResponse::Loading, StoreResponse::Data(150)]
  );
  assert_eq!(fetcher.calls(), 1);

  // The earlier subscription sees the refetched value too.
  assert_eq!(next(&mut first).await, StoreResponse::Data(150));
}

#[tokio::test]
async fn concurrent_subscribers_share_one_fetch() {
  let clock = ManualClock::new(NOW);
  let cache = seeded_cache("BTC", 100, 2 * HOUR_MS).await;
  let fetcher = TestFetcher::slow(Ok(150), Duration::from_millis(50));
  let store = build_store(cache, fetcher.clone(), one_hour_mediator(&clock), &clock);

  let subscribers = (0..10).map(|_| {
    let store = store.clone();
    async move {
      let mut responses = store.stream(KeyedStoreRequest::cached(key("BTC"), false));
      take(&mut responses, 2).await
    }
  });

  for responses in join_all(subscribers).await {
    assert_eq!(responses, vec![StoreResponse::Loading, StoreResponse::Data(150)]);
  }
  assert_eq!(fetcher.calls(), 1);

  let metrics = store.metrics();
  assert_eq!(metrics.subscriptions, 10);
  assert_eq!(metrics.fetches_started, 1);
  assert_eq!(metrics.fetches_joined, 9);
  assert_eq!(metrics.cache_writes, 1, "a shared fetch is written once");
}

#[tokio::test]
async fn fetch_result_lands_when_the_fetch_completes() {
  let clock = ManualClock::new(NOW);
  let cache = Arc::new(InMemoryCache::new());
  let fetcher = TestFetcher::slow(Ok(1), Duration::from_millis(10));
  let store = build_store(cache.clone(), fetcher.clone(), one_hour_mediator(&clock), &clock);

  let mut responses = store.stream(KeyedStoreRequest::cached(key("BTC"), false));
  assert_eq!(next(&mut responses).await, StoreResponse::Loading);
  // Polled just long enough to start the fetch, then left alone.
  let idle = tokio::time::timeout(Duration::from_millis(5), responses.next()).await;
  assert!(idle.is_err());

  tokio::time::sleep(Duration::from_millis(50)).await;
  let written = cache.get(&key("BTC")).unwrap();
  assert_eq!((written.data, written.last_fetched_millis), (1, NOW));

  // A newer write from elsewhere must survive the subscriber catching up.
  clock.advance(Duration::from_secs(1));
  cache.write(CachedData::new(key("BTC"), 2, NOW + 1000)).await;

  assert_eq!(next(&mut responses).await, StoreResponse::Data(2));
  expect_no_events(&mut responses).await;
  let current = cache.get(&key("BTC")).unwrap();
  assert_eq!((current.data, current.last_fetched_millis), (2, NOW + 1000));
  assert_eq!(fetcher.calls(), 1);
  assert_eq!(store.metrics().cache_writes, 1);
}

#[tokio::test]
async fn different_keys_fetch_independently() {
  let clock = ManualClock::new(NOW);
  let cache = Arc::new(InMemoryCache::new());
  let fetcher = TestFetcher::returning(Ok(1));
  let store = build_store(cache.clone(), fetcher.clone(), IsCachedMediator, &clock);

  let mut btc = store.stream(KeyedStoreRequest::cached(key("BTC"), false));
  let mut eth = store.stream(KeyedStoreRequest::cached(key("ETH"), false));

  let expected = vec![StoreResponse::Loading, StoreResponse::Data(1)];
  assert_eq!(take(&mut btc, 2).await, expected);
  assert_eq!(take(&mut eth, 2).await, expected);
  assert_eq!(fetcher.calls(), 2);
  assert_eq!(cache.len(), 2);
}
