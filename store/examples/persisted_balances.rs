use fibre_store::persisted::{MemoryStorage, PersistedCache};
use fibre_store::{
  CacheConfiguration, FreshnessMediator, KeyedStoreBuilder, KeyedStoreRequest, NotificationHub,
  StoreResponse,
};
use futures_util::StreamExt;
use std::sync::{
  atomic::{AtomicU64, Ordering},
  Arc,
};
use tokio::time::{sleep, Duration};

#[derive(Debug, Clone, PartialEq)]
enum WalletEvent {
  TransactionCompleted,
}

// A simulated balance service.
async fn fetch_balance(asset: String, requests: Arc<AtomicU64>) -> Result<u64, String> {
  let attempt = requests.fetch_add(1, Ordering::SeqCst) + 1;
  println!("--- Balance API: request #{} for {}", attempt, asset);
  sleep(Duration::from_millis(200)).await;
  Ok(100 * attempt)
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .init();

  let storage = Arc::new(MemoryStorage::new());
  let requests = Arc::new(AtomicU64::new(0));
  let wallet_events = NotificationHub::new();

  let store = KeyedStoreBuilder::new()
    .fetcher_fn({
      let requests = requests.clone();
      move |asset: String| fetch_balance(asset, requests.clone())
    })
    .cache(Arc::new(PersistedCache::json(storage.clone(), "balances")))
    .mediator(FreshnessMediator::one_hour())
    .reset_on(
      &wallet_events,
      CacheConfiguration::on([WalletEvent::TransactionCompleted]),
    )
    .build()
    .expect("Failed to build balance store");

  println!("--- Five screens open the BTC balance at once ---");
  let mut screens = Vec::new();
  for screen in 0..5 {
    let store = store.clone();
    screens.push(tokio::spawn(async move {
      let mut responses = store.stream(KeyedStoreRequest::cached("BTC".to_string(), false));
      while let Some(response) = responses.next().await {
        println!("[Screen {}] {:?}", screen, response);
        if let StoreResponse::Data(_) = response {
          break;
        }
      }
    }));
  }
  for screen in screens {
    screen.await.unwrap();
  }
  println!("Balance API was called {} time(s).", requests.load(Ordering::SeqCst));
  assert_eq!(requests.load(Ordering::SeqCst), 1);

  println!("\n--- Opening the balance again is served from storage ---");
  let mut responses = store.stream(KeyedStoreRequest::cached("BTC".to_string(), false));
  println!("{:?}", responses.next().await);
  println!("Persisted record: {:?}", storage.get_raw("balances:\"BTC\""));

  println!("\n--- A completed transaction invalidates every balance ---");
  wallet_events.post(WalletEvent::TransactionCompleted);
  sleep(Duration::from_millis(50)).await;
  let mut responses = store.stream(KeyedStoreRequest::cached("BTC".to_string(), false));
  for _ in 0..2 {
    println!("{:?}", responses.next().await);
  }
  assert_eq!(requests.load(Ordering::SeqCst), 2);

  println!("\nStore metrics: {:#?}", store.metrics());
}
