//! Keyed, freshness-aware reactive data stores.
//!
//! A [`KeyedStore`] composes three pieces supplied by the caller:
//!
//! - a [`Cache`] holding the latest value per key and re-emitting it to every
//!   live reader whenever it changes,
//! - a [`Mediator`] deciding whether a cached entry is too old to serve,
//! - a [`Fetcher`] performing the actual (usually network) retrieval.
//!
//! The store wraps the fetcher in a [`Multicaster`] so that concurrent
//! subscribers asking for the same stale key share a single in-flight fetch,
//! and exposes a uniform stream of [`StoreResponse`] values per subscription.
//!
//! # Features
//! - **Single-flight fetches**: at most one fetch per key is running at a time.
//! - **Stale suppression**: values the mediator judges stale are withheld until
//!   a fresh fetch lands.
//! - **Live reads**: every write to the cache is observed by all subscribers.
//! - **Event-driven reset**: stores can be invalidated by application events.
//! - **Persistence**: optional `serde` feature for a JSON-backed cache.

// Public modules that form the API
pub mod builder;
pub mod cache;
pub mod data;
pub mod error;
pub mod fetcher;
pub mod instrumentation;
pub mod mediator;
pub mod metrics;
pub mod multicaster;
pub mod notifications;
pub mod runtime;
pub mod store;
pub mod time;

#[cfg(feature = "serde")]
pub mod persisted;

// Re-export the primary user-facing types for convenience
pub use builder::{InvariantCheck, KeyedStoreBuilder, StoreBuilder};
pub use cache::{Cache, InMemoryCache};
pub use data::{
  CachedData, FetcherResult, KeyedStoreRequest, RefreshStrategy, StoreRequest, StoreResponse,
};
pub use error::{BuildError, StoreError};
pub use fetcher::{FnFetcher, Fetcher};
pub use mediator::{FnMediator, FreshnessMediator, FreshnessWindow, IsCachedMediator, Mediator};
pub use metrics::MetricsSnapshot;
pub use multicaster::Multicaster;
pub use notifications::{CacheConfiguration, NotificationHub};
pub use runtime::TaskSpawner;
pub use store::{KeyedStore, Store};
pub use time::{Clock, ManualClock, SystemClock};
