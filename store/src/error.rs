use thiserror::Error;

/// Errors that can occur when building a store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
  /// No `Fetcher` was configured.
  #[error("a store requires a fetcher")]
  MissingFetcher,
  /// No `Cache` was configured.
  #[error("a store requires a cache")]
  MissingCache,
  /// No `Mediator` was configured.
  #[error("a store requires a mediator")]
  MissingMediator,
  /// No `TaskSpawner` was configured and the default `tokio` feature is not
  /// enabled.
  #[error("a store requires a task spawner or the 'tokio' feature")]
  SpawnerRequired,
}

/// Internal consistency violations detected by a store.
///
/// These indicate a configuration bug in the mediator or fetcher rather than
/// a runtime condition, and are distinct from the consumer's fetch errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
  /// A value written by this subscription's own fetch was immediately judged
  /// stale by the mediator.
  #[error(
    "entry for key {key} fetched at {last_fetched_millis}ms is stale right after a successful fetch; \
     the mediator rejects the fetcher's own results"
  )]
  StaleAfterFetch {
    key: String,
    last_fetched_millis: u64,
  },
}

/// Errors raised while encoding or decoding a persisted value.
#[derive(Debug, Error)]
pub enum ParseError {
  #[error("failed to encode value: {0}")]
  Encode(String),
  #[error("failed to decode value: {0}")]
  Decode(String),
}

/// Errors raised by a persistent key-value backend.
#[derive(Debug, Error)]
pub enum StorageError {
  #[error("storage backend is unavailable: {0}")]
  Unavailable(String),
  #[error(transparent)]
  Parse(#[from] ParseError),
}
