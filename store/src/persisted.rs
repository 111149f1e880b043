//! A [`Cache`] persisted to a key-value backend.
//!
//! Values are encoded by an injected [`Parser`] and stored next to their
//! fetch time under `"{namespace}:{json key}"`, with `:` escaped in the
//! namespace. Live reads work exactly like
//! [`InMemoryCache`](crate::InMemoryCache); a key's record is loaded from the
//! backend the first time it is read.

use crate::cache::{mark_stale, watch_stream, Cache};
use crate::data::CachedData;
use crate::error::{ParseError, StorageError};

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use ahash::HashMap;
use async_stream::stream;
use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, OnceCell};

/// An encode/decode strategy for persisted values.
pub trait Parser<T>: Send + Sync {
  fn encode(&self, value: &T) -> Result<String, ParseError>;
  fn decode(&self, raw: &str) -> Result<T, ParseError>;
}

/// Encodes values as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonParser;

impl<T> Parser<T> for JsonParser
where
  T: Serialize + DeserializeOwned,
{
  fn encode(&self, value: &T) -> Result<String, ParseError> {
    serde_json::to_string(value).map_err(|e| ParseError::Encode(e.to_string()))
  }

  fn decode(&self, raw: &str) -> Result<T, ParseError> {
    serde_json::from_str(raw).map_err(|e| ParseError::Decode(e.to_string()))
  }
}

/// A string key-value backend, such as a SQL table or a file.
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
  async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
  async fn put(&self, key: &str, value: String) -> Result<(), StorageError>;
  /// Returns every stored key starting with `prefix`.
  async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// A [`KeyValueStorage`] held in memory, mostly useful for tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
  entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.entries.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.lock().is_empty()
  }

  /// Overwrites a raw record, bypassing any parser.
  pub fn insert_raw(&self, key: impl Into<String>, value: impl Into<String>) {
    self.entries.lock().insert(key.into(), value.into());
  }

  pub fn get_raw(&self, key: &str) -> Option<String> {
    self.entries.lock().get(key).cloned()
  }
}

#[async_trait]
impl KeyValueStorage for MemoryStorage {
  async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
    Ok(self.get_raw(key))
  }

  async fn put(&self, key: &str, value: String) -> Result<(), StorageError> {
    self.entries.lock().insert(key.to_string(), value);
    Ok(())
  }

  async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
    let entries = self.entries.lock();
    Ok(
      entries
        .range(prefix.to_string()..)
        .take_while(|(key, _)| key.starts_with(prefix))
        .map(|(key, _)| key.clone())
        .collect(),
    )
  }
}

/// The on-disk shape of one entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
  data: String,
  last_fetched_millis: u64,
}

/// The live state of one key.
struct Slot<K, T> {
  sender: watch::Sender<Option<CachedData<K, T>>>,
  loaded: OnceCell<()>,
}

pub struct PersistedCache<K, T, P = JsonParser, S = MemoryStorage> {
  storage: Arc<S>,
  parser: Arc<P>,
  namespace: String,
  slots: Mutex<HashMap<K, Arc<Slot<K, T>>>>,
  _value_marker: PhantomData<fn() -> T>,
}

impl<K, T, S> PersistedCache<K, T, JsonParser, S>
where
  K: Clone + Eq + Hash + Serialize,
  T: Serialize + DeserializeOwned,
  S: KeyValueStorage,
{
  /// Creates a JSON-encoded cache storing its records under `namespace`.
  pub fn json(storage: Arc<S>, namespace: impl Into<String>) -> Self {
    Self::with_parser(storage, JsonParser, namespace)
  }
}

impl<K, T, P, S> PersistedCache<K, T, P, S>
where
  K: Clone + Eq + Hash + Serialize,
  P: Parser<T>,
  S: KeyValueStorage,
{
  /// Creates a cache storing its records under `namespace`.
  ///
  /// `:` and `%` in the namespace are percent-escaped in storage keys, so no
  /// namespace's prefix matches the records of another.
  pub fn with_parser(storage: Arc<S>, parser: P, namespace: impl Into<String>) -> Self {
    Self {
      storage,
      parser: Arc::new(parser),
      namespace: escape_namespace(&namespace.into()),
      slots: Mutex::new(HashMap::default()),
      _value_marker: PhantomData,
    }
  }

  fn prefix(&self) -> String {
    format!("{}:", self.namespace)
  }

  fn storage_key(&self, key: &K) -> Result<String, ParseError> {
    let encoded = serde_json::to_string(key).map_err(|e| ParseError::Encode(e.to_string()))?;
    Ok(format!("{}{}", self.prefix(), encoded))
  }

  fn slot(&self, key: &K) -> Arc<Slot<K, T>> {
    let mut slots = self.slots.lock();
    slots
      .entry(key.clone())
      .or_insert_with(|| {
        Arc::new(Slot {
          sender: watch::channel(None).0,
          loaded: OnceCell::new(),
        })
      })
      .clone()
  }
}

fn escape_namespace(namespace: &str) -> String {
  namespace.replace('%', "%25").replace(':', "%3A")
}

/// Loads and decodes the stored entry for `key`, logging failures as misses.
async fn load_entry<K, T, P, S>(
  storage: &S,
  parser: &P,
  storage_key: &str,
  key: &K,
) -> Option<CachedData<K, T>>
where
  K: Clone,
  P: Parser<T>,
  S: KeyValueStorage,
{
  let raw = match storage.get(storage_key).await {
    Ok(raw) => raw?,
    Err(error) => {
      tracing::warn!(%error, storage_key, "failed to read persisted entry");
      return None;
    }
  };
  let decoded = serde_json::from_str::<StoredRecord>(&raw)
    .map_err(|e| ParseError::Decode(e.to_string()))
    .and_then(|record| Ok((parser.decode(&record.data)?, record.last_fetched_millis)));
  match decoded {
    Ok((data, last_fetched_millis)) => {
      Some(CachedData::new(key.clone(), data, last_fetched_millis))
    }
    Err(error) => {
      tracing::warn!(%error, storage_key, "discarding undecodable persisted entry");
      None
    }
  }
}

/// Rewrites the stored record under `storage_key` with a zero fetch time.
async fn reset_record<S: KeyValueStorage>(storage: &S, storage_key: &str) {
  let result: Result<(), StorageError> = async {
    let raw = match storage.get(storage_key).await? {
      Some(raw) => raw,
      None => return Ok(()),
    };
    let mut record: StoredRecord =
      serde_json::from_str(&raw).map_err(|e| ParseError::Decode(e.to_string()))?;
    record.last_fetched_millis = 0;
    let raw = serde_json::to_string(&record).map_err(|e| ParseError::Encode(e.to_string()))?;
    storage.put(storage_key, raw).await
  }
  .await;
  if let Err(error) = result {
    tracing::warn!(%error, storage_key, "failed to mark persisted entry as stale");
  }
}

#[async_trait]
impl<K, T, P, S> Cache<K, T> for PersistedCache<K, T, P, S>
where
  K: Clone + Eq + Hash + Serialize + Send + Sync + 'static,
  T: Clone + Send + Sync + 'static,
  P: Parser<T> + 'static,
  S: KeyValueStorage + 'static,
{
  fn read(&self, key: &K) -> BoxStream<'static, Option<CachedData<K, T>>> {
    let slot = self.slot(key);
    let rx = slot.sender.subscribe();
    let storage = self.storage.clone();
    let parser = self.parser.clone();
    let storage_key = self.storage_key(key);
    let key = key.clone();

    let entries = stream! {
      slot
        .loaded
        .get_or_init(|| async {
          let loaded: Option<CachedData<K, T>> = match &storage_key {
            Ok(storage_key) => load_entry(&*storage, &*parser, storage_key, &key).await,
            Err(error) => {
              tracing::warn!(%error, "key cannot be encoded; reading as empty");
              None
            }
          };
          // A write that raced with the load already holds newer data.
          slot.sender.send_if_modified(|current| {
            if current.is_none() && loaded.is_some() {
              *current = loaded;
              true
            } else {
              false
            }
          });
        })
        .await;

      let mut entries = watch_stream(rx);
      while let Some(entry) = entries.next().await {
        yield entry;
      }
    };
    entries.boxed()
  }

  async fn write(&self, data: CachedData<K, T>) {
    let slot = self.slot(&data.key);
    let persisted: Result<(), StorageError> = async {
      let storage_key = self.storage_key(&data.key)?;
      let record = StoredRecord {
        data: self.parser.encode(&data.data)?,
        last_fetched_millis: data.last_fetched_millis,
      };
      let raw = serde_json::to_string(&record).map_err(|e| ParseError::Encode(e.to_string()))?;
      self.storage.put(&storage_key, raw).await
    }
    .await;
    if let Err(error) = persisted {
      tracing::warn!(%error, "failed to persist entry; keeping it in memory only");
    }
    // Writes supersede whatever the backend held before.
    let _ = slot.loaded.set(());
    slot.sender.send_replace(Some(data));
  }

  async fn mark_as_stale(&self, key: &K) {
    match self.storage_key(key) {
      Ok(storage_key) => reset_record(&*self.storage, &storage_key).await,
      Err(error) => tracing::warn!(%error, "key cannot be encoded; skipping persisted reset"),
    }
    let slot = self.slot(key);
    mark_stale(&slot.sender);
  }

  async fn mark_store_as_stale(&self) {
    let prefix = self.prefix();
    match self.storage.keys_with_prefix(&prefix).await {
      Ok(keys) => {
        for storage_key in keys {
          reset_record(&*self.storage, &storage_key).await;
        }
      }
      Err(error) => tracing::warn!(%error, "failed to list persisted entries"),
    }
    let slots: Vec<_> = self.slots.lock().values().cloned().collect();
    for slot in slots {
      mark_stale(&slot.sender);
    }
  }
}

impl<K, T, P, S> fmt::Debug for PersistedCache<K, T, P, S> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PersistedCache")
      .field("namespace", &self.namespace)
      .field("live_keys", &self.slots.lock().len())
      .finish_non_exhaustive()
  }
}
