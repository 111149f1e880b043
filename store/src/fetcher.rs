use crate::data::FetcherResult;

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

/// Performs the actual retrieval of a value for a key.
///
/// A fetcher has no caching knowledge and makes a single attempt per call.
/// Its errors are handed to subscribers verbatim.
#[async_trait]
pub trait Fetcher<K, T>: Send + Sync {
  type Error;

  async fn fetch(&self, key: K) -> FetcherResult<T, Self::Error>;
}

/// A [`Fetcher`] backed by an async closure.
pub struct FnFetcher<K, F> {
  f: F,
  _key_marker: PhantomData<fn(K)>,
}

impl<K, F> FnFetcher<K, F> {
  pub fn new(f: F) -> Self {
    Self {
      f,
      _key_marker: PhantomData,
    }
  }
}

#[async_trait]
impl<K, T, E, F, Fut> Fetcher<K, T> for FnFetcher<K, F>
where
  K: Send + 'static,
  T: Send + 'static,
  E: Send + 'static,
  F: Fn(K) -> Fut + Send + Sync,
  Fut: Future<Output = FetcherResult<T, E>> + Send + 'static,
{
  type Error = E;

  async fn fetch(&self, key: K) -> FetcherResult<T, E> {
    (self.f)(key).await
  }
}

impl<K, F> fmt::Debug for FnFetcher<K, F> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FnFetcher").finish_non_exhaustive()
  }
}
