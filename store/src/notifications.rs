//! Application events that invalidate stores.
//!
//! A [`NotificationHub`] is an explicitly constructed broadcast hub shared by
//! whoever posts events (a payload update, a completed transaction, a logout)
//! and the stores that must be reset when those events happen. Which events
//! reset a store is described by its [`CacheConfiguration`].

use std::fmt;

use tokio::sync::broadcast::{self, error::RecvError};

const DEFAULT_HUB_CAPACITY: usize = 64;

/// A cloneable, multi-subscriber event hub.
pub struct NotificationHub<Ev> {
  sender: broadcast::Sender<Ev>,
}

impl<Ev: Clone> NotificationHub<Ev> {
  pub fn new() -> Self {
    Self::with_capacity(DEFAULT_HUB_CAPACITY)
  }

  /// Creates a hub that buffers up to `capacity` events per lagging
  /// subscriber.
  pub fn with_capacity(capacity: usize) -> Self {
    let (sender, _) = broadcast::channel(capacity.max(1));
    Self { sender }
  }

  /// Posts an event to every current subscriber, returning how many there
  /// were.
  pub fn post(&self, event: Ev) -> usize {
    self.sender.send(event).unwrap_or(0)
  }

  pub fn subscribe(&self) -> broadcast::Receiver<Ev> {
    self.sender.subscribe()
  }

  pub fn subscriber_count(&self) -> usize {
    self.sender.receiver_count()
  }
}

impl<Ev: Clone> Default for NotificationHub<Ev> {
  fn default() -> Self {
    Self::new()
  }
}

impl<Ev> Clone for NotificationHub<Ev> {
  fn clone(&self) -> Self {
    Self {
      sender: self.sender.clone(),
    }
  }
}

impl<Ev> fmt::Debug for NotificationHub<Ev> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("NotificationHub")
      .field("subscribers", &self.sender.receiver_count())
      .finish()
  }
}

/// The set of events that reset a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfiguration<Ev> {
  reset_on: Vec<Ev>,
}

impl<Ev> CacheConfiguration<Ev> {
  /// Resets on the given events.
  pub fn on(events: impl IntoIterator<Item = Ev>) -> Self {
    Self {
      reset_on: events.into_iter().collect(),
    }
  }

  pub fn resets_on(&self, event: &Ev) -> bool
  where
    Ev: PartialEq,
  {
    self.reset_on.contains(event)
  }

  pub fn is_empty(&self) -> bool {
    self.reset_on.is_empty()
  }
}

/// Never resets.
impl<Ev> Default for CacheConfiguration<Ev> {
  fn default() -> Self {
    Self {
      reset_on: Vec::new(),
    }
  }
}

/// Filters a hub subscription down to the events a store resets on.
pub(crate) struct ResetListener<Ev> {
  rx: broadcast::Receiver<Ev>,
  config: CacheConfiguration<Ev>,
}

impl<Ev: Clone + PartialEq> ResetListener<Ev> {
  pub(crate) fn new(hub: &NotificationHub<Ev>, config: CacheConfiguration<Ev>) -> Self {
    Self {
      rx: hub.subscribe(),
      config,
    }
  }

  /// Waits for the next resetting event. Returns `false` once the hub closes.
  pub(crate) async fn next_reset(&mut self) -> bool {
    loop {
      match self.rx.recv().await {
        Ok(event) if self.config.resets_on(&event) => return true,
        Ok(_) => continue,
        // Dropped events may have included a resetting one.
        Err(RecvError::Lagged(skipped)) => {
          tracing::warn!(skipped, "reset listener lagged behind the notification hub");
          return true;
        }
        Err(RecvError::Closed) => return false,
      }
    }
  }
}
