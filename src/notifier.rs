//! Snapshot broadcasting for history observers.
//!
//! Observers receive the latest full snapshot after each mutation. Delivery
//! is coalesced: a slow observer skips intermediate snapshots and only sees
//! the newest one.

use std::ops::{ControlFlow, Deref};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::media::MediaEntry;

/// An immutable, cheaply clonable copy of the history, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
  revision: u64,
  entries: Arc<[MediaEntry]>,
}

impl Snapshot {
  pub fn new(revision: u64, entries: Vec<MediaEntry>) -> Self {
    Self { revision, entries: entries.into() }
  }

  /// Number of mutations published before this snapshot was taken.
  pub fn revision(&self) -> u64 {
    self.revision
  }

  pub fn entries(&self) -> &[MediaEntry] {
    &self.entries
  }

  pub fn to_vec(&self) -> Vec<MediaEntry> {
    self.entries.to_vec()
  }
}

impl Deref for Snapshot {
  type Target = [MediaEntry];

  fn deref(&self) -> &Self::Target {
    &self.entries
  }
}

pub struct ChangeNotifier {
  tx: watch::Sender<Snapshot>,
}

impl Default for ChangeNotifier {
  fn default() -> Self {
    Self::new()
  }
}

impl ChangeNotifier {
  pub fn new() -> Self {
    let (tx, _) = watch::channel(Snapshot::default());
    Self { tx }
  }

  /// Register an observer. Only snapshots published after this call are delivered.
  pub fn subscribe(&self) -> Subscription {
    Subscription { rx: self.tx.subscribe() }
  }

  /// Publish a new snapshot to every subscriber.
  pub fn publish(&self, snapshot: Snapshot) {
    let revision = snapshot.revision();
    let len = snapshot.len();
    self.tx.send_replace(snapshot);
    debug!(revision, len, observers = self.tx.receiver_count(), "notifier: snapshot published");
  }

  /// The most recently published snapshot.
  pub fn current(&self) -> Snapshot {
    self.tx.borrow().clone()
  }

  pub fn observer_count(&self) -> usize {
    self.tx.receiver_count()
  }

  /// Run `handler` on a background task for every delivered snapshot.
  ///
  /// Returning `ControlFlow::Break(())` from the handler unsubscribes it.
  /// Must be called from within a Tokio runtime.
  pub fn observe<F>(&self, mut handler: F) -> ObserverHandle
  where
    F: FnMut(&Snapshot) -> ControlFlow<()> + Send + 'static,
  {
    let mut subscription = self.subscribe();
    let handle = tokio::spawn(async move {
      while let Some(snapshot) = subscription.changed().await {
        if handler(&snapshot).is_break() {
          break;
        }
      }
    });
    ObserverHandle { handle }
  }
}

/// A registered observer. Dropping it (or calling [`Subscription::unsubscribe`])
/// stops delivery.
pub struct Subscription {
  rx: watch::Receiver<Snapshot>,
}

impl Subscription {
  /// Wait for the next published snapshot.
  ///
  /// Returns `None` once the notifier has been dropped.
  pub async fn changed(&mut self) -> Option<Snapshot> {
    self.rx.changed().await.ok()?;
    Some(self.rx.borrow_and_update().clone())
  }

  pub fn latest(&self) -> Snapshot {
    self.rx.borrow().clone()
  }

  pub fn unsubscribe(self) {}
}

pub struct ObserverHandle {
  handle: JoinHandle<()>,
}

impl ObserverHandle {
  pub fn cancel(self) {
    self.handle.abort();
  }

  pub fn is_finished(&self) -> bool {
    self.handle.is_finished()
  }

  /// Wait for the observer task to end (handler broke out, or the notifier went away).
  pub async fn join(self) {
    let _ = self.handle.await;
  }
}
