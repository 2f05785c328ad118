//! The media history store.
//!
//! All mutations run as a read-modify-write of a single storage slot while
//! holding `write_lock` and the storage's [`SlotLock`] for that slot, so
//! concurrent detections and deletions from many callers, including other
//! stores over the same storage, serialize into a consistent newest-first
//! sequence.

use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::constants::constants;
use crate::media::{DeleteKey, MediaEntry};
use crate::notifier::{ChangeNotifier, Snapshot, Subscription};
use crate::storage::{KeyValueStorage, SlotLock, StorageError};

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("storage {op} failed: {source}")]
  Storage {
    op: &'static str,
    #[source]
    source: StorageError,
  },

  #[error("storage {op} timed out after {timeout:?}")]
  Timeout { op: &'static str, timeout: Duration },

  #[error("persisted history is not a list: {0}")]
  Malformed(#[source] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// What `record_detection` did with a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
  /// The candidate became the newest entry; `evicted` old entries were dropped.
  Inserted { evicted: usize },
  /// An entry with the same (`url`, `page_url`) already exists and was kept.
  Duplicate,
  /// The candidate has no url and was dropped.
  Rejected,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
  /// Storage slot holding the serialized history.
  pub slot: String,
  pub capacity: usize,
  /// Upper bound on each individual storage call.
  pub timeout: Duration,
}

impl Default for StoreSettings {
  fn default() -> Self {
    let c = constants();
    Self {
      slot: c.history_slot.clone(),
      capacity: c.max_entries,
      timeout: Duration::from_millis(c.storage_timeout_ms),
    }
  }
}

pub struct HistoryStore {
  storage: Arc<dyn KeyValueStorage>,
  settings: StoreSettings,
  /// Held across each read-modify-write. Guards the published revision counter.
  write_lock: Mutex<u64>,
  notifier: ChangeNotifier,
}

/// Restore the history invariants on a loaded sequence: no empty urls, the
/// first (newest) occurrence of each dedup key wins, at most `capacity` entries.
fn repair(entries: Vec<MediaEntry>, capacity: usize) -> (Vec<MediaEntry>, usize) {
  let before = entries.len();
  let mut seen = HashSet::new();
  let repaired: Vec<MediaEntry> = entries
    .into_iter()
    .filter(|e| !e.url.is_empty())
    .filter(|e| seen.insert((e.url.clone(), e.page_url.clone())))
    .take(capacity)
    .collect();
  let dropped = before - repaired.len();
  (repaired, dropped)
}

impl HistoryStore {
  pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
    Self::with_settings(storage, StoreSettings::default())
  }

  pub fn with_settings(storage: Arc<dyn KeyValueStorage>, settings: StoreSettings) -> Self {
    Self { storage, settings, write_lock: Mutex::new(0), notifier: ChangeNotifier::new() }
  }

  pub fn settings(&self) -> &StoreSettings {
    &self.settings
  }

  pub fn notifier(&self) -> &ChangeNotifier {
    &self.notifier
  }

  pub fn subscribe(&self) -> Subscription {
    self.notifier.subscribe()
  }

  async fn bounded<T, F>(&self, op: &'static str, fut: F) -> StoreResult<T>
  where
    F: Future<Output = Result<T, StorageError>>,
  {
    let timeout = self.settings.timeout;
    match tokio::time::timeout(timeout, fut).await {
      Ok(Ok(value)) => Ok(value),
      Ok(Err(source)) => {
        error!(op, err = %source, "store: storage call failed");
        Err(StoreError::Storage { op, source })
      }
      Err(_) => {
        error!(op, ?timeout, "store: storage call timed out");
        Err(StoreError::Timeout { op, timeout })
      }
    }
  }

  async fn lock_slot(&self) -> StoreResult<SlotLock> {
    self.bounded("lock", self.storage.lock(&self.settings.slot)).await
  }

  async fn load(&self) -> StoreResult<Vec<MediaEntry>> {
    let Some(raw) = self.bounded("read", self.storage.get(&self.settings.slot)).await? else {
      return Ok(Vec::new());
    };
    let items: Vec<Value> = serde_json::from_value(raw).map_err(StoreError::Malformed)?;

    let total = items.len();
    let entries: Vec<MediaEntry> = items.into_iter().filter_map(|item| serde_json::from_value(item).ok()).collect();
    if entries.len() < total {
      warn!(skipped = total - entries.len(), "store: skipped unreadable history entries");
    }

    let (entries, dropped) = repair(entries, self.settings.capacity);
    if dropped > 0 {
      warn!(dropped, "store: repaired persisted history");
    }
    Ok(entries)
  }

  async fn persist(&self, entries: &[MediaEntry]) -> StoreResult<()> {
    let value = serde_json::to_value(entries).map_err(|source| StoreError::Storage {
      op: "write",
      source: StorageError::Corrupt { slot: self.settings.slot.clone(), source },
    })?;
    self.bounded("write", self.storage.set(&self.settings.slot, value)).await
  }

  /// Commit a new sequence and notify observers. Caller holds `write_lock`.
  async fn commit(&self, revision: &mut u64, entries: Vec<MediaEntry>) -> StoreResult<()> {
    self.persist(&entries).await?;
    *revision += 1;
    self.notifier.publish(Snapshot::new(*revision, entries));
    Ok(())
  }

  /// Record a detected media element.
  ///
  /// First-seen wins: if the (`url`, `page_url`) pair is already present the
  /// existing entry is kept untouched. On error nothing is written.
  pub async fn record_detection(&self, candidate: MediaEntry) -> StoreResult<RecordOutcome> {
    if candidate.url.trim().is_empty() {
      debug!(page_url = %candidate.page_url, "store: dropping candidate without url");
      return Ok(RecordOutcome::Rejected);
    }
    let candidate = candidate.normalized();

    let mut revision = self.write_lock.lock().await;
    let _slot = self.lock_slot().await?;
    let mut entries = self.load().await?;
    if entries.iter().any(|e| e.dedup_key() == candidate.dedup_key()) {
      debug!(url = %candidate.url, page_url = %candidate.page_url, "store: duplicate detection ignored");
      return Ok(RecordOutcome::Duplicate);
    }

    let (url, media_type) = (candidate.url.clone(), candidate.media_type);
    entries.insert(0, candidate);
    let evicted = entries.len().saturating_sub(self.settings.capacity);
    entries.truncate(self.settings.capacity);
    let len = entries.len();

    self.commit(&mut revision, entries).await?;
    info!(%url, %media_type, len, evicted, "store: media recorded");
    Ok(RecordOutcome::Inserted { evicted })
  }

  /// Remove every entry matching `key` exactly. Returns how many were removed.
  pub async fn delete_entry(&self, key: &DeleteKey) -> StoreResult<usize> {
    let mut revision = self.write_lock.lock().await;
    let _slot = self.lock_slot().await?;
    let mut entries = self.load().await?;
    let before = entries.len();
    entries.retain(|e| !e.matches(key));
    let removed = before - entries.len();
    if removed == 0 {
      debug!(url = %key.url, timestamp = %key.timestamp, "store: delete matched nothing");
      return Ok(0);
    }

    self.commit(&mut revision, entries).await?;
    info!(url = %key.url, removed, "store: media deleted");
    Ok(removed)
  }

  /// Re-read the slot and publish it if another writer changed it since the
  /// last snapshot this store published. Returns whether anything was published.
  pub async fn refresh(&self) -> StoreResult<bool> {
    let mut revision = self.write_lock.lock().await;
    let entries = self.load().await?;
    if self.notifier.current().entries() == entries.as_slice() {
      return Ok(false);
    }
    *revision += 1;
    debug!(revision = *revision, len = entries.len(), "store: picked up external changes");
    self.notifier.publish(Snapshot::new(*revision, entries));
    Ok(true)
  }

  /// A newest-first snapshot of the committed history.
  pub async fn query(&self) -> StoreResult<Snapshot> {
    let revision = self.notifier.current().revision();
    let entries = self.load().await?;
    Ok(Snapshot::new(revision, entries))
  }
}
