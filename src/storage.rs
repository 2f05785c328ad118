//! Key-value slot storage backing the history store.
//!
//! A slot holds one JSON document. Backends must make `set` all-or-nothing:
//! a concurrent `get` observes either the previous document or the new one.
//! Writers that read, modify and write a slot hold its [`SlotLock`] for the
//! whole cycle; for [`FileStorage`] that lock is an OS file lock, so separate
//! processes sharing a data directory serialize too.

use async_trait::async_trait;
use fs2::FileExt;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Corrupt slot '{slot}': {source}")]
  Corrupt {
    slot: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("Invalid slot name: {0}")]
  InvalidSlot(String),

  #[error("Storage unavailable: {0}")]
  Unavailable(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Exclusive hold on a slot's writers. Released on drop.
#[derive(Debug)]
pub enum SlotLock {
  Local(OwnedMutexGuard<()>),
  File(File),
}

#[async_trait]
pub trait KeyValueStorage: Send + Sync {
  /// Read a slot. A slot that was never written is `None`.
  async fn get(&self, slot: &str) -> StorageResult<Option<Value>>;

  /// Replace a slot's document.
  async fn set(&self, slot: &str, value: Value) -> StorageResult<()>;

  /// Wait until no other writer holds `slot`, then hold it.
  async fn lock(&self, slot: &str) -> StorageResult<SlotLock>;
}

/// Process-local storage. Contents are lost when the process exits.
#[derive(Default)]
pub struct MemoryStorage {
  slots: RwLock<HashMap<String, Value>>,
  writers: Arc<Mutex<()>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl KeyValueStorage for MemoryStorage {
  async fn get(&self, slot: &str) -> StorageResult<Option<Value>> {
    Ok(self.slots.read().await.get(slot).cloned())
  }

  async fn set(&self, slot: &str, value: Value) -> StorageResult<()> {
    self.slots.write().await.insert(slot.to_string(), value);
    Ok(())
  }

  async fn lock(&self, _slot: &str) -> StorageResult<SlotLock> {
    Ok(SlotLock::Local(self.writers.clone().lock_owned().await))
  }
}

/// One JSON file per slot inside a data directory.
///
/// Writes go to a uniquely named temporary sibling first and are renamed into
/// place, so a reader never sees a half-written file. `<slot>.lock` next to
/// the slot carries the writer lock.
#[derive(Clone, Debug)]
pub struct FileStorage {
  base_path: PathBuf,
}

impl FileStorage {
  pub async fn new(base_path: impl Into<PathBuf>) -> StorageResult<Self> {
    let base_path = base_path.into();
    fs::create_dir_all(&base_path).await?;
    Ok(Self { base_path })
  }

  pub fn base_path(&self) -> &Path {
    &self.base_path
  }

  fn slot_path(&self, slot: &str) -> StorageResult<PathBuf> {
    let valid = !slot.is_empty() && slot.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
      return Err(StorageError::InvalidSlot(slot.to_string()));
    }
    Ok(self.base_path.join(format!("{}.json", slot)))
  }
}

#[async_trait]
impl KeyValueStorage for FileStorage {
  async fn get(&self, slot: &str) -> StorageResult<Option<Value>> {
    let path = self.slot_path(slot)?;
    let bytes = match fs::read(&path).await {
      Ok(bytes) => bytes,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(e.into()),
    };
    let value = serde_json::from_slice(&bytes).map_err(|source| StorageError::Corrupt { slot: slot.to_string(), source })?;
    Ok(Some(value))
  }

  async fn set(&self, slot: &str, value: Value) -> StorageResult<()> {
    let path = self.slot_path(slot)?;
    let bytes = serde_json::to_vec(&value).map_err(|source| StorageError::Corrupt { slot: slot.to_string(), source })?;
    let len = bytes.len();
    let base_path = self.base_path.clone();

    blocking(move || {
      let mut tmp = NamedTempFile::new_in(&base_path)?;
      tmp.write_all(&bytes)?;
      tmp.as_file().sync_all()?;
      tmp.persist(&path).map_err(|e| e.error)?;
      Ok(())
    })
    .await?;
    debug!(slot, bytes = len, "storage: slot written");
    Ok(())
  }

  async fn lock(&self, slot: &str) -> StorageResult<SlotLock> {
    let path = self.slot_path(slot)?.with_extension("lock");
    let file = blocking(move || {
      let file = OpenOptions::new().create(true).truncate(false).write(true).open(&path)?;
      file.lock_exclusive()?;
      Ok(file)
    })
    .await?;
    Ok(SlotLock::File(file))
  }
}

async fn blocking<T, F>(f: F) -> StorageResult<T>
where
  T: Send + 'static,
  F: FnOnce() -> std::io::Result<T> + Send + 'static,
{
  tokio::task::spawn_blocking(f)
    .await
    .map_err(|e| StorageError::Unavailable(format!("storage task failed: {}", e)))?
    .map_err(StorageError::from)
}
