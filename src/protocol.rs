//! The message protocol between detectors, UI surfaces and the history store.
//!
//! Wire shape: `{"type": "MEDIA_DETECTED", "payload": {...}}` or
//! `{"type": "DELETE_MEDIA", "payload": {"url", "pageUrl", "timestamp"}}`.
//! Payloads arrive loosely typed and are validated here, before they reach
//! the store. Invalid messages are rejected as values, never as faults.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::media::{DeleteKey, MediaEntry, MediaType};
use crate::store::{HistoryStore, RecordOutcome, StoreResult};
use crate::title::normalize_title;

#[derive(Debug, Error)]
pub enum ProtocolError {
  #[error("payload has no url")]
  MissingUrl,

  #[error("payload has no timestamp")]
  MissingTimestamp,

  #[error("invalid timestamp '{0}'")]
  InvalidTimestamp(String),

  #[error("undecodable message: {0}")]
  Decode(#[from] serde_json::Error),
}

/// A `MEDIA_DETECTED` payload as sent by a detector. Every field is optional
/// on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DetectedPayload {
  pub url: Option<String>,
  pub page_url: Option<String>,
  pub title: Option<String>,
  #[serde(rename = "type")]
  pub media_type: Option<String>,
  pub timestamp: Option<String>,
  pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeletePayload {
  pub url: Option<String>,
  pub page_url: Option<String>,
  pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
  MediaDetected(DetectedPayload),
  DeleteMedia(DeletePayload),
}

/// The store's answer to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
  Recorded,
  Duplicate,
  Deleted(usize),
  Rejected(String),
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ProtocolError> {
  DateTime::parse_from_rfc3339(raw.trim())
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|_| ProtocolError::InvalidTimestamp(raw.to_string()))
}

fn required_url(url: Option<String>) -> Result<String, ProtocolError> {
  url.map(|u| u.trim().to_string()).filter(|u| !u.is_empty()).ok_or(ProtocolError::MissingUrl)
}

impl DetectedPayload {
  /// Validate into an entry. Missing optional fields are derived: the type from
  /// the url, the title from the fallback chain, the timestamp from `now`.
  pub fn into_entry(self, now: DateTime<Utc>) -> Result<MediaEntry, ProtocolError> {
    let url = required_url(self.url)?;
    let media_type =
      self.media_type.as_deref().and_then(|t| t.parse().ok()).unwrap_or_else(|| MediaType::infer_from_url(&url));
    let timestamp = match self.timestamp.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
      Some(raw) => parse_timestamp(raw)?,
      None => now,
    };
    let title = normalize_title(self.title.as_deref(), &url);
    let thumbnail = self.thumbnail.filter(|t| !t.is_empty() && media_type == MediaType::Video);

    Ok(MediaEntry { url, page_url: self.page_url.unwrap_or_default(), title, media_type, timestamp, thumbnail })
  }
}

impl From<&MediaEntry> for DetectedPayload {
  fn from(entry: &MediaEntry) -> Self {
    Self {
      url: Some(entry.url.clone()),
      page_url: Some(entry.page_url.clone()),
      title: Some(entry.title.clone()),
      media_type: Some(entry.media_type.label().to_string()),
      timestamp: Some(entry.timestamp.to_rfc3339()),
      thumbnail: entry.thumbnail.clone(),
    }
  }
}

impl DeletePayload {
  pub fn into_key(self) -> Result<DeleteKey, ProtocolError> {
    let url = required_url(self.url)?;
    let raw = self.timestamp.ok_or(ProtocolError::MissingTimestamp)?;
    Ok(DeleteKey::new(url, self.page_url.unwrap_or_default(), parse_timestamp(&raw)?))
  }
}

impl From<&DeleteKey> for DeletePayload {
  fn from(key: &DeleteKey) -> Self {
    Self {
      url: Some(key.url.clone()),
      page_url: Some(key.page_url.clone()),
      timestamp: Some(key.timestamp.to_rfc3339()),
    }
  }
}

impl Message {
  pub fn detected(entry: &MediaEntry) -> Self {
    Message::MediaDetected(entry.into())
  }

  pub fn delete(key: &DeleteKey) -> Self {
    Message::DeleteMedia(key.into())
  }

  pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
    Ok(serde_json::from_str(raw)?)
  }

  pub fn to_json(&self) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(self)?)
  }

  pub fn kind(&self) -> &'static str {
    match self {
      Message::MediaDetected(_) => "MEDIA_DETECTED",
      Message::DeleteMedia(_) => "DELETE_MEDIA",
    }
  }
}

/// Validate a message and apply it to the store.
///
/// Validation failures come back as `Ack::Rejected`; only persistence failures
/// are errors.
pub async fn dispatch(store: &HistoryStore, message: Message) -> StoreResult<Ack> {
  let kind = message.kind();
  let validated = match message {
    Message::MediaDetected(payload) => payload.into_entry(Utc::now()).map(Validated::Record),
    Message::DeleteMedia(payload) => payload.into_key().map(Validated::Delete),
  };

  let ack = match validated {
    Ok(Validated::Record(entry)) => match store.record_detection(entry).await? {
      RecordOutcome::Inserted { .. } => Ack::Recorded,
      RecordOutcome::Duplicate => Ack::Duplicate,
      RecordOutcome::Rejected => Ack::Rejected(ProtocolError::MissingUrl.to_string()),
    },
    Ok(Validated::Delete(key)) => Ack::Deleted(store.delete_entry(&key).await?),
    Err(e) => {
      debug!(kind, err = %e, "protocol: message rejected");
      Ack::Rejected(e.to_string())
    }
  };
  Ok(ack)
}

/// Decode a JSON message and dispatch it. Undecodable input is rejected.
pub async fn dispatch_json(store: &HistoryStore, raw: &str) -> StoreResult<Ack> {
  match Message::from_json(raw) {
    Ok(message) => dispatch(store, message).await,
    Err(e) => {
      debug!(err = %e, "protocol: undecodable message");
      Ok(Ack::Rejected(e.to_string()))
    }
  }
}

enum Validated {
  Record(MediaEntry),
  Delete(DeleteKey),
}
