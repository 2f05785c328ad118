use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::title::normalize_title;

/// Kind of media element an entry was recorded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
  Video,
  Audio,
}

/// File extensions that mark a resource as audio when no explicit type is given.
const AUDIO_EXTENSIONS: [&str; 7] = ["mp3", "wav", "ogg", "m4a", "aac", "flac", "opus"];

impl MediaType {
  pub fn label(self) -> &'static str {
    match self {
      MediaType::Video => "video",
      MediaType::Audio => "audio",
    }
  }

  /// Guess the media type from the extension of a URL's path.
  /// Anything that is not a known audio extension is treated as video.
  pub fn infer_from_url(url: &str) -> Self {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path.rsplit('/').next().and_then(|file| file.rsplit_once('.')).map(|(_, ext)| ext.to_lowercase());
    match ext {
      Some(ext) if AUDIO_EXTENSIONS.contains(&ext.as_str()) => MediaType::Audio,
      _ => MediaType::Video,
    }
  }
}

impl fmt::Display for MediaType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.label())
  }
}

impl FromStr for MediaType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "video" => Ok(MediaType::Video),
      "audio" => Ok(MediaType::Audio),
      other => Err(format!("unknown media type '{}'", other)),
    }
  }
}

/// One observed media element instance.
///
/// Entries are never mutated once recorded: the first detection of a
/// (`url`, `page_url`) pair wins and later detections are dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaEntry {
  pub url: String,
  pub page_url: String,
  pub title: String,
  #[serde(rename = "type")]
  pub media_type: MediaType,
  pub timestamp: DateTime<Utc>,
  /// Base64 `data:` URL. Only ever present on video entries.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub thumbnail: Option<String>,
}

impl MediaEntry {
  /// Enforce the per-field invariants: a trimmed url, a non-empty title and
  /// no thumbnail on audio.
  pub fn normalized(mut self) -> Self {
    let trimmed = self.url.trim();
    if trimmed.len() != self.url.len() {
      self.url = trimmed.to_string();
    }
    self.title = normalize_title(Some(&self.title), &self.url);
    if self.media_type == MediaType::Audio {
      self.thumbnail = None;
    }
    self
  }

  pub fn dedup_key(&self) -> DedupKey<'_> {
    DedupKey { url: &self.url, page_url: &self.page_url }
  }

  /// Whether this entry is the one addressed by a delete request.
  pub fn matches(&self, key: &DeleteKey) -> bool {
    self.url == key.url && self.page_url == key.page_url && self.timestamp == key.timestamp
  }
}

/// The (`url`, `page_url`) pair that decides whether a detection is new.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupKey<'a> {
  pub url: &'a str,
  pub page_url: &'a str,
}

/// The (`url`, `page_url`, `timestamp`) triple identifying an entry for removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteKey {
  pub url: String,
  pub page_url: String,
  pub timestamp: DateTime<Utc>,
}

impl DeleteKey {
  pub fn new(url: impl Into<String>, page_url: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
    Self { url: url.into(), page_url: page_url.into(), timestamp }
  }
}

impl From<&MediaEntry> for DeleteKey {
  fn from(entry: &MediaEntry) -> Self {
    Self::new(entry.url.clone(), entry.page_url.clone(), entry.timestamp)
  }
}
