//! Page-side media detection.
//!
//! A [`PageDetector`] lives for one page load. It turns the media elements a
//! DOM scan reports into `MEDIA_DETECTED` messages, once per element.

use chrono::{DateTime, Utc};
use image::DynamicImage;
use reqwest::Client;
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::media::MediaType;
use crate::protocol::{DetectedPayload, Message};
use crate::router::MessageSender;
use crate::thumbnail::capture_thumbnail;
use crate::title::TitleHints;

/// A `<video>` or `<audio>` element as observed in the page.
#[derive(Debug, Clone)]
pub struct MediaElement {
  /// Stable identity of the element within the page (the processed marker).
  pub id: String,
  pub kind: MediaType,
  pub src: Option<String>,
  pub current_src: Option<String>,
  pub hints: TitleHints,
  pub poster_url: Option<String>,
  /// A decoded frame, when the page allowed pixel access.
  pub frame: Option<DynamicImage>,
}

impl MediaElement {
  fn source(&self) -> Option<&str> {
    [self.src.as_deref(), self.current_src.as_deref()].into_iter().flatten().map(str::trim).find(|s| !s.is_empty())
  }
}

pub struct PageDetector {
  page_url: String,
  processed: HashSet<String>,
  client: Client,
}

impl PageDetector {
  pub fn new(page_url: impl Into<String>) -> Self {
    Self::with_client(page_url, Client::new())
  }

  pub fn with_client(page_url: impl Into<String>, client: Client) -> Self {
    Self { page_url: page_url.into(), processed: HashSet::new(), client }
  }

  pub fn page_url(&self) -> &str {
    &self.page_url
  }

  pub fn is_processed(&self, element_id: &str) -> bool {
    self.processed.contains(element_id)
  }

  /// Describe one element as a detection payload. Title and thumbnail
  /// derivation never fail; they fall back instead.
  pub async fn describe(&self, element: &MediaElement, now: DateTime<Utc>) -> DetectedPayload {
    let url = element.source().map(str::to_string);
    let title = element.hints.resolve(url.as_deref().unwrap_or_default());
    let thumbnail = match element.kind {
      MediaType::Video => capture_thumbnail(&self.client, element.poster_url.as_deref(), element.frame.as_ref()).await,
      MediaType::Audio => None,
    };

    DetectedPayload {
      url,
      page_url: Some(self.page_url.clone()),
      title: Some(title),
      media_type: Some(element.kind.label().to_string()),
      timestamp: Some(now.to_rfc3339()),
      thumbnail,
    }
  }

  /// Produce one message per element not yet seen on this page and mark
  /// those elements processed.
  pub async fn scan(&mut self, elements: &[MediaElement]) -> Vec<Message> {
    let mut messages = Vec::new();
    for element in elements {
      if self.processed.contains(&element.id) {
        continue;
      }
      let payload = self.describe(element, Utc::now()).await;
      if payload.url.is_none() {
        debug!(element = %element.id, page_url = %self.page_url, "detector: element has no source yet");
      }
      messages.push(Message::MediaDetected(payload));
      self.processed.insert(element.id.clone());
    }
    messages
  }

  /// Scan and hand every new detection to the router without waiting for the store.
  pub async fn report(&mut self, elements: &[MediaElement], sender: &MessageSender) -> usize {
    let messages = self.scan(elements).await;
    let count = messages.len();
    for message in messages {
      if let Err(e) = sender.send(message) {
        warn!(page_url = %self.page_url, err = %e, "detector: detection not delivered");
      }
    }
    count
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::protocol::Ack;
  use crate::router::RouterHandle;
  use crate::storage::MemoryStorage;
  use crate::store::HistoryStore;
  use std::sync::Arc;

  fn element(id: &str, kind: MediaType, src: Option<&str>) -> MediaElement {
    MediaElement {
      id: id.to_string(),
      kind,
      src: src.map(str::to_string),
      current_src: None,
      hints: TitleHints::default(),
      poster_url: None,
      frame: None,
    }
  }

  #[tokio::test]
  async fn each_element_is_reported_once() {
    let mut detector = PageDetector::new("https://x/page");
    let elements = vec![element("v1", MediaType::Video, Some("https://x/a.mp4"))];
    assert_eq!(detector.scan(&elements).await.len(), 1);
    assert!(detector.is_processed("v1"));
    assert!(detector.scan(&elements).await.is_empty());

    let more = vec![elements[0].clone(), element("a1", MediaType::Audio, Some("https://x/b.mp3"))];
    assert_eq!(detector.scan(&more).await.len(), 1);
  }

  #[tokio::test]
  async fn describe_uses_current_src_and_title_chain() {
    let detector = PageDetector::new("https://x/page");
    let mut el = element("v1", MediaType::Video, Some(" "));
    el.current_src = Some("https://x/media/summer_trip.mp4".into());
    el.frame = Some(DynamicImage::new_rgb8(64, 36));

    let payload = detector.describe(&el, Utc::now()).await;
    assert_eq!(payload.url.as_deref(), Some("https://x/media/summer_trip.mp4"));
    assert_eq!(payload.title.as_deref(), Some("Summer Trip"));
    assert_eq!(payload.page_url.as_deref(), Some("https://x/page"));
    assert!(payload.thumbnail.unwrap().starts_with("data:image/jpeg;base64,"));
  }

  #[tokio::test]
  async fn audio_elements_carry_no_thumbnail() {
    let detector = PageDetector::new("https://x/page");
    let mut el = element("a1", MediaType::Audio, Some("https://x/a.mp3"));
    el.frame = Some(DynamicImage::new_rgb8(8, 8));
    assert_eq!(detector.describe(&el, Utc::now()).await.thumbnail, None);
  }

  #[tokio::test]
  async fn sourceless_element_is_rejected_by_the_store() {
    let store = Arc::new(HistoryStore::new(Arc::new(MemoryStorage::new())));
    let router = RouterHandle::spawn(store.clone());
    let mut detector = PageDetector::new("https://x/page");

    let mut messages = detector.scan(&[element("v1", MediaType::Video, None)]).await;
    let ack = router.request(messages.remove(0)).await.unwrap();
    assert!(matches!(ack, Ack::Rejected(_)));
    router.shutdown().await;
    assert!(store.query().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn report_feeds_the_store() {
    let store = Arc::new(HistoryStore::new(Arc::new(MemoryStorage::new())));
    let router = RouterHandle::spawn(store.clone());
    let mut detector = PageDetector::new("https://x/page");
    let elements = vec![
      element("v1", MediaType::Video, Some("https://x/a.mp4")),
      element("a1", MediaType::Audio, Some("https://x/b.mp3")),
    ];

    assert_eq!(detector.report(&elements, &router.sender()).await, 2);
    assert_eq!(detector.report(&elements, &router.sender()).await, 0);
    router.shutdown().await;

    let snapshot = store.query().await.unwrap();
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot.iter().all(|e| e.page_url == "https://x/page"));
  }
}
