use anyhow::{Context, Result, anyhow};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::{DynamicImage, codecs::jpeg::JpegEncoder, imageops::FilterType};
use reqwest::Client;
use tracing::warn;

use crate::constants::constants;

/// Scale an image to the thumbnail size and encode it as a JPEG `data:` URL.
pub fn encode_thumbnail(image: &DynamicImage) -> Result<String> {
  let c = constants();
  let scaled = image.resize_exact(c.thumbnail_width, c.thumbnail_height, FilterType::Triangle).to_rgb8();
  let mut jpeg = Vec::new();
  JpegEncoder::new_with_quality(&mut jpeg, c.thumbnail_quality)
    .encode_image(&scaled)
    .context("Failed to encode thumbnail as JPEG")?;
  Ok(format!("data:image/jpeg;base64,{}", STANDARD.encode(jpeg)))
}

/// Decode arbitrary image bytes (a poster file, a saved frame) into a thumbnail.
pub fn thumbnail_from_bytes(bytes: &[u8]) -> Result<String> {
  let image = image::load_from_memory(bytes).context("Failed to decode image data")?;
  encode_thumbnail(&image)
}

pub async fn fetch_poster(client: &Client, url: &str) -> Result<DynamicImage> {
  let response = client.get(url).send().await.with_context(|| format!("Failed to request poster {}", url))?;
  if !response.status().is_success() {
    return Err(anyhow!("Poster request for {} returned {}", url, response.status()));
  }
  let bytes = response.bytes().await.with_context(|| format!("Failed to read image bytes from {}", url))?;
  image::load_from_memory(&bytes).with_context(|| format!("Failed to decode image from memory (URL: {})", url))
}

/// Best-effort thumbnail for a video element.
///
/// Tries the poster image first, then a captured video frame. Every failure is
/// logged and swallowed: a missing thumbnail never stops an entry from being
/// recorded.
pub async fn capture_thumbnail(client: &Client, poster_url: Option<&str>, frame: Option<&DynamicImage>) -> Option<String> {
  if let Some(url) = poster_url {
    match fetch_poster(client, url).await.and_then(|poster| encode_thumbnail(&poster)) {
      Ok(thumb) => return Some(thumb),
      Err(e) => warn!(url, err = %format!("{:#}", e), "thumbnail: poster unavailable, falling back to frame"),
    }
  }

  let frame = frame?;
  match encode_thumbnail(frame) {
    Ok(thumb) => Some(thumb),
    Err(e) => {
      warn!(err = %format!("{:#}", e), "thumbnail: frame capture failed");
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn decode(data_url: &str) -> DynamicImage {
    let b64 = data_url.strip_prefix("data:image/jpeg;base64,").expect("jpeg data url");
    image::load_from_memory(&STANDARD.decode(b64).unwrap()).unwrap()
  }

  #[test]
  fn encode_scales_to_thumbnail_size() {
    let frame = DynamicImage::new_rgb8(640, 360);
    let thumb = decode(&encode_thumbnail(&frame).unwrap());
    assert_eq!((thumb.width(), thumb.height()), (160, 90));
  }

  #[test]
  fn bytes_that_are_not_an_image_fail() {
    assert!(thumbnail_from_bytes(b"definitely not a png").is_err());
  }

  #[test]
  fn png_bytes_become_jpeg_thumbnail() {
    let mut png = Vec::new();
    DynamicImage::new_rgb8(32, 32).write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png).unwrap();
    assert!(thumbnail_from_bytes(&png).unwrap().starts_with("data:image/jpeg;base64,"));
  }

  #[tokio::test]
  async fn unreachable_poster_falls_back_to_frame() {
    let client = Client::new();
    let frame = DynamicImage::new_rgb8(320, 180);
    let thumb = capture_thumbnail(&client, Some("not a url"), Some(&frame)).await;
    assert!(thumb.is_some());
  }

  #[tokio::test]
  async fn no_sources_means_no_thumbnail() {
    let client = Client::new();
    assert_eq!(capture_thumbnail(&client, Some("not a url"), None).await, None);
    assert_eq!(capture_thumbnail(&client, None, None).await, None);
  }
}
