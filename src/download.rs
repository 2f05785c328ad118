use crate::media::MediaType;

/// Extensions a download filename may carry.
const KNOWN_EXTENSIONS: [&str; 10] = ["mp4", "webm", "mkv", "mov", "mp3", "wav", "ogg", "m4a", "aac", "flac"];

/// Query parameters that commonly carry the container format on CDN URLs.
const FORMAT_PARAMS: [&str; 4] = ["ext", "format", "type", "mime"];

/// A request handed to the platform download manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
  pub url: String,
  pub filename: String,
}

impl DownloadRequest {
  pub fn new(url: &str, title: &str, media_type: MediaType) -> Self {
    Self { url: url.to_string(), filename: sanitize_filename(title, url, media_type) }
  }
}

fn known_extension(candidate: &str) -> Option<&'static str> {
  let candidate = candidate.trim().to_lowercase();
  // "video/mp4" or "audio/mpeg" style values
  let candidate = candidate.rsplit('/').next().unwrap_or(&candidate);
  let candidate = if candidate == "mpeg" { "mp3" } else { candidate };
  KNOWN_EXTENSIONS.iter().copied().find(|ext| *ext == candidate)
}

/// Infer the file extension (with leading dot) for a media URL.
///
/// Looks at the path suffix first, then well-known query parameters, and
/// falls back to a default for the media type.
pub fn infer_extension(url: &str, media_type: MediaType) -> &'static str {
  let (path, query) = match url.split_once('?') {
    Some((path, query)) => (path, query.split('#').next().unwrap_or(query)),
    None => (url.split('#').next().unwrap_or(url), ""),
  };

  let from_path = path.rsplit('/').next().and_then(|file| file.rsplit_once('.')).and_then(|(_, ext)| known_extension(ext));

  let from_query = || {
    query.split('&').filter_map(|pair| pair.split_once('=')).find_map(|(key, value)| {
      if !FORMAT_PARAMS.contains(&key.to_lowercase().as_str()) {
        return None;
      }
      let value = urlencoding::decode(value).ok()?;
      known_extension(&value)
    })
  };

  match from_path.or_else(from_query) {
    Some("mp4") => ".mp4",
    Some("webm") => ".webm",
    Some("mkv") => ".mkv",
    Some("mov") => ".mov",
    Some("mp3") => ".mp3",
    Some("wav") => ".wav",
    Some("ogg") => ".ogg",
    Some("m4a") => ".m4a",
    Some("aac") => ".aac",
    Some("flac") => ".flac",
    _ => match media_type {
      MediaType::Video => ".mp4",
      MediaType::Audio => ".mp3",
    },
  }
}

/// Build a filesystem-safe download filename from an entry's title.
///
/// Every character outside `[A-Za-z0-9_-]` becomes `_`, and the extension is
/// inferred from the media URL.
pub fn sanitize_filename(title: &str, url: &str, media_type: MediaType) -> String {
  let stem: String =
    title.trim().chars().map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' }).collect();
  let stem = if stem.is_empty() { "media".to_string() } else { stem };
  format!("{}{}", stem, infer_extension(url, media_type))
}
