//! Title normalization and the detector's title fallback chain.

use unicode_width::UnicodeWidthChar;

use crate::constants::constants;

/// Extensions stripped from the end of a display title.
const TITLE_EXTENSIONS: [&str; 4] = [".mp4", ".mp3", ".wav", ".webm"];

/// Document title browsers give to an empty new-tab page.
const NEWTAB_TITLE: &str = "newtab";

/// Uppercase the first character of a word and lowercase the rest.
fn capitalize(word: &str) -> String {
  let mut chars = word.chars();
  match chars.next() {
    Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
    None => String::new(),
  }
}

fn capitalize_words(text: &str) -> String {
  text.split(' ').map(capitalize).collect::<Vec<_>>().join(" ")
}

/// Normalize a title for display and sorting.
///
/// Collapses whitespace runs, capitalizes every word and strips a trailing
/// media file extension.
pub fn format_title(title: &str) -> String {
  let collapsed = title.split_whitespace().collect::<Vec<_>>().join(" ");
  let formatted = capitalize_words(&collapsed);
  TITLE_EXTENSIONS.iter().find_map(|ext| strip_suffix_ignore_case(&formatted, ext)).unwrap_or(&formatted).to_string()
}

fn strip_suffix_ignore_case<'a>(text: &'a str, suffix: &str) -> Option<&'a str> {
  let split = text.len().checked_sub(suffix.len())?;
  let (head, tail) = (text.get(..split)?, text.get(split..)?);
  tail.eq_ignore_ascii_case(suffix).then_some(head)
}

/// Cut `text` after `max_chars` characters and append an ellipsis.
pub fn truncate_text(text: &str, max_chars: usize) -> String {
  match text.char_indices().nth(max_chars) {
    Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
    None => text.to_string(),
  }
}

/// Truncate to a terminal column budget, counting wide characters as two columns.
pub fn truncate_columns(text: &str, max_cols: usize) -> String {
  let mut used = 0;
  for (idx, c) in text.char_indices() {
    let w = c.width().unwrap_or(0);
    if used + w > max_cols {
      return format!("{}…", &text[..idx]);
    }
    used += w;
  }
  text.to_string()
}

/// Derive a readable title from the last path segment of a media URL.
///
/// `https://x/videos/my_holiday-clip.mp4` becomes `My Holiday Clip`.
/// Returns `None` when the URL has no usable file name.
pub fn title_from_url(url: &str) -> Option<String> {
  let (_, rest) = url.split_once("://")?;
  let path = rest.split(['?', '#']).next().unwrap_or(rest);
  let (_, path) = path.split_once('/')?;
  let file = path.rsplit('/').next().unwrap_or(path);
  let stem = match file.rsplit_once('.') {
    Some((stem, _)) if !stem.is_empty() => stem,
    _ => file,
  };
  let decoded = urlencoding::decode(stem).ok()?;
  let spaced = decoded.replace(['-', '_', '+'], " ");
  let title = capitalize_words(&spaced);
  let title = title.trim();
  (!title.is_empty()).then(|| title.to_string())
}

/// Everything a detector can observe about a media element that might name it.
///
/// [`TitleHints::resolve`] walks the candidates from most to least specific
/// and always yields a non-empty title.
#[derive(Debug, Clone, Default)]
pub struct TitleHints {
  /// The element's `title` attribute.
  pub element_title: Option<String>,
  /// The element's `aria-label` attribute.
  pub aria_label: Option<String>,
  /// Text of the closest heading preceding the element.
  pub heading: Option<String>,
  /// `og:title`, or failing that the `title` meta tag.
  pub meta_title: Option<String>,
  /// The document title.
  pub page_title: Option<String>,
}

impl TitleHints {
  pub fn resolve(&self, media_url: &str) -> String {
    let non_blank = |s: &Option<String>| s.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);

    non_blank(&self.element_title)
      .or_else(|| non_blank(&self.aria_label))
      .or_else(|| non_blank(&self.heading))
      .or_else(|| non_blank(&self.meta_title))
      .or_else(|| non_blank(&self.page_title).filter(|t| t != NEWTAB_TITLE))
      .or_else(|| title_from_url(media_url))
      .unwrap_or_else(|| constants().untitled_placeholder.clone())
  }
}

/// Normalize a title supplied on the wire, deriving one when it is blank.
pub fn normalize_title(title: Option<&str>, media_url: &str) -> String {
  let hints = TitleHints { element_title: title.map(str::to_string), ..Default::default() };
  hints.resolve(media_url)
}
