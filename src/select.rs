//! Filtering and sorting over history snapshots.
//!
//! These are pure functions owned by each consumer. The store never sorts or
//! filters on anyone's behalf.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::cmp::Ordering;
use std::str::FromStr;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

use crate::media::{MediaEntry, MediaType};
use crate::title::format_title;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TypeFilter {
  #[default]
  All,
  Video,
  Audio,
}

impl TypeFilter {
  pub fn accepts(self, media_type: MediaType) -> bool {
    match self {
      TypeFilter::All => true,
      TypeFilter::Video => media_type == MediaType::Video,
      TypeFilter::Audio => media_type == MediaType::Audio,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortKey {
  /// Descending timestamp.
  #[default]
  Newest,
  /// Ascending timestamp.
  Oldest,
  /// Ascending by formatted title, ignoring case.
  Title,
}

impl SortKey {
  pub fn label(self) -> &'static str {
    match self {
      SortKey::Newest => "newest",
      SortKey::Oldest => "oldest",
      SortKey::Title => "title",
    }
  }

  /// Parse a stored preference; anything unrecognised sorts newest first.
  pub fn from_config(s: &str) -> Self {
    s.parse().unwrap_or_default()
  }
}

impl FromStr for SortKey {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "newest" => Ok(SortKey::Newest),
      "oldest" => Ok(SortKey::Oldest),
      "title" => Ok(SortKey::Title),
      other => Err(format!("unknown sort key '{}'", other)),
    }
  }
}

/// What a history view wants to see.
#[derive(Debug, Clone, Default)]
pub struct Criteria {
  /// Case-insensitive substring matched against title, url and page url.
  pub search: String,
  pub media_type: TypeFilter,
  /// Inclusive lower bound.
  pub from: Option<DateTime<Utc>>,
  /// Inclusive upper bound.
  pub to: Option<DateTime<Utc>>,
  pub sort: SortKey,
  /// Keep at most this many entries after sorting.
  pub limit: Option<usize>,
}

impl Criteria {
  /// Bound the range by calendar days in `tz`: `from` starts at midnight and
  /// `to` covers its whole day.
  pub fn with_days<Tz: TimeZone>(mut self, tz: &Tz, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
    self.from = from
      .and_then(|d| d.and_hms_opt(0, 0, 0))
      .and_then(|dt| tz.from_local_datetime(&dt).earliest())
      .map(|dt| dt.with_timezone(&Utc));
    self.to = to
      .and_then(|d| d.and_hms_nano_opt(23, 59, 59, 999_999_999))
      .and_then(|dt| tz.from_local_datetime(&dt).latest())
      .map(|dt| dt.with_timezone(&Utc));
    self
  }

  pub fn matches(&self, entry: &MediaEntry) -> bool {
    let needle = self.search.trim().to_lowercase();
    let matches_search = needle.is_empty()
      || entry.title.to_lowercase().contains(&needle)
      || entry.url.to_lowercase().contains(&needle)
      || entry.page_url.to_lowercase().contains(&needle);

    matches_search
      && self.media_type.accepts(entry.media_type)
      && self.from.is_none_or(|from| entry.timestamp >= from)
      && self.to.is_none_or(|to| entry.timestamp <= to)
  }
}

/// Collation key for title sorting: accents folded, case ignored.
fn title_key(title: &str) -> String {
  format_title(title).nfd().filter(|c| !is_combining_mark(*c)).collect::<String>().to_lowercase()
}

fn title_order(a: &MediaEntry, b: &MediaEntry) -> Ordering {
  title_key(&a.title).cmp(&title_key(&b.title))
}

/// Filter and sort a snapshot. Entries with equal sort keys keep their input order.
pub fn select(snapshot: &[MediaEntry], criteria: &Criteria) -> Vec<MediaEntry> {
  let mut selected: Vec<MediaEntry> = snapshot.iter().filter(|e| criteria.matches(e)).cloned().collect();

  match criteria.sort {
    SortKey::Newest => selected.sort_by(|a, b| b.timestamp.cmp(&a.timestamp)),
    SortKey::Oldest => selected.sort_by(|a, b| a.timestamp.cmp(&b.timestamp)),
    SortKey::Title => selected.sort_by(title_order),
  }

  if let Some(limit) = criteria.limit {
    selected.truncate(limit);
  }
  selected
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::FixedOffset;

  fn entry(title: &str, media_type: MediaType, secs: i64) -> MediaEntry {
    MediaEntry {
      url: format!("https://cdn.example/{}.bin", title.to_lowercase()),
      page_url: "https://example.com/watch".to_string(),
      title: title.to_string(),
      media_type,
      timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
      thumbnail: None,
    }
  }

  fn sample() -> Vec<MediaEntry> {
    vec![
      entry("Beta", MediaType::Video, 2),
      entry("alpha", MediaType::Audio, 1),
      entry("Gamma", MediaType::Video, 3),
    ]
  }

  fn titles(entries: &[MediaEntry]) -> Vec<&str> {
    entries.iter().map(|e| e.title.as_str()).collect()
  }

  // --- sorting ---

  #[test]
  fn video_newest_first() {
    let criteria = Criteria { media_type: TypeFilter::Video, ..Default::default() };
    assert_eq!(titles(&select(&sample(), &criteria)), vec!["Gamma", "Beta"]);
  }

  #[test]
  fn title_sort_uses_formatted_title() {
    let criteria = Criteria { sort: SortKey::Title, ..Default::default() };
    assert_eq!(titles(&select(&sample(), &criteria)), vec!["alpha", "Beta", "Gamma"]);
  }

  #[test]
  fn title_sort_folds_accents() {
    let snapshot = vec![
      entry("Zeta", MediaType::Video, 1),
      entry("Éclair", MediaType::Video, 2),
      entry("über alles", MediaType::Audio, 3),
      entry("Apple", MediaType::Video, 4),
    ];
    let criteria = Criteria { sort: SortKey::Title, ..Default::default() };
    assert_eq!(titles(&select(&snapshot, &criteria)), vec!["Apple", "Éclair", "über alles", "Zeta"]);
  }

  #[test]
  fn oldest_first() {
    let criteria = Criteria { sort: SortKey::Oldest, ..Default::default() };
    assert_eq!(titles(&select(&sample(), &criteria)), vec!["alpha", "Beta", "Gamma"]);
  }

  #[test]
  fn equal_keys_keep_input_order() {
    let mut a = entry("Same", MediaType::Video, 5);
    a.url = "https://x/first".into();
    let mut b = entry("same  ", MediaType::Video, 5);
    b.url = "https://x/second".into();
    let snapshot = vec![a, b];

    for sort in [SortKey::Title, SortKey::Newest, SortKey::Oldest] {
      let criteria = Criteria { sort, ..Default::default() };
      let urls: Vec<_> = select(&snapshot, &criteria).into_iter().map(|e| e.url).collect();
      assert_eq!(urls, vec!["https://x/first", "https://x/second"], "sort {}", sort.label());
    }
  }

  // --- filtering ---

  #[test]
  fn search_matches_any_field_case_insensitively() {
    let mut e = entry("Lecture", MediaType::Video, 1);
    e.page_url = "https://University.edu/course".into();
    let snapshot = vec![e, entry("Other", MediaType::Audio, 2)];

    let by = |search: &str| {
      let criteria = Criteria { search: search.into(), ..Default::default() };
      titles(&select(&snapshot, &criteria)).into_iter().map(str::to_string).collect::<Vec<_>>()
    };
    assert_eq!(by("LECT"), vec!["Lecture"]);
    assert_eq!(by("university"), vec!["Lecture"]);
    assert_eq!(by("cdn.example/other"), vec!["Other"]);
    assert!(by("missing").is_empty());
  }

  #[test]
  fn timestamp_range_is_inclusive() {
    let criteria = Criteria {
      from: Some(Utc.timestamp_opt(1, 0).unwrap()),
      to: Some(Utc.timestamp_opt(2, 0).unwrap()),
      ..Default::default()
    };
    assert_eq!(titles(&select(&sample(), &criteria)), vec!["Beta", "alpha"]);
  }

  #[test]
  fn day_range_covers_whole_days() {
    let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
    let criteria = Criteria::default().with_days(&Utc, Some(day), Some(day));
    let at = |s: &str| MediaEntry { timestamp: s.parse().unwrap(), ..entry("x", MediaType::Video, 0) };

    assert!(criteria.matches(&at("2024-05-01T00:00:00Z")));
    assert!(criteria.matches(&at("2024-05-01T23:59:59.500Z")));
    assert!(!criteria.matches(&at("2024-04-30T23:59:59Z")));
    assert!(!criteria.matches(&at("2024-05-02T00:00:00Z")));
  }

  #[test]
  fn day_range_respects_time_zone() {
    let tz = FixedOffset::east_opt(2 * 3600).unwrap();
    let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
    let criteria = Criteria::default().with_days(&tz, Some(day), None);
    assert_eq!(criteria.from, Some("2024-04-30T22:00:00Z".parse().unwrap()));
  }

  #[test]
  fn limit_applies_after_sorting() {
    let criteria = Criteria { limit: Some(1), ..Default::default() };
    assert_eq!(titles(&select(&sample(), &criteria)), vec!["Gamma"]);
  }

  #[test]
  fn sort_key_from_config() {
    assert_eq!(SortKey::from_config("Title"), SortKey::Title);
    assert_eq!(SortKey::from_config("bogus"), SortKey::Newest);
  }
}
