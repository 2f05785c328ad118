//! Application constants loaded from `constants.ron` at compile time.
//!
//! The RON file is embedded via `include_str!` so it's always available,
//! with no runtime file I/O. Parsed once on first access via `LazyLock`.

use serde::Deserialize;
use std::sync::LazyLock;

/// All tuneable application constants.
#[derive(Debug, Deserialize)]
pub struct Constants {
  // History store
  pub max_entries: usize,
  pub history_slot: String,
  pub storage_timeout_ms: u64,
  /// How often `watch` re-reads history written by other processes.
  pub watch_poll_ms: u64,

  // Titles
  pub untitled_placeholder: String,
  pub popup_title_width: usize,
  pub popup_url_width: usize,
  pub popup_limit: usize,

  // Thumbnails
  pub thumbnail_width: u32,
  pub thumbnail_height: u32,
  pub thumbnail_quality: u8,

  // Message routing
  pub router_queue_size: usize,
}

static CONSTANTS: LazyLock<Constants> = LazyLock::new(|| {
  // Safety: the RON file is embedded at compile time; if it's malformed this is a build-time error.
  ron::from_str(include_str!("../constants.ron")).expect("constants.ron must be valid RON (embedded at compile time)")
});

/// Returns a reference to the parsed application constants.
pub fn constants() -> &'static Constants {
  &CONSTANTS
}
