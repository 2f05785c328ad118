use anyhow::{Context, Result, anyhow};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::select::SortKey;
use crate::store::StoreSettings;

/// User preferences, stored as `prefs.toml` in the platform config directory.
#[derive(Serialize, Deserialize, Default, Debug, PartialEq)]
pub struct Config {
  /// Where the history slot and logs live. Defaults to the platform data dir.
  pub data_dir: Option<PathBuf>,
  pub storage_timeout_ms: Option<u64>,
  pub default_sort: Option<String>,
  pub list_limit: Option<usize>,
}

fn project_dirs() -> Option<ProjectDirs> {
  ProjectDirs::from("", "", "mediatrail")
}

impl Config {
  pub fn load() -> Self {
    if let Some(proj_dirs) = project_dirs() {
      let config_file = proj_dirs.config_dir().join("prefs.toml");
      if let Ok(content) = std::fs::read_to_string(config_file)
        && let Some(config) = Self::parse(&content)
      {
        return config;
      }
    }
    Self::default()
  }

  pub fn parse(content: &str) -> Option<Self> {
    toml::from_str(content).ok()
  }

  /// Write `prefs.toml` to the platform config dir. Returns the file written.
  pub fn save(&self) -> Result<PathBuf> {
    let proj_dirs = project_dirs().ok_or_else(|| anyhow!("No config directory available"))?;
    let config_file = proj_dirs.config_dir().join("prefs.toml");
    self.save_to(&config_file)?;
    Ok(config_file)
  }

  pub fn save_to(&self, config_file: &Path) -> Result<()> {
    if let Some(dir) = config_file.parent() {
      std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let content = toml::to_string(self).context("Failed to encode preferences")?;
    std::fs::write(config_file, content).with_context(|| format!("Failed to write {}", config_file.display()))
  }

  /// The configured data directory, or the platform default.
  pub fn data_dir(&self) -> Option<PathBuf> {
    self.data_dir.clone().or_else(|| project_dirs().map(|d| d.data_dir().to_path_buf()))
  }

  pub fn default_sort(&self) -> SortKey {
    self.default_sort.as_deref().map(SortKey::from_config).unwrap_or_default()
  }

  pub fn store_settings(&self) -> StoreSettings {
    let mut settings = StoreSettings::default();
    if let Some(ms) = self.storage_timeout_ms {
      settings.timeout = Duration::from_millis(ms);
    }
    settings
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_full_prefs() {
    let config = Config::parse(
      r#"
data_dir = "/tmp/mediatrail"
storage_timeout_ms = 250
default_sort = "title"
list_limit = 25
"#,
    )
    .unwrap();
    assert_eq!(config.data_dir(), Some(PathBuf::from("/tmp/mediatrail")));
    assert_eq!(config.default_sort(), SortKey::Title);
    assert_eq!(config.store_settings().timeout, Duration::from_millis(250));
    assert_eq!(config.list_limit, Some(25));
  }

  #[test]
  fn empty_prefs_use_defaults() {
    let config = Config::parse("").unwrap();
    assert_eq!(config, Config::default());
    assert_eq!(config.default_sort(), SortKey::Newest);
    assert_eq!(config.store_settings().capacity, 1000);
  }

  #[test]
  fn invalid_prefs_are_ignored() {
    assert!(Config::parse("storage_timeout_ms = \"soon\"").is_none());
  }

  #[test]
  fn prefs_survive_toml_serialization() {
    let config = Config { default_sort: Some("oldest".into()), list_limit: Some(5), ..Default::default() };
    let text = toml::to_string(&config).unwrap();
    assert_eq!(Config::parse(&text), Some(config));
  }

  #[test]
  fn save_to_writes_readable_prefs() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("nested").join("prefs.toml");
    let config = Config { list_limit: Some(7), ..Default::default() };
    config.save_to(&file).unwrap();
    assert_eq!(Config::parse(&std::fs::read_to_string(&file).unwrap()), Some(config));
  }

  #[test]
  fn save_to_reports_failures() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"").unwrap();
    let err = Config::default().save_to(&blocker.join("prefs.toml")).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to create"));
  }
}
