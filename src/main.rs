use anyhow::{Context, Result, anyhow};
use chrono::{Local, NaiveDate};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use futures::future;
use futures::stream::{self, StreamExt};
use std::io::Write;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use mediatrail::config::Config;
use mediatrail::constants::constants;
use mediatrail::download::DownloadRequest;
use mediatrail::media::{MediaEntry, MediaType};
use mediatrail::notifier::Snapshot;
use mediatrail::protocol::{self, Ack, DeletePayload, DetectedPayload, Message};
use mediatrail::router::RouterHandle;
use mediatrail::select::{Criteria, SortKey, TypeFilter, select};
use mediatrail::storage::FileStorage;
use mediatrail::store::HistoryStore;
use mediatrail::thumbnail::{capture_thumbnail, thumbnail_from_bytes};
use mediatrail::title::{format_title, normalize_title, truncate_columns, truncate_text};

/// Concurrent in-flight messages while ingesting.
const INGEST_CONCURRENCY: usize = 16;

// --- CLI ---

#[derive(Parser, Debug)]
#[command(author, version = env!("CARGO_PKG_VERSION"), about, long_about = None)]
struct Args {
  /// Directory holding the history slot and logs (default: prefs.toml `data_dir`, then the platform data dir)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliType {
  All,
  Video,
  Audio,
}

impl From<CliType> for TypeFilter {
  fn from(cli: CliType) -> Self {
    match cli {
      CliType::All => TypeFilter::All,
      CliType::Video => TypeFilter::Video,
      CliType::Audio => TypeFilter::Audio,
    }
  }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliSort {
  Newest,
  Oldest,
  Title,
}

impl From<CliSort> for SortKey {
  fn from(cli: CliSort) -> Self {
    match cli {
      CliSort::Newest => SortKey::Newest,
      CliSort::Oldest => SortKey::Oldest,
      CliSort::Title => SortKey::Title,
    }
  }
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Browse the full history with filters
  List {
    /// Case-insensitive text matched against title, url and page url
    #[arg(short, long, default_value = "")]
    search: String,
    #[arg(short = 't', long = "type", value_enum, default_value = "all")]
    media_type: CliType,
    /// First day to include (YYYY-MM-DD, local time)
    #[arg(long)]
    from: Option<NaiveDate>,
    /// Last day to include (YYYY-MM-DD, local time)
    #[arg(long)]
    to: Option<NaiveDate>,
    /// Sort order (default: prefs.toml `default_sort`, then newest)
    #[arg(long, value_enum)]
    sort: Option<CliSort>,
    #[arg(short = 'n', long)]
    limit: Option<usize>,
    /// Print entries as JSON instead of a table
    #[arg(long)]
    json: bool,
  },
  /// The most recent detections, popup style
  Recent,
  /// Record a detection by hand
  Record {
    #[arg(long)]
    url: String,
    #[arg(long, default_value = "")]
    page_url: String,
    #[arg(long)]
    title: Option<String>,
    /// 'video' or 'audio' (default: inferred from the url)
    #[arg(long = "type")]
    media_type: Option<String>,
    /// Image file to use as the thumbnail
    #[arg(long, conflicts_with = "poster")]
    thumbnail: Option<PathBuf>,
    /// Poster image URL to fetch the thumbnail from
    #[arg(long)]
    poster: Option<String>,
  },
  /// Delete the entry matching url, page url and timestamp exactly
  Delete {
    #[arg(long)]
    url: String,
    #[arg(long, default_value = "")]
    page_url: String,
    /// RFC 3339 timestamp as shown by `list --json`
    #[arg(long)]
    timestamp: String,
  },
  /// Read protocol messages (one JSON object per line) from stdin and apply them
  Ingest {
    /// Print a line every time the history changes
    #[arg(long)]
    follow: bool,
  },
  /// Print a line every time the history changes, including changes made by other processes
  Watch,
  /// Print the download filename for a media url
  Filename {
    #[arg(long)]
    url: String,
    #[arg(long)]
    title: Option<String>,
    #[arg(long = "type")]
    media_type: Option<String>,
  },
  /// Show or update saved preferences
  Prefs {
    #[arg(long, value_enum)]
    default_sort: Option<CliSort>,
    #[arg(long)]
    list_limit: Option<usize>,
    #[arg(long)]
    storage_timeout_ms: Option<u64>,
  },
  /// Generate shell completions
  Completions { shell: clap_complete::Shell },
}

// --- Helpers ---

fn init_logging(log_dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir).with_context(|| format!("Failed to create log dir {}", log_dir.display()))?;
  let appender = tracing_appender::rolling::never(log_dir, "mediatrail.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter = EnvFilter::try_from_env("MEDIATRAIL_LOG")
    .or_else(|_| EnvFilter::try_from_default_env())
    .unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer).with_ansi(false).init();
  Ok(guard)
}

fn local_time(entry: &MediaEntry) -> String {
  entry.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn print_table(entries: &[MediaEntry]) {
  if entries.is_empty() {
    println!("No media found.");
    return;
  }
  for entry in entries {
    println!(
      "{}  {:<5}  {:<48}  {}",
      local_time(entry),
      entry.media_type.label(),
      truncate_columns(&format_title(&entry.title), 48),
      entry.url
    );
  }
}

fn print_change(snapshot: &Snapshot) {
  let newest = snapshot.first().map(|e| truncate_text(&format_title(&e.title), 50)).unwrap_or_default();
  println!("history #{}: {} entries, newest: {}", snapshot.revision(), snapshot.len(), newest);
  let _ = std::io::stdout().flush();
}

fn print_ack(ack: &Ack) {
  match ack {
    Ack::Recorded => println!("recorded"),
    Ack::Duplicate => println!("already in history"),
    Ack::Deleted(0) => println!("no matching entry"),
    Ack::Deleted(n) => println!("deleted {}", n),
    Ack::Rejected(reason) => println!("rejected: {}", reason),
  }
}

fn download_name(url: &str, title: Option<&str>, media_type: Option<&str>) -> DownloadRequest {
  let media_type = media_type.and_then(|t| t.parse().ok()).unwrap_or_else(|| MediaType::infer_from_url(url));
  let title = format_title(&normalize_title(title, url));
  DownloadRequest::new(url, &title, media_type)
}

// --- Commands ---

async fn ingest(store: Arc<HistoryStore>, follow: bool) -> Result<()> {
  let observer = follow.then(|| {
    store.notifier().observe(|snapshot| {
      print_change(snapshot);
      ControlFlow::Continue(())
    })
  });

  let router = RouterHandle::spawn(store.clone());
  let sender = router.sender();
  let lines = stream::unfold(BufReader::new(tokio::io::stdin()).lines(), |mut lines| async move {
    match lines.next_line().await {
      Ok(Some(line)) => Some((line, lines)),
      Ok(None) => None,
      Err(e) => {
        warn!(err = %e, "ingest: failed to read stdin");
        None
      }
    }
  });

  let acks: Vec<Ack> = lines
    .filter(|line| future::ready(!line.trim().is_empty()))
    .map(|line| {
      let sender = sender.clone();
      async move {
        let message = match Message::from_json(&line) {
          Ok(message) => message,
          Err(e) => return Ack::Rejected(e.to_string()),
        };
        match sender.request(message).await {
          Ok(ack) => ack,
          Err(e) => {
            warn!(err = %e, "ingest: message failed");
            Ack::Rejected(e.to_string())
          }
        }
      }
    })
    .buffer_unordered(INGEST_CONCURRENCY)
    .collect()
    .await;
  drop(sender);
  router.shutdown().await;
  // Dropping the last store handle closes the notifier; the observer drains the final snapshot and exits.
  drop(store);
  if let Some(observer) = observer {
    observer.join().await;
  }

  let count = |f: fn(&Ack) -> bool| acks.iter().filter(|a| f(a)).count();
  println!(
    "{} messages: {} recorded, {} duplicate, {} deleted, {} rejected",
    acks.len(),
    count(|a| matches!(a, Ack::Recorded)),
    count(|a| matches!(a, Ack::Duplicate)),
    acks.iter().map(|a| if let Ack::Deleted(n) = a { *n } else { 0 }).sum::<usize>(),
    count(|a| matches!(a, Ack::Rejected(_))),
  );
  info!(messages = acks.len(), "ingest: done");
  Ok(())
}

async fn watch(store: Arc<HistoryStore>) -> Result<()> {
  let mut changes = store.subscribe();
  let mut poll = tokio::time::interval(Duration::from_millis(constants().watch_poll_ms));
  let ctrl_c = tokio::signal::ctrl_c();
  tokio::pin!(ctrl_c);

  loop {
    tokio::select! {
      _ = poll.tick() => {
        if let Err(e) = store.refresh().await {
          warn!(err = %e, "watch: failed to re-read history");
        }
      }
      Some(snapshot) = changes.changed() => print_change(&snapshot),
      _ = &mut ctrl_c => break,
    }
  }
  info!("watch: stopped");
  Ok(())
}

async fn run(args: Args, mut config: Config, data_dir: PathBuf) -> Result<()> {
  let storage = FileStorage::new(&data_dir)
    .await
    .with_context(|| format!("Failed to open history in {}", data_dir.display()))?;
  let store = Arc::new(HistoryStore::with_settings(Arc::new(storage), config.store_settings()));

  match args.command {
    Command::List { search, media_type, from, to, sort, limit, json } => {
      let snapshot = store.query().await.context("Failed to read history")?;
      let criteria = Criteria {
        search,
        media_type: media_type.into(),
        sort: sort.map(SortKey::from).unwrap_or_else(|| config.default_sort()),
        limit: limit.or(config.list_limit),
        ..Default::default()
      }
      .with_days(&Local, from, to);
      let selected = select(&snapshot, &criteria);
      if json {
        println!("{}", serde_json::to_string_pretty(&selected).context("Failed to encode entries")?);
      } else {
        print_table(&selected);
      }
    }
    Command::Recent => {
      let c = constants();
      let snapshot = store.query().await.context("Failed to read history")?;
      if snapshot.is_empty() {
        println!("No media detected yet.");
      }
      for entry in snapshot.iter().take(c.popup_limit) {
        let title = format_title(&entry.title);
        let download = DownloadRequest::new(&entry.url, &title, entry.media_type);
        println!("{}", truncate_text(&title, c.popup_title_width));
        println!("  {}", truncate_text(&entry.url, c.popup_url_width));
        println!("  {}  ->  {}", local_time(entry), download.filename);
      }
    }
    Command::Record { url, page_url, title, media_type, thumbnail, poster } => {
      let thumbnail = match (thumbnail, poster) {
        (Some(path), _) => match std::fs::read(&path).map_err(anyhow::Error::from).and_then(|b| thumbnail_from_bytes(&b)) {
          Ok(thumb) => Some(thumb),
          Err(e) => {
            warn!(path = %path.display(), err = %format!("{:#}", e), "record: thumbnail skipped");
            None
          }
        },
        (None, Some(poster)) => capture_thumbnail(&reqwest::Client::new(), Some(&poster), None).await,
        (None, None) => None,
      };
      let payload = DetectedPayload {
        url: Some(url),
        page_url: Some(page_url),
        title,
        media_type,
        timestamp: None,
        thumbnail,
      };
      let ack = protocol::dispatch(&store, Message::MediaDetected(payload)).await.context("Failed to record media")?;
      print_ack(&ack);
    }
    Command::Delete { url, page_url, timestamp } => {
      let payload = DeletePayload { url: Some(url), page_url: Some(page_url), timestamp: Some(timestamp) };
      let ack = protocol::dispatch(&store, Message::DeleteMedia(payload)).await.context("Failed to delete media")?;
      print_ack(&ack);
    }
    Command::Ingest { follow } => ingest(store, follow).await?,
    Command::Watch => watch(store).await?,
    Command::Filename { url, title, media_type } => {
      println!("{}", download_name(&url, title.as_deref(), media_type.as_deref()).filename);
    }
    Command::Prefs { default_sort, list_limit, storage_timeout_ms } => {
      let changed = default_sort.is_some() || list_limit.is_some() || storage_timeout_ms.is_some();
      if let Some(sort) = default_sort {
        config.default_sort = Some(SortKey::from(sort).label().to_string());
      }
      if list_limit.is_some() {
        config.list_limit = list_limit;
      }
      if storage_timeout_ms.is_some() {
        config.storage_timeout_ms = storage_timeout_ms;
      }
      if changed {
        let path = config.save().context("Failed to save preferences")?;
        info!(?config, path = %path.display(), "prefs: saved");
      }
      print!("{}", toml::to_string(&config).context("Failed to render preferences")?);
    }
    Command::Completions { .. } => unreachable!("handled before the store is opened"),
  }
  Ok(())
}

// --- Main ---

#[tokio::main]
async fn main() -> Result<()> {
  let args = Args::parse();

  if let Command::Completions { shell } = args.command {
    clap_complete::generate(shell, &mut Args::command(), "mediatrail", &mut std::io::stdout());
    return Ok(());
  }

  let config = Config::load();
  let data_dir = args
    .data_dir
    .clone()
    .or_else(|| config.data_dir())
    .ok_or_else(|| anyhow!("No data directory available; pass --data-dir"))?;
  let _guard = init_logging(&data_dir.join("logs"))?;
  info!(data_dir = %data_dir.display(), "mediatrail: starting");

  run(args, config, data_dir).await
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cli_definition_is_valid() {
    Args::command().debug_assert();
  }

  #[test]
  fn list_flags_parse() {
    let args =
      Args::try_parse_from(["mediatrail", "list", "-t", "video", "--sort", "title", "--from", "2024-05-01"]).unwrap();
    let Command::List { media_type, sort, from, .. } = args.command else { panic!("expected list") };
    assert_eq!(TypeFilter::from(media_type), TypeFilter::Video);
    assert_eq!(sort.map(SortKey::from), Some(SortKey::Title));
    assert_eq!(from, NaiveDate::from_ymd_opt(2024, 5, 1));
  }

  #[test]
  fn watch_parses_with_global_data_dir() {
    let args = Args::try_parse_from(["mediatrail", "watch", "--data-dir", "/tmp/mt"]).unwrap();
    assert!(matches!(args.command, Command::Watch));
    assert_eq!(args.data_dir, Some(PathBuf::from("/tmp/mt")));
    assert!(Args::try_parse_from(["mediatrail", "watch", "--follow"]).is_err());
  }

  #[test]
  fn download_name_formats_title() {
    let req = download_name("https://x/v/clip.webm?x=1", Some("my  great clip"), None);
    assert_eq!(req.filename, "My_Great_Clip.webm");
    assert_eq!(download_name("https://x/a", None, Some("audio")).filename, "A.mp3");
  }
}
