//! Capped, deduplicated history of media seen on visited pages.
//!
//! Detectors report media elements as [`protocol::Message`]s; the
//! [`store::HistoryStore`] applies them one at a time against a single
//! persisted slot and publishes snapshots through its
//! [`notifier::ChangeNotifier`]. Views filter and sort snapshots with
//! [`select::select`].

pub mod config;
pub mod constants;
pub mod detector;
pub mod download;
pub mod media;
pub mod notifier;
pub mod protocol;
pub mod router;
pub mod select;
pub mod storage;
pub mod store;
pub mod thumbnail;
pub mod title;

pub use media::{DeleteKey, MediaEntry, MediaType};
pub use notifier::{ChangeNotifier, Snapshot, Subscription};
pub use protocol::{Ack, Message};
pub use store::{HistoryStore, RecordOutcome, StoreError};
