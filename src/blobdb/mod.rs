//! BlobDB synchronization: keeps watch-side key/value databases in step with
//! local record sources for the lifetime of one connection.

pub mod engine;
pub mod memory;
pub mod prefs;
pub mod source;

pub use engine::{BlobDbEngine, SyncFlags};
pub use memory::{MemoryRecordSource, RawItem, SourcePolicy};
pub use prefs::{watch_prefs_source, PrefValue, WatchPref, WatchPrefItem};
pub use source::{content_hash, BlobItem, BlobRecord, RecordSource};
