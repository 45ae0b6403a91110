//! Devlink Watcher — filesystem events, copy queue, and the watch/publish
//! orchestrator

pub mod copy_queue;
pub mod events;
pub mod stale;
pub mod watcher;

pub use copy_queue::{CopyJob, CopyQueue, CopyTicket, MAX_COPY_RETRIES};
pub use events::{FileWatcher, IgnoreRules, WatchEvent};
pub use stale::clear_stale_artifacts;
pub use watcher::{WatchOptions, WatchSession};
