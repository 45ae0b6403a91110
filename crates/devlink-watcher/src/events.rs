//! Filesystem event stream for the watched package roots.
//!
//! A `FileWatcher` registers every watch root with notify, then walks the
//! roots once in the background, emitting `Added` for each existing file and
//! finishing with a single `Ready` marker. Live notify events keep flowing
//! into the same channel, so the consumer sees one ordered stream covering
//! both the initial scan and steady-state changes.

use anyhow::Result;
use ignore::WalkBuilder;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Events emitted by the file watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// File discovered during the initial scan, or created afterwards.
    Added(PathBuf),
    /// Existing file modified.
    Changed(PathBuf),
    /// The initial scan of every watch root has completed.
    Ready,
}

/// Path filter shared by the notify callback and the initial scan.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    /// Watch roots whose `src/` subtree is excluded (compiled output is
    /// watched instead).
    src_excluded_roots: Vec<PathBuf>,
}

impl IgnoreRules {
    const IGNORED_COMPONENTS: &'static [&'static str] = &["node_modules", ".git", ".DS_Store"];

    pub fn new(watch_roots: &[PathBuf]) -> Self {
        IgnoreRules {
            src_excluded_roots: watch_roots.to_vec(),
        }
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        for component in path.components() {
            if let Some(name) = component.as_os_str().to_str()
                && Self::IGNORED_COMPONENTS.contains(&name)
            {
                return true;
            }
        }
        self.src_excluded_roots
            .iter()
            .any(|root| path.strip_prefix(root.join("src")).is_ok())
    }
}

/// File system watcher for the source packages being linked.
pub struct FileWatcher {
    watcher: RecommendedWatcher,
    event_rx: mpsc::UnboundedReceiver<WatchEvent>,
    event_tx: mpsc::UnboundedSender<WatchEvent>,
    watch_roots: Vec<PathBuf>,
    rules: Arc<IgnoreRules>,
}

impl FileWatcher {
    /// Create a watcher over the given roots. Call [`start`](Self::start) to
    /// register the roots and kick off the initial scan.
    pub fn new(watch_roots: Vec<PathBuf>, rules: IgnoreRules) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let rules = Arc::new(rules);

        let notify_tx = event_tx.clone();
        let notify_rules = Arc::clone(&rules);
        let watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        debug!("File system event: {:?}", event);
                        handle_notify_event(event, &notify_tx, &notify_rules);
                    }
                    Err(e) => {
                        error!("File system watch error: {}", e);
                    }
                }
            })?;

        Ok(Self {
            watcher,
            event_rx,
            event_tx,
            watch_roots,
            rules,
        })
    }

    /// Register every watch root with notify and start the background scan
    /// that replays existing files as `Added` events followed by `Ready`.
    pub fn start(&mut self) -> Result<()> {
        for root in &self.watch_roots {
            debug!("Watching directory: {}", root.display());
            self.watcher.watch(root, RecursiveMode::Recursive)?;
        }

        let roots = self.watch_roots.clone();
        let rules = Arc::clone(&self.rules);
        let event_tx = self.event_tx.clone();
        tokio::task::spawn_blocking(move || {
            for root in &roots {
                for entry in WalkBuilder::new(root)
                    .standard_filters(false)
                    .build()
                    .flatten()
                {
                    if entry.file_type().is_some_and(|t| t.is_file())
                        && !rules.is_ignored(entry.path())
                        && event_tx
                            .send(WatchEvent::Added(entry.path().to_path_buf()))
                            .is_err()
                    {
                        return;
                    }
                }
            }
            if event_tx.send(WatchEvent::Ready).is_err() {
                warn!("Watcher consumer dropped before initial scan completed");
            }
        });
        Ok(())
    }

    /// Receive the next event, or `None` once the channel closes.
    pub async fn next_event(&mut self) -> Option<WatchEvent> {
        self.event_rx.recv().await
    }
}

fn handle_notify_event(
    event: notify::Event,
    event_tx: &mpsc::UnboundedSender<WatchEvent>,
    rules: &IgnoreRules,
) {
    // Deletions and renames-away are intentionally dropped: stale files in
    // the destination are harmless until the next install.
    let make_event: fn(PathBuf) -> WatchEvent = match event.kind {
        notify::EventKind::Create(_) => WatchEvent::Added,
        notify::EventKind::Modify(_) => WatchEvent::Changed,
        _ => return,
    };
    for path in event.paths {
        if !path.is_file() || rules.is_ignored(&path) {
            continue;
        }
        if let Err(e) = event_tx.send(make_event(path)) {
            warn!("Failed to send watch event: {}", e);
        }
    }
}
