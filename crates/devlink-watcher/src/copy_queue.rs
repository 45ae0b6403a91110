//! Ordered, retryable file-copy pipeline.
//!
//! Jobs accumulate while the queue is in the queued phase and only start
//! executing once `process_queue` flips it to draining; anything enqueued
//! afterwards executes immediately. The one-way transition guarantees no copy
//! lands in `node_modules` before a required republish/install has finished.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

/// Maximum number of retries per copy (4 attempts total).
pub const MAX_COPY_RETRIES: u32 = 3;

/// Backoff base: 500ms, 1000ms, 2000ms.
const RETRY_BASE_DELAY_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct CopyJob {
    pub old_path: PathBuf,
    pub new_path: PathBuf,
    pub package_name: String,
}

/// Completion handle for an enqueued copy. Resolves once the copy succeeds or
/// exhausts its retries.
pub type CopyTicket = oneshot::Receiver<Result<()>>;

pub struct CopyQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    source_path: PathBuf,
    num_copied: AtomicUsize,
    state: Mutex<QueueState>,
}

enum QueueState {
    Queued(Vec<PendingCopy>),
    Draining,
}

struct PendingCopy {
    job: CopyJob,
    done: oneshot::Sender<Result<()>>,
}

impl CopyQueue {
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        CopyQueue {
            inner: Arc::new(QueueInner {
                source_path: source_path.into(),
                num_copied: AtomicUsize::new(0),
                state: Mutex::new(QueueState::Queued(Vec::new())),
            }),
        }
    }

    /// Queue a copy, or execute it immediately when already draining.
    pub fn enqueue(&self, job: CopyJob) -> CopyTicket {
        let (done, ticket) = oneshot::channel();
        let mut state = self.inner.state.lock().expect("copy queue lock poisoned");
        match &mut *state {
            QueueState::Queued(pending) => pending.push(PendingCopy { job, done }),
            QueueState::Draining => {
                tokio::spawn(execute_copy(Arc::clone(&self.inner), job, done));
            }
        }
        ticket
    }

    /// Flip to the draining phase and start every queued copy.
    pub fn process_queue(&self) {
        let pending = {
            let mut state = self.inner.state.lock().expect("copy queue lock poisoned");
            match std::mem::replace(&mut *state, QueueState::Draining) {
                QueueState::Queued(pending) => pending,
                QueueState::Draining => Vec::new(),
            }
        };
        for PendingCopy { job, done } in pending {
            tokio::spawn(execute_copy(Arc::clone(&self.inner), job, done));
        }
    }

    /// Number of files copied so far.
    pub fn num_copied(&self) -> usize {
        self.inner.num_copied.load(Ordering::Relaxed)
    }

    /// Packages with at least one queued copy. Empty once draining.
    pub fn queued_package_names(&self) -> BTreeSet<String> {
        let state = self.inner.state.lock().expect("copy queue lock poisoned");
        match &*state {
            QueueState::Queued(pending) => pending
                .iter()
                .map(|entry| entry.job.package_name.clone())
                .collect(),
            QueueState::Draining => BTreeSet::new(),
        }
    }
}

async fn execute_copy(inner: Arc<QueueInner>, job: CopyJob, done: oneshot::Sender<Result<()>>) {
    let mut retry: u32 = 0;
    loop {
        match copy_file(&job.old_path, &job.new_path).await {
            Ok(()) => {
                inner.num_copied.fetch_add(1, Ordering::Relaxed);
                let relative = job
                    .old_path
                    .strip_prefix(&inner.source_path)
                    .unwrap_or(&job.old_path);
                info!(
                    "Copied `{}` to `{}`",
                    relative.display(),
                    job.new_path.display()
                );
                let _ = done.send(Ok(()));
                return;
            }
            Err(err) if retry >= MAX_COPY_RETRIES => {
                error!(
                    "Failed to copy `{}` to `{}`: {err:#}",
                    job.old_path.display(),
                    job.new_path.display()
                );
                let _ = done.send(Err(err));
                return;
            }
            Err(err) => {
                debug!(
                    "Copy of `{}` failed (attempt {}), retrying: {err:#}",
                    job.old_path.display(),
                    retry + 1
                );
                tokio::time::sleep(Duration::from_millis(RETRY_BASE_DELAY_MS << retry)).await;
                retry += 1;
            }
        }
    }
}

async fn copy_file(old_path: &Path, new_path: &Path) -> Result<()> {
    if let Some(parent) = new_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    tokio::fs::copy(old_path, new_path)
        .await
        .with_context(|| format!("failed to copy {}", old_path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use tokio::time::Instant;

    fn job(temp: &TempDir, name: &str) -> CopyJob {
        let old_path = temp.path().join("source").join(name);
        fs::create_dir_all(old_path.parent().unwrap()).unwrap();
        fs::write(&old_path, name).unwrap();
        CopyJob {
            old_path,
            new_path: temp.path().join("dest/node_modules/pkg").join(name),
            package_name: "pkg".to_string(),
        }
    }

    #[tokio::test]
    async fn queued_jobs_do_not_execute_before_drain() {
        let temp = TempDir::new().unwrap();
        let queue = CopyQueue::new(temp.path().join("source"));
        let job = job(&temp, "file.js");
        let new_path = job.new_path.clone();

        let ticket = queue.enqueue(job);

        // Give any (incorrect) spawned copy a chance to run.
        tokio::task::yield_now().await;
        assert!(!new_path.exists());
        assert_eq!(queue.num_copied(), 0);
        assert_eq!(
            queue.queued_package_names(),
            ["pkg".to_string()].into_iter().collect()
        );

        queue.process_queue();
        ticket.await.unwrap().unwrap();

        assert!(new_path.exists());
        assert_eq!(queue.num_copied(), 1);
    }

    #[tokio::test]
    async fn jobs_enqueued_after_drain_execute_immediately() {
        let temp = TempDir::new().unwrap();
        let queue = CopyQueue::new(temp.path().join("source"));
        queue.process_queue();

        let job = job(&temp, "file.js");
        let new_path = job.new_path.clone();
        queue.enqueue(job).await.unwrap().unwrap();

        assert!(new_path.exists());
        assert_eq!(queue.num_copied(), 1);
    }

    #[tokio::test]
    async fn failed_jobs_do_not_block_siblings() {
        let temp = TempDir::new().unwrap();
        let queue = CopyQueue::new(temp.path().join("source"));

        let broken = CopyJob {
            old_path: temp.path().join("source/missing.js"),
            new_path: temp.path().join("dest/node_modules/pkg/missing.js"),
            package_name: "pkg".to_string(),
        };
        let healthy = job(&temp, "file.js");
        let healthy_path = healthy.new_path.clone();

        let broken_ticket = queue.enqueue(broken);
        let healthy_ticket = queue.enqueue(healthy);
        queue.process_queue();

        assert!(broken_ticket.await.unwrap().is_err());
        healthy_ticket.await.unwrap().unwrap();
        assert!(healthy_path.exists());
        assert_eq!(queue.num_copied(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_reject_after_full_backoff() {
        let temp = TempDir::new().unwrap();
        let queue = CopyQueue::new(temp.path().join("source"));
        queue.process_queue();

        let started = Instant::now();
        let ticket = queue.enqueue(CopyJob {
            old_path: temp.path().join("source/missing.js"),
            new_path: temp.path().join("dest/node_modules/pkg/missing.js"),
            package_name: "pkg".to_string(),
        });

        assert!(ticket.await.unwrap().is_err());
        // 4 attempts with 500ms, 1000ms and 2000ms of backoff in between.
        assert!(started.elapsed() >= Duration::from_millis(3500));
        assert_eq!(queue.num_copied(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn copy_succeeds_once_source_appears_mid_retry() {
        let temp = TempDir::new().unwrap();
        let queue = CopyQueue::new(temp.path().join("source"));
        queue.process_queue();

        let old_path = temp.path().join("source/late.js");
        fs::create_dir_all(old_path.parent().unwrap()).unwrap();
        let new_path = temp.path().join("dest/node_modules/pkg/late.js");

        let ticket = queue.enqueue(CopyJob {
            old_path: old_path.clone(),
            new_path: new_path.clone(),
            package_name: "pkg".to_string(),
        });

        // Two attempts fail, then the file shows up.
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1200)).await;
            fs::write(&old_path, "late").unwrap();
        });

        ticket.await.unwrap().unwrap();
        writer.await.unwrap();
        assert!(new_path.exists());
        assert_eq!(queue.num_copied(), 1);
    }
}
