use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::digest::Algorithm;
use crate::error::{Error, Result};
use crate::remote_project;
use crate::session::Session;

pub const SMALL_FILE_THRESHOLD: u64 = 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// Snapshot of in-flight transfer progress, polled by callers (e.g. a CLI
/// status line) rather than pushed — mirrors the teacher's `HttpStats`
/// snapshot style.
#[derive(Debug, Clone, Copy, Default)]
pub struct Progress {
    pub bytes_done: u64,
    pub bytes_total: u64,
}

struct UploadJob {
    path: String,
    url: String,
    local_path: PathBuf,
    size: u64,
    expected_digest: Option<String>,
    algorithm: Algorithm,
}

struct DownloadJob {
    path: String,
    url: String,
    local_path: PathBuf,
}

/// One completed transfer, correlated back to the `Asset::path` it was
/// enqueued for so `changes::apply` can update `last_index` afterward.
pub struct TransferOutcome {
    pub path: String,
    pub response: Option<serde_json::Value>,
}

/// Result of draining both queues. Each direction's `outcomes` list holds
/// every transfer that completed before that direction stopped, whether it
/// stopped because the queue ran dry or because a job failed — a failure in
/// one direction never discards the other direction's completed work.
/// `error` carries whichever direction failed first (uploads take priority
/// on a tie, matching the order `run` joins them in).
pub struct RunOutcome {
    pub upload_outcomes: Vec<TransferOutcome>,
    pub download_outcomes: Vec<TransferOutcome>,
    pub error: Option<Error>,
}

#[derive(Default)]
struct ProgressTracker {
    upload: Mutex<Progress>,
    download: Mutex<Progress>,
}

/// Two independent FIFO queues — one per direction — each drained by
/// exactly one worker once `start` is called. Transfers within a direction
/// run strictly in enqueue order; there is no ordering guarantee between
/// directions (SPEC_FULL.md §5).
pub struct TransferScheduler {
    chunk_size: usize,
    uploads: Mutex<VecDeque<UploadJob>>,
    downloads: Mutex<VecDeque<DownloadJob>>,
    cancel: Arc<AtomicBool>,
    progress: Arc<ProgressTracker>,
}

impl TransferScheduler {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            uploads: Mutex::new(VecDeque::new()),
            downloads: Mutex::new(VecDeque::new()),
            cancel: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(ProgressTracker::default()),
        }
    }

    pub fn enqueue_upload(
        &self,
        path: impl Into<String>,
        url: impl Into<String>,
        local_path: impl Into<PathBuf>,
        size: u64,
        expected_digest: Option<String>,
        algorithm: Algorithm,
    ) {
        self.uploads.lock().unwrap().push_back(UploadJob {
            path: path.into(),
            url: url.into(),
            local_path: local_path.into(),
            size,
            expected_digest,
            algorithm,
        });
        self.progress.upload.lock().unwrap().bytes_total += size;
    }

    pub fn enqueue_download(
        &self,
        path: impl Into<String>,
        url: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) {
        self.downloads.lock().unwrap().push_back(DownloadJob {
            path: path.into(),
            url: url.into(),
            local_path: local_path.into(),
        });
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn progress(&self, direction: Direction) -> Progress {
        match direction {
            Direction::Upload => *self.progress.upload.lock().unwrap(),
            Direction::Download => *self.progress.download.lock().unwrap(),
        }
    }

    /// Drains both queues concurrently, one worker per direction, returning
    /// once every enqueued job has completed or the first error/cancel is
    /// hit in that direction. `apply` in `changes.rs` enqueues an entire
    /// pass's worth of work before calling this, matching SPEC_FULL.md
    /// §4.4/§5. Unlike a plain `Result`, a failure in one direction never
    /// discards the other direction's already-completed transfers — both
    /// run to their own stopping point before `run` returns.
    pub async fn run(&self, session: &Session) -> RunOutcome {
        let (up, down) = tokio::join!(self.run_uploads(session), self.run_downloads(session));
        let (upload_outcomes, upload_err) = up;
        let (download_outcomes, download_err) = down;
        RunOutcome {
            upload_outcomes,
            download_outcomes,
            error: upload_err.or(download_err),
        }
    }

    async fn run_uploads(&self, session: &Session) -> (Vec<TransferOutcome>, Option<Error>) {
        let mut outcomes = Vec::new();
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                return (outcomes, Some(Error::Cancelled));
            }
            let job = self.uploads.lock().unwrap().pop_front();
            let Some(job) = job else { return (outcomes, None) };

            let tracker = self.progress.clone();
            let done_base: u64 = {
                let snap = tracker.upload.lock().unwrap();
                snap.bytes_done
            };
            let cancel = self.cancel.clone();
            let response = match session
                .upload_stream(
                    &job.url,
                    &job.local_path,
                    job.size,
                    self.chunk_size,
                    cancel,
                    move |n| {
                        let mut snap = tracker.upload.lock().unwrap();
                        snap.bytes_done = done_base + n;
                    },
                )
                .await
            {
                Ok(r) => r,
                Err(e) => return (outcomes, Some(e)),
            };

            if let Some(expected) = &job.expected_digest {
                if let Some(actual) = remote_project::extract_digest(&response, job.algorithm) {
                    if expected != &actual {
                        return (
                            outcomes,
                            Some(Error::Integrity {
                                path: job.path,
                                expected: expected.clone(),
                                actual,
                            }),
                        );
                    }
                }
            }

            outcomes.push(TransferOutcome {
                path: job.path,
                response: Some(response),
            });
        }
    }

    async fn run_downloads(&self, session: &Session) -> (Vec<TransferOutcome>, Option<Error>) {
        let mut outcomes = Vec::new();
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                return (outcomes, Some(Error::Cancelled));
            }
            let job = self.downloads.lock().unwrap().pop_front();
            let Some(job) = job else { return (outcomes, None) };

            if let Some(parent) = job.local_path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent).map_err(|e| Error::local_io(parent, e)) {
                    return (outcomes, Some(e));
                }
            }
            let tmp_path = job.local_path.with_extension("osfsync-download");
            {
                let mut file = match std::fs::File::create(&tmp_path).map_err(|e| Error::local_io(&tmp_path, e)) {
                    Ok(f) => f,
                    Err(e) => return (outcomes, Some(e)),
                };
                if let Err(e) = session
                    .download_stream(&job.url, &mut file, &self.cancel, |_| {})
                    .await
                {
                    return (outcomes, Some(e));
                }
            }
            if let Err(e) =
                std::fs::rename(&tmp_path, &job.local_path).map_err(|e| Error::local_io(&job.local_path, e))
            {
                return (outcomes, Some(e));
            }
            outcomes.push(TransferOutcome {
                path: job.path,
                response: None,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use tokio::net::TcpListener;

    #[test]
    fn enqueue_upload_accumulates_total_bytes() {
        let scheduler = TransferScheduler::new(DEFAULT_CHUNK_SIZE);
        scheduler.enqueue_upload("a.txt", "https://example/a", "/tmp/a", 100, None, Algorithm::Md5);
        scheduler.enqueue_upload("b.txt", "https://example/b", "/tmp/b", 50, None, Algorithm::Md5);
        assert_eq!(scheduler.progress(Direction::Upload).bytes_total, 150);
    }

    #[test]
    fn cancel_sets_flag() {
        let scheduler = TransferScheduler::new(DEFAULT_CHUNK_SIZE);
        assert!(!scheduler.cancel.load(Ordering::Relaxed));
        scheduler.cancel();
        assert!(scheduler.cancel.load(Ordering::Relaxed));
    }

    async fn spawn(app: axum::Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    /// A failing download must not discard an upload that completed in the
    /// other direction's worker — the bug this scheduler used to have.
    #[tokio::test]
    async fn run_keeps_completed_outcomes_from_the_other_direction_on_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let upload_path = tmp.path().join("ok.bin");
        std::fs::write(&upload_path, b"payload").unwrap();

        let app = axum::Router::new()
            .route(
                "/upload",
                axum::routing::put(|body: axum::body::Body| async move {
                    let _ = axum::body::to_bytes(body, usize::MAX).await.unwrap();
                    axum::Json(serde_json::json!({"data": {"attributes": {"extra": {"hashes": {}}}}}))
                }),
            )
            .route(
                "/download",
                axum::routing::get(|| async move { axum::http::StatusCode::NOT_FOUND }),
            );
        let base = spawn(app).await;
        let session = Session::new(&base).unwrap();

        let scheduler = TransferScheduler::new(DEFAULT_CHUNK_SIZE);
        scheduler.enqueue_upload(
            "ok.bin",
            format!("{base}/upload"),
            &upload_path,
            7,
            None,
            Algorithm::Md5,
        );
        scheduler.enqueue_download(
            "missing.bin",
            format!("{base}/download"),
            tmp.path().join("missing.bin"),
        );

        let outcome = scheduler.run(&session).await;
        assert!(outcome.error.is_some());
        assert_eq!(outcome.upload_outcomes.len(), 1);
        assert_eq!(outcome.upload_outcomes[0].path, "ok.bin");
        assert!(outcome.download_outcomes.is_empty());
    }
}
