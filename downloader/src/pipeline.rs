/// Pipeline wiring: queues, the worker pool, and the coordinator.
///
/// `start` returns as soon as everything is spawned. The caller polls the
/// report channel and eventually awaits the handle for the final outcome.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use rangefetch_shared::{Chunk, DownloadError, DownloadResult, ReportSnapshot, Session};

use crate::client;
use crate::config::DownloaderConfig;
use crate::coordinator::{Coordinator, RunOutcome};
use crate::init::{self, NewDownload};
use crate::store::StateStore;
use crate::worker::{Assignment, Target, Worker};

/// A running download.
pub struct DownloadHandle {
    report_rx: watch::Receiver<ReportSnapshot>,
    cancel: CancellationToken,
    task: JoinHandle<RunOutcome>,
}

impl DownloadHandle {
    /// The latest published snapshot.
    pub fn report(&self) -> ReportSnapshot {
        *self.report_rx.borrow()
    }

    /// A receiver for awaiting snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<ReportSnapshot> {
        self.report_rx.clone()
    }

    /// Ask workers to stop. In-flight progress is still saved.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the coordinator's final save and outcome.
    pub async fn wait(self) -> DownloadResult<RunOutcome> {
        self.task
            .await
            .map_err(|e| DownloadError::InternalBug(format!("coordinator task failed: {}", e)))
    }
}

/// Start downloading every chunk of `session` that is not yet complete.
pub fn start(session: Session, store: StateStore, config: &DownloaderConfig) -> DownloadResult<DownloadHandle> {
    config.validate()?;
    if session.timeout == 0 {
        return Err(DownloadError::InvalidConfig("session timeout must be > 0".into()));
    }

    let target = Arc::new(Target {
        client: client::build_client(session.timeout, config.no_proxy)?,
        url: session.url.clone(),
        headers: session.header.clone(),
        output: PathBuf::from(&session.name),
        buffer_size: config.buffer_size,
    });

    // No queue ever holds more than one entry per chunk.
    let capacity = session.chunks.len().max(1);
    let (progress_tx, progress_rx) = mpsc::channel::<Chunk>(capacity);
    let (task_tx, task_rx) = mpsc::channel(capacity);
    let (dispatch_tx, dispatch_rx) = mpsc::channel::<Assignment>(capacity);
    let dispatch_rx = Arc::new(Mutex::new(dispatch_rx));

    for chunk in session.pending() {
        task_tx
            .try_send(chunk.clone())
            .map_err(|e| DownloadError::InternalBug(format!("failed to seed task queue: {}", e)))?;
    }

    let snapshot = ReportSnapshot::from_session(&session);
    info!(
        "Starting {} with {} workers: {} ({} chunks pending)",
        session.url,
        config.threads,
        snapshot,
        snapshot.task_count - snapshot.done_count
    );

    let (report_tx, report_rx) = watch::channel(snapshot);
    let cancel = CancellationToken::new();

    for id in 0..config.threads {
        let worker = Worker {
            id,
            target: Arc::clone(&target),
            dispatch: Arc::clone(&dispatch_rx),
            progress_tx: progress_tx.clone(),
            task_tx: task_tx.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(worker.run());
    }
    // Workers own the only senders from here on.
    drop(progress_tx);
    drop(task_tx);

    let coordinator = Coordinator::new(
        session,
        store,
        config.retry,
        report_tx,
        dispatch_tx,
        cancel.clone(),
    );
    let task = tokio::spawn(coordinator.run(progress_rx, task_rx));

    Ok(DownloadHandle {
        report_rx,
        cancel,
        task,
    })
}

/// Convenience front end over `init` and `start`.
#[derive(Debug, Clone, Default)]
pub struct Downloader {
    config: DownloaderConfig,
}

impl Downloader {
    pub fn new(config: DownloaderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    /// Probe, preallocate, and start a fresh download.
    pub async fn create(&self, request: &NewDownload) -> DownloadResult<DownloadHandle> {
        let (session, store) = init::initialize(request, &self.config).await?;
        start(session, store, &self.config)
    }

    /// Continue a download from its state file.
    pub async fn resume(&self, state_path: impl AsRef<Path>) -> DownloadResult<DownloadHandle> {
        let (session, store) = init::resume(state_path, &self.config).await?;
        start(session, store, &self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::coordinator::RunStatus;

    #[tokio::test]
    async fn test_start_rejects_zero_threads() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new("out.bin", "http://127.0.0.1/f", HashMap::new(), 100, 30, 10).unwrap();
        let store = StateStore::new(dir.path().join("job.cfg"));
        let config = DownloaderConfig::default().with_threads(0);
        let err = start(session, store, &config).err().unwrap();
        assert!(matches!(err, DownloadError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_complete_session_finishes_without_requests() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new("out.bin", "http://127.0.0.1:9/f", HashMap::new(), 100, 30, 10).unwrap();
        for chunk in session.chunks.iter_mut() {
            chunk.current = chunk.end + 1;
        }
        let store = StateStore::new(dir.path().join("job.cfg"));
        let handle = start(session, store, &DownloaderConfig::default().with_no_proxy(true)).unwrap();
        assert!(handle.report().is_complete());

        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.snapshot.completed_size, 100);
        assert!(dir.path().join("job.cfg").exists());
    }
}
