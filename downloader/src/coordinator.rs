/// Coordinator: the single owner of session state.
///
/// Only this loop mutates the chunk list and the aggregate counters. Workers
/// talk to it through two inbound queues (progress, task) and it talks back
/// through the dispatch queue. Every mutation is republished on a watch
/// channel so pollers always see a consistent snapshot.
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rangefetch_shared::{Chunk, ReportSnapshot, Session};

use crate::config::RetryPolicy;
use crate::store::StateStore;
use crate::worker::Assignment;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// Every chunk reached its end offset.
    Completed,
    /// Stopped by the cancellation token before completing.
    Cancelled,
    /// These chunks used up their attempt budget.
    Failed { chunks: Vec<usize> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub snapshot: ReportSnapshot,
    pub status: RunStatus,
}

pub(crate) struct Coordinator {
    session: Session,
    store: StateStore,
    retry: RetryPolicy,
    snapshot: ReportSnapshot,
    report_tx: watch::Sender<ReportSnapshot>,
    /// Dropped once nothing more will be dispatched, which lets workers exit.
    dispatch_tx: Option<mpsc::Sender<Assignment>>,
    /// Failed attempts in this run, by chunk id.
    failures: Vec<u32>,
    failed: Vec<usize>,
    cancel: CancellationToken,
    cancelled: bool,
}

impl Coordinator {
    pub(crate) fn new(
        session: Session,
        store: StateStore,
        retry: RetryPolicy,
        report_tx: watch::Sender<ReportSnapshot>,
        dispatch_tx: mpsc::Sender<Assignment>,
        cancel: CancellationToken,
    ) -> Self {
        let snapshot = ReportSnapshot::from_session(&session);
        let failures = vec![0; session.chunks.len()];
        Self {
            session,
            store,
            retry,
            snapshot,
            report_tx,
            dispatch_tx: Some(dispatch_tx),
            failures,
            failed: Vec::new(),
            cancel,
            cancelled: false,
        }
    }

    /// Run until both inbound queues are closed, then save one last time.
    pub(crate) async fn run(
        mut self,
        mut progress_rx: mpsc::Receiver<Chunk>,
        mut task_rx: mpsc::Receiver<Chunk>,
    ) -> RunOutcome {
        self.publish();
        self.close_if_settled();

        let cancel = self.cancel.clone();
        let mut progress_open = true;
        let mut task_open = true;

        while progress_open || task_open {
            // Progress first: a worker's last progress events are always
            // queued before its hand-back.
            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !self.cancelled => self.on_cancel(),
                event = progress_rx.recv(), if progress_open => match event {
                    Some(chunk) => self.on_progress(chunk).await,
                    None => progress_open = false,
                },
                event = task_rx.recv(), if task_open => match event {
                    Some(chunk) => self.on_task(chunk).await,
                    None => task_open = false,
                },
            }
        }

        self.save(true).await;
        let outcome = self.outcome();
        info!("Pipeline finished: {} ({:?})", outcome.snapshot, outcome.status);
        outcome
    }

    async fn on_progress(&mut self, chunk: Chunk) {
        if self.apply(chunk) {
            self.publish();
            self.save(false).await;
        }
    }

    async fn on_task(&mut self, chunk: Chunk) {
        let id = chunk.id;
        let complete = chunk.is_complete();
        let failed_attempt = !complete && !chunk.code.is_ok();
        if !self.apply(chunk) {
            return;
        }

        if complete {
            self.snapshot.done_count += 1;
            info!(
                "Chunk {} complete ({}/{})",
                id, self.snapshot.done_count, self.snapshot.task_count
            );
            self.publish();
            self.save(true).await;
            self.close_if_settled();
            return;
        }

        if failed_attempt {
            self.failures[id] += 1;
        }

        let Some(dispatch_tx) = self.dispatch_tx.clone() else {
            debug!("Chunk {} returned after dispatch closed", id);
            self.publish();
            self.save(false).await;
            return;
        };

        if !self.retry.allows(self.failures[id]) {
            error!(
                "Chunk {} gave up after {} failed attempts: {}",
                id,
                self.failures[id],
                self.session.chunks[id].error.as_deref().unwrap_or("unknown error")
            );
            self.failed.push(id);
            self.snapshot.failed_count += 1;
            self.publish();
            self.save(true).await;
            self.close_if_settled();
            return;
        }

        let assignment = Assignment {
            chunk: self.session.chunks[id].clone(),
            delay: self.retry.delay(self.failures[id]),
        };
        self.publish();
        if dispatch_tx.send(assignment).await.is_err() {
            warn!("Dispatch queue closed; chunk {} not redispatched", id);
        }
        self.save(false).await;
    }

    fn on_cancel(&mut self) {
        self.cancelled = true;
        if self.dispatch_tx.take().is_some() {
            info!("Cancellation requested; draining workers");
        }
    }

    /// Overwrite the stored chunk and account for the byte delta.
    fn apply(&mut self, chunk: Chunk) -> bool {
        let Some(slot) = self.session.chunks.get_mut(chunk.id) else {
            warn!("Ignoring update for unknown chunk {}", chunk.id);
            return false;
        };
        if chunk.current >= slot.current {
            self.snapshot.completed_size += chunk.current - slot.current;
        } else {
            self.snapshot.completed_size = self
                .snapshot
                .completed_size
                .saturating_sub(slot.current - chunk.current);
        }
        *slot = chunk;
        true
    }

    fn close_if_settled(&mut self) {
        if self.snapshot.is_finished() && self.dispatch_tx.take().is_some() {
            debug!("All chunks settled; closing dispatch queue");
        }
    }

    fn publish(&self) {
        self.report_tx.send_replace(self.snapshot);
    }

    async fn save(&mut self, force: bool) {
        if let Err(e) = self.store.save(&self.session, force).await {
            warn!("Failed to save state to {:?}: {}", self.store.path(), e);
        }
    }

    fn outcome(&self) -> RunOutcome {
        let status = if self.snapshot.is_complete() {
            RunStatus::Completed
        } else if self.cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Failed {
                chunks: self.failed.clone(),
            }
        };
        RunOutcome {
            snapshot: self.snapshot,
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use rangefetch_shared::{DownloadError, ErrorCode};

    struct Harness {
        progress_tx: mpsc::Sender<Chunk>,
        task_tx: mpsc::Sender<Chunk>,
        dispatch_rx: mpsc::Receiver<Assignment>,
        report_rx: watch::Receiver<ReportSnapshot>,
        cancel: CancellationToken,
        handle: tokio::task::JoinHandle<RunOutcome>,
        state_path: std::path::PathBuf,
        _dir: tempfile::TempDir,
    }

    fn start(session: Session, retry: RetryPolicy) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("job.cfg");
        let store = StateStore::new(&state_path).with_interval(Duration::from_secs(3600));
        let (progress_tx, progress_rx) = mpsc::channel(8);
        let (task_tx, task_rx) = mpsc::channel(8);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(8);
        let (report_tx, report_rx) = watch::channel(ReportSnapshot::default());
        let cancel = CancellationToken::new();
        let coordinator = Coordinator::new(session, store, retry, report_tx, dispatch_tx, cancel.clone());
        let handle = tokio::spawn(coordinator.run(progress_rx, task_rx));
        Harness {
            progress_tx,
            task_tx,
            dispatch_rx,
            report_rx,
            cancel,
            handle,
            state_path,
            _dir: dir,
        }
    }

    fn session() -> Session {
        Session::new("out.bin", "http://127.0.0.1/f", HashMap::new(), 10_000, 30, 4096).unwrap()
    }

    fn failed_after(mut chunk: Chunk, bytes: u64) -> Chunk {
        chunk.current += bytes;
        chunk.attempts += 1;
        chunk.record_error(&DownloadError::ReadFailure("connection reset".into()));
        chunk
    }

    fn finished(mut chunk: Chunk) -> Chunk {
        chunk.current = chunk.end + 1;
        chunk.attempts += 1;
        chunk.clear_error();
        chunk
    }

    #[tokio::test]
    async fn test_partial_failure_is_redispatched_from_reached_offset() {
        let session = session();
        let chunk1 = session.chunks[1].clone();
        let mut h = start(session, RetryPolicy::unlimited());

        h.task_tx.send(chunk1.clone()).await.unwrap();
        let first = h.dispatch_rx.recv().await.unwrap();
        assert_eq!(first.chunk, chunk1);
        assert_eq!(first.delay, Duration::ZERO);

        let mut progressed = chunk1.clone();
        progressed.current += 1000;
        progressed.attempts = 1;
        h.progress_tx.send(progressed).await.unwrap();
        h.task_tx.send(failed_after(chunk1.clone(), 1000)).await.unwrap();

        let retry = h.dispatch_rx.recv().await.unwrap();
        assert_eq!(retry.chunk.begin, 4096);
        assert_eq!(retry.chunk.current, 5096);
        assert_eq!(retry.chunk.end, 8191);
        assert_eq!(retry.chunk.attempts, 1);
        assert_eq!(retry.chunk.code, ErrorCode::ReadFailure);
        assert_eq!(h.report_rx.borrow().completed_size, 1000);

        h.task_tx.send(finished(retry.chunk)).await.unwrap();
        h.report_rx
            .wait_for(|s| s.done_count == 1)
            .await
            .unwrap();
        assert_eq!(h.report_rx.borrow().completed_size, 4096);

        h.cancel.cancel();
        drop(h.progress_tx);
        drop(h.task_tx);
        let outcome = h.handle.await.unwrap();
        assert_eq!(outcome.status, RunStatus::Cancelled);

        let saved = StateStore::load(&h.state_path).await.unwrap();
        assert_eq!(saved.chunks[1].current, 8192);
        assert_eq!(saved.chunks[1].attempts, 2);
    }

    #[tokio::test]
    async fn test_completion_closes_dispatch() {
        let session = session();
        let chunks = session.chunks.clone();
        let mut h = start(session, RetryPolicy::unlimited());

        for chunk in chunks {
            h.task_tx.send(finished(chunk)).await.unwrap();
        }
        assert!(h.dispatch_rx.recv().await.is_none());

        drop(h.progress_tx);
        drop(h.task_tx);
        let outcome = h.handle.await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.snapshot.done_count, 3);
        assert_eq!(outcome.snapshot.completed_size, 10_000);
        assert!(StateStore::load(&h.state_path).await.unwrap().is_complete());
    }

    #[tokio::test]
    async fn test_attempt_cap_marks_chunk_failed() {
        let mut session = session();
        for chunk in session.chunks.iter_mut().skip(1) {
            chunk.current = chunk.end + 1;
        }
        let chunk0 = session.chunks[0].clone();
        let mut h = start(
            session,
            RetryPolicy::unlimited()
                .with_max_attempts(2)
                .with_backoff(Duration::from_millis(50)),
        );

        h.task_tx.send(failed_after(chunk0, 0)).await.unwrap();
        let retry = h.dispatch_rx.recv().await.unwrap();
        assert_eq!(retry.delay, Duration::from_millis(50));

        h.task_tx.send(failed_after(retry.chunk, 10)).await.unwrap();
        assert!(h.dispatch_rx.recv().await.is_none());

        drop(h.progress_tx);
        drop(h.task_tx);
        let outcome = h.handle.await.unwrap();
        assert_eq!(outcome.status, RunStatus::Failed { chunks: vec![0] });
        assert_eq!(outcome.snapshot.failed_count, 1);
        assert_eq!(outcome.snapshot.done_count, 2);

        let saved = StateStore::load(&h.state_path).await.unwrap();
        assert_eq!(saved.chunks[0].current, 10);
        assert_eq!(saved.chunks[0].attempts, 2);
        assert_eq!(saved.chunks[0].code, ErrorCode::ReadFailure);
    }

    #[tokio::test]
    async fn test_already_complete_session_settles_immediately() {
        let mut session = session();
        for chunk in session.chunks.iter_mut() {
            chunk.current = chunk.end + 1;
        }
        let mut h = start(session, RetryPolicy::unlimited());
        assert!(h.dispatch_rx.recv().await.is_none());

        drop(h.progress_tx);
        drop(h.task_tx);
        let outcome = h.handle.await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.snapshot.done_count, outcome.snapshot.task_count);
    }

    #[tokio::test]
    async fn test_unknown_chunk_is_ignored() {
        let mut h = start(session(), RetryPolicy::unlimited());
        let mut bogus = Chunk::new(99, 0, 10);
        bogus.current = 5;
        h.progress_tx.send(bogus).await.unwrap();

        h.cancel.cancel();
        drop(h.progress_tx);
        drop(h.task_tx);
        let outcome = h.handle.await.unwrap();
        assert_eq!(outcome.snapshot.completed_size, 0);
        assert!(h.dispatch_rx.recv().await.is_none());
    }
}
