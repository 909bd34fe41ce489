/// Download workers.
///
/// Each worker takes one chunk at a time off the dispatch queue, makes a
/// single range-download attempt, and always hands the chunk back on the
/// task queue. That hand-back is the retry path.
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::Client;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use rangefetch_shared::{Chunk, DownloadError, DownloadResult};

use crate::client;

/// A chunk handed to a worker, with how long to wait before trying it.
#[derive(Debug)]
pub(crate) struct Assignment {
    pub chunk: Chunk,
    pub delay: Duration,
}

/// Immutable per-run download target, shared by all workers.
pub(crate) struct Target {
    pub client: Client,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub output: PathBuf,
    pub buffer_size: usize,
}

pub(crate) struct Worker {
    pub id: usize,
    pub target: Arc<Target>,
    pub dispatch: Arc<Mutex<mpsc::Receiver<Assignment>>>,
    pub progress_tx: mpsc::Sender<Chunk>,
    pub task_tx: mpsc::Sender<Chunk>,
    pub cancel: CancellationToken,
}

impl Worker {
    pub(crate) async fn run(self) {
        debug!("Worker {} started", self.id);
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                assignment = async { self.dispatch.lock().await.recv().await } => assignment,
            };
            let Some(Assignment { mut chunk, delay }) = next else {
                break;
            };

            if !delay.is_zero() {
                debug!("Worker {} backing off {:?} before chunk {}", self.id, delay, chunk.id);
                let interrupted = tokio::select! {
                    _ = self.cancel.cancelled() => true,
                    _ = tokio::time::sleep(delay) => false,
                };
                if interrupted {
                    let _ = self.task_tx.send(chunk).await;
                    break;
                }
            }

            self.download(&mut chunk).await;

            if self.task_tx.send(chunk).await.is_err() {
                warn!("Worker {}: task queue closed, exiting", self.id);
                break;
            }
        }
        debug!("Worker {} exiting", self.id);
    }

    /// One attempt. Never fails outward: errors land on the chunk.
    async fn download(&self, chunk: &mut Chunk) {
        chunk.clear_error();
        chunk.attempts += 1;
        let base_ms = chunk.elapsed_ms;
        let started = Instant::now();
        let begin_offset = chunk.current;

        let result = self.attempt(chunk, base_ms, started).await;
        chunk.elapsed_ms = base_ms + started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => debug!(
                "Worker {} finished chunk {} ({} bytes this attempt, {} total)",
                self.id,
                chunk.id,
                chunk.current - begin_offset,
                chunk.size()
            ),
            Err(DownloadError::Cancelled) => {
                debug!("Worker {}: chunk {} cancelled at offset {}", self.id, chunk.id, chunk.current);
                chunk.record_error(&DownloadError::Cancelled);
            }
            Err(e) if e.is_transport() => {
                warn!(
                    "Worker {}: chunk {} attempt {} stopped at offset {}: {}",
                    self.id, chunk.id, chunk.attempts, chunk.current, e
                );
                chunk.record_error(&e);
            }
            Err(e) => {
                error!(
                    "Worker {}: chunk {} attempt {} failed at offset {}: {}",
                    self.id, chunk.id, chunk.attempts, chunk.current, e
                );
                chunk.record_error(&e);
            }
        }
    }

    async fn attempt(&self, chunk: &mut Chunk, base_ms: u64, started: Instant) -> DownloadResult<()> {
        let target = &self.target;

        let mut file = OpenOptions::new()
            .write(true)
            .open(&target.output)
            .await
            .map_err(DownloadError::IoOpen)?;
        file.seek(SeekFrom::Start(chunk.current))
            .await
            .map_err(DownloadError::IoSeek)?;

        let url = client::parse_url(&target.url)?;
        let response = client::fetch_range(&target.client, url, &target.headers, chunk).await?;
        let mut body = response.bytes_stream();

        while !chunk.is_complete() {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
                next = body.next() => next,
            };
            let bytes = match next {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => return Err(DownloadError::ReadFailure(e.to_string())),
                None => {
                    return Err(DownloadError::ReadFailure(format!(
                        "body ended at offset {}, chunk ends at {}",
                        chunk.current, chunk.end
                    )))
                }
            };
            if bytes.is_empty() {
                return Err(DownloadError::InternalBug(
                    "read returned no data and no error".into(),
                ));
            }

            // Never write past the chunk's end.
            let usable = bytes.len().min(usize::try_from(chunk.remaining()).unwrap_or(usize::MAX));
            for piece in bytes[..usable].chunks(target.buffer_size) {
                file.write_all(piece).await.map_err(DownloadError::IoWrite)?;
                file.flush().await.map_err(DownloadError::IoWrite)?;
                // Durable before acknowledged.
                file.sync_all().await.map_err(DownloadError::IoSync)?;

                chunk.current += piece.len() as u64;
                chunk.elapsed_ms = base_ms + started.elapsed().as_millis() as u64;
                self.progress_tx
                    .send(chunk.clone())
                    .await
                    .map_err(|_| DownloadError::InternalBug("progress queue closed".into()))?;
            }
        }

        file.shutdown().await.map_err(DownloadError::IoClose)?;
        Ok(())
    }
}
