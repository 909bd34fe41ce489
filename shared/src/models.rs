/// Chunk and session models shared by the downloader crates.
///
/// Field names on the wire follow the state-file format
/// (`name`, `url`, `header`, `length`, `timeout`, `tasklist`).
use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::{DownloadError, DownloadResult, ErrorCode};

/// A contiguous byte range of the remote resource.
///
/// `end` is inclusive. The chunk is complete once `current == end + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: usize,
    pub begin: u64,
    pub current: u64,
    pub end: u64,
    /// Wall time spent on this chunk across all attempts, in milliseconds.
    #[serde(rename = "usetime")]
    pub elapsed_ms: u64,
    /// Number of download attempts made, across runs.
    #[serde(rename = "dealtimes")]
    pub attempts: u32,
    #[serde(default)]
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Chunk {
    pub fn new(id: usize, begin: u64, end: u64) -> Self {
        Self {
            id,
            begin,
            current: begin,
            end,
            elapsed_ms: 0,
            attempts: 0,
            code: ErrorCode::Ok,
            error: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.current > self.end
    }

    /// Bytes durably written so far.
    pub fn completed_bytes(&self) -> u64 {
        self.current - self.begin
    }

    /// Bytes still missing.
    pub fn remaining(&self) -> u64 {
        (self.end + 1).saturating_sub(self.current)
    }

    pub fn size(&self) -> u64 {
        self.end + 1 - self.begin
    }

    /// `Range` header value for the part still missing.
    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.current, self.end)
    }

    /// Record the outcome of an attempt.
    pub fn record_error(&mut self, err: &DownloadError) {
        self.code = err.code();
        self.error = Some(err.to_string());
    }

    pub fn clear_error(&mut self) {
        self.code = ErrorCode::Ok;
        self.error = None;
    }
}

/// The persisted record of a download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Destination file path.
    pub name: String,
    pub url: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub header: HashMap<String, String>,
    pub length: u64,
    /// Per-request timeout in seconds.
    pub timeout: u64,
    #[serde(rename = "tasklist", default, deserialize_with = "null_as_default")]
    pub chunks: Vec<Chunk>,
}

/// Treat an explicit `null` like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Session {
    /// Build a fresh session whose chunks partition `[0, length)`.
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        header: HashMap<String, String>,
        length: u64,
        timeout: u64,
        split_size: u64,
    ) -> DownloadResult<Self> {
        Ok(Self {
            name: name.into(),
            url: url.into(),
            header,
            length,
            timeout,
            chunks: partition(length, split_size)?,
        })
    }

    /// Parse a state file body.
    pub fn from_json(data: &[u8]) -> DownloadResult<Self> {
        let session: Session = serde_json::from_slice(data)?;
        session.validate()?;
        Ok(session)
    }

    /// Serialize to a state file body.
    pub fn to_json(&self) -> DownloadResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Check the chunk list still partitions the resource.
    ///
    /// Chunk ids are used as direct indexes, so a session failing this
    /// check must never reach the coordinator.
    pub fn validate(&self) -> DownloadResult<()> {
        if self.length == 0 {
            return Err(DownloadError::Parse("length is 0".into()));
        }
        if self.chunks.is_empty() {
            return Err(DownloadError::Parse(format!(
                "no chunks for {} bytes",
                self.length
            )));
        }

        let mut expected_begin = 0u64;
        for (index, chunk) in self.chunks.iter().enumerate() {
            if chunk.id != index {
                return Err(DownloadError::Parse(format!(
                    "chunk at position {} has id {}",
                    index, chunk.id
                )));
            }
            let next = chunk.end.checked_add(1).ok_or_else(|| {
                DownloadError::Parse(format!("chunk {} end {} is out of range", chunk.id, chunk.end))
            })?;
            if chunk.begin != expected_begin || chunk.end < chunk.begin {
                return Err(DownloadError::Parse(format!(
                    "chunk {} range [{}, {}] breaks the partition",
                    chunk.id, chunk.begin, chunk.end
                )));
            }
            if chunk.current < chunk.begin || chunk.current > next {
                return Err(DownloadError::Parse(format!(
                    "chunk {} offset {} outside [{}, {}]",
                    chunk.id, chunk.current, chunk.begin, next
                )));
            }
            expected_begin = next;
        }
        if expected_begin != self.length {
            return Err(DownloadError::Parse(format!(
                "chunks cover {} bytes, length is {}",
                expected_begin, self.length
            )));
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.iter().all(Chunk::is_complete)
    }

    /// Chunks that still need downloading, in id order.
    pub fn pending(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter().filter(|c| !c.is_complete())
    }
}

/// Split `[0, length)` into chunks of `split_size` bytes.
///
/// The last chunk is clipped to `length - 1`.
pub fn partition(length: u64, split_size: u64) -> DownloadResult<Vec<Chunk>> {
    if split_size == 0 {
        return Err(DownloadError::InvalidConfig("split size must be > 0".into()));
    }
    if length == 0 {
        return Err(DownloadError::InvalidLength("content length is 0".into()));
    }

    let count = length.div_ceil(split_size);
    let chunks = (0..count)
        .map(|i| {
            let begin = i * split_size;
            let end = (begin + split_size - 1).min(length - 1);
            Chunk::new(i as usize, begin, end)
        })
        .collect();
    Ok(chunks)
}

/// Aggregate progress, as seen by a poller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSnapshot {
    pub total_size: u64,
    pub completed_size: u64,
    pub done_count: u64,
    pub task_count: u64,
    /// Chunks that exhausted their attempt budget in this run.
    pub failed_count: u64,
}

impl ReportSnapshot {
    /// Recompute from chunk state.
    pub fn from_session(session: &Session) -> Self {
        Self {
            total_size: session.length,
            completed_size: session.chunks.iter().map(Chunk::completed_bytes).sum(),
            done_count: session.chunks.iter().filter(|c| c.is_complete()).count() as u64,
            task_count: session.chunks.len() as u64,
            failed_count: 0,
        }
    }

    /// Fraction of bytes completed, in `[0, 1]`.
    pub fn ratio(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        self.completed_size as f64 / self.total_size as f64
    }

    /// Every chunk is done.
    pub fn is_complete(&self) -> bool {
        self.done_count >= self.task_count
    }

    /// Nothing more will be attempted in this run.
    pub fn is_finished(&self) -> bool {
        self.done_count + self.failed_count >= self.task_count
    }
}

impl std::fmt::Display for ReportSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} {}/{} complete: {:.2}",
            self.done_count,
            self.task_count,
            self.completed_size,
            self.total_size,
            self.ratio()
        )
    }
}
