/// Rangefetch - resumable multi-chunk HTTP downloader.
///
/// A download is split into fixed-size chunks that a pool of workers fetch
/// with HTTP range requests. A single coordinator task owns the session,
/// persists it to a JSON state file, and publishes progress snapshots, so an
/// interrupted download can be resumed from the last saved offsets.
pub mod client;
pub mod config;
pub mod coordinator;
pub mod init;
pub mod pipeline;
pub mod store;
mod worker;

pub use config::{DownloaderConfig, RetryPolicy, RunConfig};
pub use coordinator::{RunOutcome, RunStatus};
pub use init::{initialize, resume, NewDownload};
pub use pipeline::{start, DownloadHandle, Downloader};
pub use store::StateStore;

pub use rangefetch_shared::{
    partition, Chunk, DownloadError, DownloadResult, ErrorCode, ReportSnapshot, Session,
};
