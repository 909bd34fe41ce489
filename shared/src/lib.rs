/// Shared types for Rangefetch: the chunk/session model, the error
/// taxonomy, and the persisted state-file format.
pub mod errors;
pub mod models;

pub use errors::{DownloadError, DownloadResult, ErrorCode};
pub use models::{partition, Chunk, ReportSnapshot, Session};
