/// Session setup: probing and preallocating a new download, or loading a
/// saved one.
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tracing::info;

use rangefetch_shared::{DownloadError, DownloadResult, ReportSnapshot, Session};

use crate::client;
use crate::config::DownloaderConfig;
use crate::store::StateStore;

/// What to download and where.
#[derive(Debug, Clone)]
pub struct NewDownload {
    pub url: String,
    /// Destination file.
    pub output: String,
    pub state_path: PathBuf,
    pub headers: HashMap<String, String>,
}

impl NewDownload {
    pub fn new(url: impl Into<String>, output: impl Into<String>, state_path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            output: output.into(),
            state_path: state_path.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Probe the remote length, partition it, preallocate the output, and write
/// the first state file.
pub async fn initialize(
    request: &NewDownload,
    config: &DownloaderConfig,
) -> DownloadResult<(Session, StateStore)> {
    config.validate()?;

    let url = client::parse_url(&request.url)?;
    let http = client::build_client(config.timeout_secs, config.no_proxy)?;
    let length = client::probe_length(&http, url, &request.headers).await?;

    let session = Session::new(
        request.output.clone(),
        request.url.clone(),
        request.headers.clone(),
        length,
        config.timeout_secs,
        config.split_size,
    )?;

    preallocate(Path::new(&session.name), length).await?;

    let mut store = StateStore::new(&request.state_path).with_interval(config.save_interval);
    store.save(&session, true).await?;

    info!(
        "Initialized {} -> {} ({} bytes, {} chunks)",
        session.url,
        session.name,
        length,
        session.chunks.len()
    );
    Ok((session, store))
}

/// Load a saved session and check its output file is still there.
pub async fn resume(
    state_path: impl AsRef<Path>,
    config: &DownloaderConfig,
) -> DownloadResult<(Session, StateStore)> {
    config.validate()?;

    let state_path = state_path.as_ref();
    let session = StateStore::load(state_path).await?;
    tokio::fs::metadata(&session.name)
        .await
        .map_err(DownloadError::IoOpen)?;

    let snapshot = ReportSnapshot::from_session(&session);
    info!(
        "Loaded {:?}: {} ({}/{} chunks done)",
        state_path, snapshot, snapshot.done_count, snapshot.task_count
    );

    let store = StateStore::new(state_path).with_interval(config.save_interval);
    Ok((session, store))
}

/// Size the output file to `length` and make that durable.
async fn preallocate(path: &Path, length: u64) -> DownloadResult<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await
        .map_err(DownloadError::IoOpen)?;
    file.set_len(length).await.map_err(DownloadError::IoWrite)?;
    file.sync_all().await.map_err(DownloadError::IoSync)?;
    Ok(())
}
