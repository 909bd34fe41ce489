/// Persistent state store.
///
/// Ordinary saves are throttled to one per interval; forced saves always
/// write. Each write goes to a sibling temp file which is fsynced and then
/// renamed over the state file, so a crash mid-save leaves the previous
/// state intact.
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use rangefetch_shared::{DownloadError, DownloadResult, Session};

use crate::config::DEFAULT_SAVE_INTERVAL;

#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    min_interval: Duration,
    last_save: Option<Instant>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            min_interval: DEFAULT_SAVE_INTERVAL,
            last_save: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and validate a saved session.
    pub async fn load(path: impl AsRef<Path>) -> DownloadResult<Session> {
        let data = fs::read(path.as_ref()).await.map_err(DownloadError::IoOpen)?;
        Session::from_json(&data)
    }

    /// Write `session` unless throttled. Returns whether a write happened.
    pub async fn save(&mut self, session: &Session, force: bool) -> DownloadResult<bool> {
        if !force {
            if let Some(last) = self.last_save {
                if last.elapsed() < self.min_interval {
                    return Ok(false);
                }
            }
        }

        let data = session.to_json()?;
        let tmp = self.tmp_path();
        if let Err(e) = self.replace_with(&tmp, &data).await {
            if let Err(cleanup) = fs::remove_file(&tmp).await {
                if cleanup.kind() != ErrorKind::NotFound {
                    warn!("Failed to remove {:?}: {}", tmp, cleanup);
                }
            }
            return Err(e);
        }
        self.sync_parent().await?;

        self.last_save = Some(Instant::now());
        debug!("State saved to {:?} ({} bytes, force={})", self.path, data.len(), force);
        Ok(true)
    }

    async fn replace_with(&self, tmp: &Path, data: &[u8]) -> DownloadResult<()> {
        let mut file = File::create(tmp).await.map_err(DownloadError::IoOpen)?;
        file.write_all(data).await.map_err(DownloadError::IoWrite)?;
        file.flush().await.map_err(DownloadError::IoWrite)?;
        file.sync_all().await.map_err(DownloadError::IoSync)?;
        drop(file);
        fs::rename(tmp, &self.path).await.map_err(DownloadError::IoWrite)
    }

    /// Make the rename itself durable.
    #[cfg(unix)]
    async fn sync_parent(&self) -> DownloadResult<()> {
        let parent = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let dir = File::open(parent).await.map_err(DownloadError::IoOpen)?;
        dir.sync_all().await.map_err(DownloadError::IoSync)
    }

    // Directory handles cannot be fsynced here.
    #[cfg(not(unix))]
    async fn sync_parent(&self) -> DownloadResult<()> {
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name: OsString = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}
