/// Downloader configuration and retry policy.
///
/// The binary reads these from the environment (after `.env` is loaded);
/// library callers build them directly.
use std::path::PathBuf;
use std::time::Duration;

use rangefetch_shared::{DownloadError, DownloadResult};

pub const DEFAULT_SPLIT_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_THREADS: usize = 20;
pub const DEFAULT_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_SAVE_INTERVAL: Duration = Duration::from_secs(1);

/// How a failed chunk is retried within one run.
///
/// The default retries forever with no delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed per chunk in this run. `None` is unlimited.
    pub max_attempts: Option<u32>,
    /// Base of the exponential backoff. Zero disables backoff.
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_backoff(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Whether another attempt is allowed after `failures` failed ones.
    pub fn allows(&self, failures: u32) -> bool {
        self.max_attempts.map_or(true, |max| failures < max)
    }

    /// Delay before the next attempt: `base * 2^(failures - 1)`.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let multiplier = 2_u32.saturating_pow(failures - 1);
        self.backoff_base.saturating_mul(multiplier)
    }
}

/// Settings for initializing and running a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloaderConfig {
    /// Chunk size in bytes.
    pub split_size: u64,
    /// Per-request timeout for new sessions, in seconds.
    pub timeout_secs: u64,
    /// Number of concurrent workers.
    pub threads: usize,
    /// Largest write (and fsync) unit.
    pub buffer_size: usize,
    /// Minimum spacing of ordinary state saves.
    pub save_interval: Duration,
    pub retry: RetryPolicy,
    /// Ignore `HTTP_PROXY` and friends.
    pub no_proxy: bool,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            split_size: DEFAULT_SPLIT_SIZE,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            threads: DEFAULT_THREADS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            save_interval: DEFAULT_SAVE_INTERVAL,
            retry: RetryPolicy::default(),
            no_proxy: false,
        }
    }
}

impl DownloaderConfig {
    pub fn with_split_size(mut self, split_size: u64) -> Self {
        self.split_size = split_size;
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_save_interval(mut self, interval: Duration) -> Self {
        self.save_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_no_proxy(mut self, no_proxy: bool) -> Self {
        self.no_proxy = no_proxy;
        self
    }

    pub fn validate(&self) -> DownloadResult<()> {
        if self.split_size == 0 {
            return Err(DownloadError::InvalidConfig("split size must be > 0".into()));
        }
        if self.timeout_secs == 0 {
            return Err(DownloadError::InvalidConfig("timeout must be > 0".into()));
        }
        if self.threads == 0 {
            return Err(DownloadError::InvalidConfig("thread count must be > 0".into()));
        }
        if self.buffer_size == 0 {
            return Err(DownloadError::InvalidConfig("buffer size must be > 0".into()));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(DownloadError::InvalidConfig("max attempts must be > 0".into()));
        }
        Ok(())
    }
}

/// What the binary should do, read from `RANGEFETCH_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub url: Option<String>,
    pub output: Option<String>,
    pub state_path: PathBuf,
    pub resume: bool,
    pub poll_interval: Duration,
    pub downloader: DownloaderConfig,
}

impl RunConfig {
    pub fn from_env() -> DownloadResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (the environment, or a map in tests).
    pub fn from_lookup<F>(lookup: F) -> DownloadResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup("RANGEFETCH_URL").filter(|s| !s.is_empty());
        let output = lookup("RANGEFETCH_OUTPUT").filter(|s| !s.is_empty());
        let resume = parse_bool(&lookup, "RANGEFETCH_RESUME")?;

        let state_path = match lookup("RANGEFETCH_STATE").filter(|s| !s.is_empty()) {
            Some(path) => PathBuf::from(path),
            None => match &output {
                Some(output) => PathBuf::from(format!("{}.cfg", output)),
                None => {
                    return Err(DownloadError::InvalidConfig(
                        "RANGEFETCH_STATE or RANGEFETCH_OUTPUT must be set".into(),
                    ))
                }
            },
        };

        if !resume && (url.is_none() || output.is_none()) {
            return Err(DownloadError::InvalidConfig(
                "RANGEFETCH_URL and RANGEFETCH_OUTPUT are required unless RANGEFETCH_RESUME is set"
                    .into(),
            ));
        }

        let split_kb: u64 = parse_num(&lookup, "RANGEFETCH_SPLIT_KB", 1024)?;
        let max_attempts: u32 = parse_num(&lookup, "RANGEFETCH_MAX_ATTEMPTS", 0)?;
        let backoff_ms: u64 = parse_num(&lookup, "RANGEFETCH_BACKOFF_MS", 0)?;

        let mut retry = RetryPolicy::unlimited().with_backoff(Duration::from_millis(backoff_ms));
        if max_attempts > 0 {
            retry = retry.with_max_attempts(max_attempts);
        }

        let downloader = DownloaderConfig::default()
            .with_split_size(split_kb.saturating_mul(1024))
            .with_timeout_secs(parse_num(&lookup, "RANGEFETCH_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?)
            .with_threads(parse_num(&lookup, "RANGEFETCH_THREADS", DEFAULT_THREADS)?)
            .with_retry(retry)
            .with_no_proxy(parse_bool(&lookup, "RANGEFETCH_NO_PROXY")?);
        downloader.validate()?;

        let poll_secs: u64 = parse_num(&lookup, "RANGEFETCH_POLL_SECS", 1)?;
        if poll_secs == 0 {
            return Err(DownloadError::InvalidConfig("poll interval must be > 0".into()));
        }

        Ok(Self {
            url,
            output,
            state_path,
            resume,
            poll_interval: Duration::from_secs(poll_secs),
            downloader,
        })
    }
}

fn parse_num<F, T>(lookup: &F, key: &str, default: T) -> DownloadResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| DownloadError::InvalidConfig(format!("{} is not a number: {:?}", key, raw))),
        _ => Ok(default),
    }
}

fn parse_bool<F>(lookup: &F, key: &str) -> DownloadResult<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|s| s.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(s) => match s.as_str() {
            "" | "0" | "false" | "no" => Ok(false),
            "1" | "true" | "yes" => Ok(true),
            _ => Err(DownloadError::InvalidConfig(format!("{} is not a boolean: {:?}", key, s))),
        },
    }
}
