/// Rangefetch command-line entry point.
///
/// Configuration comes from `RANGEFETCH_*` environment variables (a `.env`
/// file is loaded first). Prints a `[report]` line every poll interval until
/// the download finishes; Ctrl-C cancels and leaves a resumable state file.
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tracing::{error, info, warn};

use rangefetch::{Downloader, NewDownload, ReportSnapshot, RunConfig, RunStatus};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rangefetch=info")),
        )
        .init();

    let config = RunConfig::from_env().context("invalid configuration")?;
    let downloader = Downloader::new(config.downloader.clone());

    let handle = if config.resume {
        info!("Resuming from {:?}", config.state_path);
        downloader
            .resume(&config.state_path)
            .await
            .with_context(|| format!("failed to resume from {:?}", config.state_path))?
    } else {
        // from_env guarantees both are present when not resuming
        let (Some(url), Some(output)) = (config.url.clone(), config.output.clone()) else {
            bail!("RANGEFETCH_URL and RANGEFETCH_OUTPUT must be set");
        };
        let request = NewDownload::new(url, output, config.state_path.clone());
        downloader
            .create(&request)
            .await
            .context("failed to start download")?
    };

    let cancel = handle.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; saving progress");
            cancel.cancel();
        }
    });

    let mut ticker = tokio::time::interval(config.poll_interval);
    let mut last = handle.report();
    let mut last_at = Instant::now();
    loop {
        ticker.tick().await;
        let now = handle.report();
        let speed = speed_kbps(&last, &now, last_at.elapsed().as_secs_f64());
        println!("[report] {} speed: {:.2}KB/s", now, speed);
        last = now;
        last_at = Instant::now();
        if now.is_finished() || handle.cancel_token().is_cancelled() {
            break;
        }
    }

    let outcome = handle.wait().await?;
    println!(
        "[result] {}",
        serde_json::to_string(&outcome.snapshot).context("failed to encode result")?
    );

    match outcome.status {
        RunStatus::Completed => {
            info!("Download complete");
            Ok(())
        }
        RunStatus::Cancelled => {
            info!("Cancelled; resume with RANGEFETCH_RESUME=1");
            Ok(())
        }
        RunStatus::Failed { chunks } => {
            error!("Chunks {:?} failed", chunks);
            bail!("{} chunk(s) failed; state kept at {:?}", chunks.len(), config.state_path)
        }
    }
}

fn speed_kbps(last: &ReportSnapshot, now: &ReportSnapshot, secs: f64) -> f64 {
    if secs <= 0.0 {
        return 0.0;
    }
    now.completed_size.saturating_sub(last.completed_size) as f64 / 1024.0 / secs
}
