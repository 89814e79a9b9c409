use anyhow::Context;
use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use media_dl::config::AppConfig;
use media_dl::database::repositories::SqlxTaskRepository;
use media_dl::database::{self};
use media_dl::domain::{DownloadSpec, MediaType};
use media_dl::downloader::HlsPlaylistResolver;
use media_dl::downloader::engine::HttpTransport;
use media_dl::logging::init_logging;
use media_dl::scheduler::{TaskEvent, TaskManager};
use media_dl::security::UrlSafetyPolicy;

const RATE_LIMIT_SWEEP: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URLs to download
    #[arg(required = true)]
    urls: Vec<String>,

    /// Treat the URLs as HLS playlists
    #[arg(long)]
    hls: bool,

    /// Directory to save into (defaults to MEDIA_DL_DOWNLOAD_DIR)
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Scheduling priority, higher runs first
    #[arg(short, long, default_value_t = 0)]
    priority: i32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = AppConfig::from_env().context("Failed to load configuration")?;

    let (logging, _guard) = init_logging(&config.log_dir).context("Failed to initialize logging")?;
    let shutdown = CancellationToken::new();
    logging.start_retention_cleanup(shutdown.child_token());

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;
    let repo = Arc::new(SqlxTaskRepository::new(pool));

    let policy = Arc::new(UrlSafetyPolicy::new(config.url_safety.clone())?);
    if let Some(limiter) = policy.rate_limiter() {
        limiter.spawn_sweeper(RATE_LIMIT_SWEEP, shutdown.child_token());
    }
    let transport = Arc::new(HttpTransport::new(&config.http, policy.clone())?);
    let manager = TaskManager::new(
        config.manager.clone(),
        repo,
        policy,
        transport,
        Arc::new(HlsPlaylistResolver::new()),
    )?;

    let mut events = manager.subscribe();
    let report = manager.init().await?;
    if !report.is_empty() {
        info!(
            requeued = report.requeued.len(),
            interrupted = report.interrupted.len(),
            "Recovered previous session"
        );
    }

    let media_type = if args.hls { MediaType::Hls } else { MediaType::File };
    let mut pending = HashSet::new();
    for url in args.urls {
        let mut spec = DownloadSpec::new(url, media_type).with_priority(args.priority);
        if let Some(dir) = &args.dir {
            spec = spec.with_save_dir(dir);
        }
        let id = manager.start(spec).await?;
        if let Some(task) = manager.get(&id).await?
            && !task.is_terminal()
        {
            pending.insert(id);
        }
    }

    while !pending.is_empty() {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping downloads");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event, &mut pending),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    manager.shutdown().await?;
    shutdown.cancel();
    info!("media-dl finished");
    Ok(())
}

fn log_event(event: &TaskEvent, pending: &mut HashSet<String>) {
    match event {
        TaskEvent::Progress { task_id, progress } => {
            info!(
                task_id = %task_id,
                percent = %format_args!("{:.1}", progress.percent),
                bytes = progress.downloaded_bytes,
                speed_bps = progress.speed_bps,
                "Progress"
            );
        }
        TaskEvent::Completed { task_id, task } => {
            let path = task
                .output_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            info!(task_id = %task_id, path = %path, "Download complete");
            pending.remove(task_id);
        }
        TaskEvent::Error { task_id, error } => {
            error!(task_id = %task_id, code = %error.code, "{}", error.message);
            pending.remove(task_id);
        }
        TaskEvent::Canceled { task_id } | TaskEvent::Removed { task_id } => {
            pending.remove(task_id);
        }
        other => info!(task_id = %other.task_id(), event = other.name(), "Task event"),
    }
}
