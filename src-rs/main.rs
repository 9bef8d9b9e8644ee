mod automation;
mod chatgpt;
mod clock;
mod config;
mod dispatch;
mod error;
mod files;
mod rate_limit;
mod sanitize;
mod server;
mod tasks;
mod tracker;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rmcp::{transport::stdio, ServiceExt};
use serde_json::json;
use std::io;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::automation::{AutomationExecutor, OsascriptRunner};
use crate::chatgpt::{ChatGptApp, ChatUi};
use crate::clock::{Clock, SystemClock};
use crate::config::BridgeConfig;
use crate::dispatch::{DispatchSettings, ToolDispatcher};
use crate::files::DownloadManager;
use crate::rate_limit::RateLimiter;
use crate::server::ChatGptServer;
use crate::tasks::BackgroundTasks;
use crate::tracker::GenerationTracker;

const SAVE_WAIT: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    name = "chatgpt-mcp",
    version,
    about = "MCP stdio server for the ChatGPT macOS desktop app"
)]
struct Cli {
    /// Directory for downloaded images (overrides CHATGPT_MCP_DOWNLOAD_DIR)
    #[arg(long, global = true)]
    download_dir: Option<PathBuf>,
    /// Verbose logging to stderr
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve MCP requests on stdin/stdout (default)
    Serve,
    /// Print the tool catalogue in JSON
    Tools,
    /// Run one download-directory cleanup sweep and print the report
    Cleanup,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = BridgeConfig::resolve(cli.download_dir, cli.debug);
    init_logging(config.debug);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config),
        Commands::Tools => print_tools(),
        Commands::Cleanup => cleanup_once(&config),
    }
}

/// Logs go to stderr; stdout carries protocol frames only.
fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn print_tools() -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "tools": ChatGptServer::catalogue() }))?
    );
    Ok(())
}

fn cleanup_once(config: &BridgeConfig) -> Result<()> {
    let files = DownloadManager::new(config.download_dir.clone(), config.cleanup.clone(), SAVE_WAIT);
    let report = files
        .cleanup_all()
        .map_err(|err| anyhow::anyhow!(err.public_message()))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn serve(config: BridgeConfig) -> Result<()> {
    if !cfg!(target_os = "macos") {
        warn!("not running on macOS; every automation call will fail");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let tasks = Arc::new(BackgroundTasks::new());
    let limiter = Arc::new(RateLimiter::new(config.rate_limits.clone(), Arc::clone(&clock)));
    let executor = AutomationExecutor::new(
        Arc::new(OsascriptRunner::new(config.script_timeout)),
        config.retry.clone(),
    );
    let ui: Arc<dyn ChatUi> = Arc::new(ChatGptApp::new(
        executor,
        &config.app_name,
        config.ask_timeout,
        config.poll_interval,
    ));
    let files = Arc::new(DownloadManager::new(
        config.download_dir.clone(),
        config.cleanup.clone(),
        SAVE_WAIT,
    ));
    files
        .ensure_directory()
        .map_err(|err| anyhow::anyhow!(err.public_message()))
        .context("download directory is not usable")?;
    let tracker = Arc::new(GenerationTracker::new(
        Arc::clone(&ui),
        Arc::clone(&limiter),
        Arc::clone(&clock),
        config.tracker.clone(),
        Arc::clone(&tasks),
    ));

    install_interrupt_handler(Arc::clone(&files))?;
    let (stop_tx, periodic) = spawn_periodic_cleanup(
        Arc::clone(&files),
        Arc::clone(&tracker),
        config.cleanup_interval,
    )?;

    let dispatcher = ToolDispatcher::new(
        DispatchSettings {
            sync_generation_timeout: config.sync_generation_timeout,
            poll_interval: config.poll_interval,
            opportunistic_cleanup_ratio: config.opportunistic_cleanup_ratio,
            require_new_image_marker: config.tracker.require_new_image_marker,
        },
        ui,
        tracker,
        Arc::clone(&files),
        limiter,
        Arc::clone(&tasks),
    );

    info!(
        download_dir = %files.root().display(),
        "serving MCP on stdio"
    );
    let server = ChatGptServer::new(Arc::new(dispatcher));
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let result = runtime.block_on(async move {
        let service = server
            .serve(stdio())
            .await
            .context("MCP handshake failed")?;
        service.waiting().await.context("MCP service stopped")?;
        info!("stdio closed");
        Ok::<(), anyhow::Error>(())
    });
    runtime.shutdown_timeout(SHUTDOWN_GRACE);

    drop(stop_tx);
    if periodic.join().is_err() {
        warn!("periodic cleanup thread panicked");
    }
    let remaining = tasks.join_all(SHUTDOWN_GRACE);
    info!(remaining, "shutdown complete");
    result
}

fn install_interrupt_handler(files: Arc<DownloadManager>) -> Result<()> {
    ctrlc::set_handler(move || {
        info!("interrupted, running final cleanup");
        if let Err(err) = files.cleanup_all() {
            warn!(error = %err.public_message(), "final cleanup failed");
        }
        std::process::exit(130);
    })
    .context("failed to install Ctrl-C handler")
}

/// Sweeps downloads and tracker state every `interval` until the sender drops.
fn spawn_periodic_cleanup(
    files: Arc<DownloadManager>,
    tracker: Arc<GenerationTracker>,
    interval: Duration,
) -> Result<(mpsc::Sender<()>, thread::JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel::<()>();
    let handle = thread::Builder::new()
        .name("periodic-cleanup".to_string())
        .spawn(move || loop {
            match rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(err) = files.cleanup_all() {
                        warn!(error = %err.public_message(), "periodic cleanup failed");
                    }
                    let report = tracker.cleanup();
                    if report != Default::default() {
                        info!(
                            ?report,
                            active = tracker.active_count(),
                            finished = tracker.finished_count(),
                            "tracker cleanup"
                        );
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        })
        .context("failed to spawn periodic cleanup thread")?;
    Ok((tx, handle))
}
