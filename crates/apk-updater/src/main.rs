//! apk-updater CLI entry point

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use apk_updater::download::DownloadStore;
use apk_updater::verify::verify_digest;
use apk_updater::{
    AlwaysOnline, BackgroundDownloadService, CheckResult, DownloadEnqueueResult, DownloadQueue,
    DownloadStatus, Downloader, HttpReleaseSource, JsonDownloadStore, MemoryDownloadStore,
    UpdateAvailable, UpdateCheck, UpdateChecker, UpdaterConfig,
};

/// Check for, download and digest-verify application updates
#[derive(Parser, Debug)]
#[command(name = "apk-updater")]
#[command(version, about = "Check for, download and digest-verify application updates")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(long, global = true, env = "APK_UPDATER_CONFIG")]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ask the release endpoint whether a newer build exists
    Check {
        /// Installed version name
        #[arg(long)]
        current: String,
    },
    /// Check, download the artifact and verify its digest
    Fetch {
        /// Installed version name
        #[arg(long)]
        current: String,

        /// Download directory (overrides the config file)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else if cli.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match run(cli).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => UpdaterConfig::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => UpdaterConfig::default(),
    };

    let source = HttpReleaseSource::new(&config.network)?;
    let checker = UpdateChecker::new(Arc::new(source));

    match cli.command {
        Commands::Check { current } => {
            let update = check(&checker, &current, cli.json).await?;
            if update.is_none() && !cli.json {
                println!("Up to date ({current})");
            }
            Ok(())
        }
        Commands::Fetch { current, dir } => {
            let Some(update) = check(&checker, &current, cli.json).await? else {
                if !cli.json {
                    println!("Up to date ({current}), nothing to fetch");
                }
                return Ok(());
            };
            let path = fetch(&config, dir, &update).await?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({ "verified_path": path, "sha256": update.sha256_hex })
                );
            } else {
                println!("Digest verified: {}", path.display());
                println!("Identity and signer checks run on the device before install.");
            }
            Ok(())
        }
    }
}

async fn check(
    checker: &UpdateChecker,
    current: &str,
    json: bool,
) -> anyhow::Result<Option<UpdateAvailable>> {
    match checker.check_for_update(current).await {
        CheckResult::UpToDate => {
            if json {
                println!("{}", serde_json::json!({ "status": "up_to_date" }));
            }
            Ok(None)
        }
        CheckResult::UpdateAvailable(update) => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({ "status": "update_available", "update": update })
                );
            } else {
                println!(
                    "Update available: {} -> {} ({}, {} bytes)",
                    current, update.latest_version, update.asset_name, update.asset_size_bytes
                );
                if !update.release_notes.is_empty() {
                    println!("\n{}", update.release_notes);
                }
            }
            Ok(Some(update))
        }
        CheckResult::Error(message) => bail!("update check failed: {message}"),
    }
}

async fn fetch(
    config: &UpdaterConfig,
    dir: Option<PathBuf>,
    update: &UpdateAvailable,
) -> anyhow::Result<PathBuf> {
    let service = BackgroundDownloadService::new(&config.network, Arc::new(AlwaysOnline))?;
    let store: Arc<dyn DownloadStore> = match &config.download.store_file {
        Some(file) => Arc::new(JsonDownloadStore::open(file.clone())?),
        None => Arc::new(MemoryDownloadStore::new()),
    };
    let download_dir = dir.unwrap_or_else(|| config.download.download_dir());
    let downloader = Downloader::new(Arc::new(service), store, download_dir)
        .with_notification_title(config.download.notification_title.clone());

    let id = match downloader.enqueue_download(update).await {
        DownloadEnqueueResult::Started {
            download_id,
            local_path,
        } => {
            info!(download_id, path = %local_path.display(), "Download started");
            download_id
        }
        DownloadEnqueueResult::Failed { message } => bail!("download failed: {message}"),
    };

    let path = loop {
        match downloader.download_status(id).await {
            DownloadStatus::InProgress {
                bytes_downloaded,
                total_bytes,
                paused_reason,
            } => {
                let progress = apk_updater::DownloadProgress::new(bytes_downloaded, total_bytes);
                match paused_reason {
                    Some(reason) => info!(%progress, %reason, "Download paused"),
                    None => info!(%progress, "Downloading"),
                }
            }
            DownloadStatus::Succeeded { local_path } => break local_path,
            DownloadStatus::Failed { message } => {
                downloader.release(id);
                bail!("download failed: {message}")
            }
        }
        tokio::time::sleep(config.download.poll_interval()).await;
    };
    downloader.release(id);

    if let Err(e) = verify_digest(&path, &update.sha256_hex).await {
        let _ = tokio::fs::remove_file(&path).await;
        return Err(e).context("verifying downloaded artifact");
    }
    Ok(path)
}
