//! civitai-sync - Main entry point

use anyhow::{Context, Result};
use civitai_sync::config::{self, SyncConfig};
use civitai_sync::{
    FileSystemStorage, HttpCatalogClient, LocalScanner, Reconciler, RunContext, SyncOptions,
    maintenance,
};
use clap::{ArgGroup, Parser};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "civitai-sync")]
#[command(about = "Sync safetensors models with Civitai metadata and preview images", long_about = None)]
#[command(version)]
#[command(group(
    ArgGroup::new("offline")
        .args(["list_not_found", "list_missing_images", "cleanup"])
        .multiple(false)
        .conflicts_with_all(["images", "refresh_metadata", "rehash", "max_age", "rate_limit"])
))]
struct Cli {
    /// Folder to scan recursively for safetensors files
    #[arg(required_unless_present_any = ["save_api_key", "remove_api_key"])]
    folder: Option<PathBuf>,

    /// API key for this run (overrides the config file and CIVITAI_API_KEY)
    #[arg(long)]
    api_key: Option<String>,

    /// Store an API key in the config file and exit
    #[arg(long, value_name = "KEY", conflicts_with = "remove_api_key")]
    save_api_key: Option<String>,

    /// Remove the stored API key and exit
    #[arg(long)]
    remove_api_key: bool,

    /// Also download a preview image for each model
    #[arg(long)]
    images: bool,

    /// Refresh metadata even when the cached copy is fresh
    #[arg(long)]
    refresh_metadata: bool,

    /// Maximum metadata age in days before it is fetched again
    #[arg(long, value_name = "DAYS")]
    max_age: Option<u32>,

    /// Minimum seconds between requests
    #[arg(long, value_name = "SECS")]
    rate_limit: Option<f64>,

    /// Re-hash every file and refresh those whose content changed
    #[arg(long)]
    rehash: bool,

    /// Number of files hashed in parallel
    #[arg(long, value_name = "N")]
    hash_workers: Option<usize>,

    /// List models recorded as not found on Civitai
    #[arg(long)]
    list_not_found: bool,

    /// List models without a preview image
    #[arg(long)]
    list_missing_images: bool,

    /// Delete sidecars and previews whose model file no longer exists
    #[arg(long)]
    cleanup: bool,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (pretty or json)
    #[arg(long, default_value = "pretty", value_parser = ["pretty", "json"])]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
    }

    // Credential store
    if cli.save_api_key.is_some() || cli.remove_api_key {
        let path = cli
            .config
            .clone()
            .or_else(config::default_config_path)
            .context("Cannot determine config file location")?;
        let storage = FileSystemStorage::new();

        if let Some(key) = cli.save_api_key.as_deref() {
            config::save_api_key(&storage, &path, key).await?;
            println!("API key saved to {}", path.display());
        } else if config::remove_api_key(&storage, &path).await? {
            println!("API key removed from {}", path.display());
        } else {
            println!("No API key stored in {}", path.display());
        }
        return Ok(ExitCode::SUCCESS);
    }

    let folder = cli.folder.clone().context("No folder given")?;

    // Offline modes
    if cli.list_not_found || cli.list_missing_images || cli.cleanup {
        let scanner = LocalScanner::new(&folder)?;
        if cli.cleanup {
            let report = maintenance::cleanup_orphans(&scanner)?;
            for path in report.sidecars_removed.iter().chain(&report.previews_removed) {
                println!("removed {}", path.display());
            }
            for error in &report.errors {
                eprintln!("failed: {}", error);
            }
            println!(
                "Removed {} sidecar(s) and {} preview(s)",
                report.sidecars_removed.len(),
                report.previews_removed.len()
            );
            return Ok(if report.errors.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            });
        }

        let (files, label) = if cli.list_not_found {
            (maintenance::list_not_found(&scanner)?, "not found on Civitai")
        } else {
            (maintenance::list_missing_previews(&scanner)?, "without a preview image")
        };
        for file in &files {
            println!("{}", file.path.display());
        }
        println!("{} model(s) {}", files.len(), label);
        return Ok(ExitCode::SUCCESS);
    }

    // Load configuration
    let mut config = SyncConfig::load(cli.config.clone())?;

    // CLI overrides
    if let Some(key) = cli.api_key.clone() {
        config.api_key = Some(key);
    }
    if let Some(delay) = cli.rate_limit {
        config.rate_limit_delay_secs = delay;
    }
    if let Some(days) = cli.max_age {
        config.max_metadata_age_days = days;
    }
    if let Some(workers) = cli.hash_workers {
        config.hash_workers = workers;
    }

    config.validate()?;

    tracing::info!(
        api_base_url = %config.api_base_url,
        authenticated = config.api_key().is_some(),
        rate_limit_secs = config.rate_limit_delay_secs,
        max_age_days = config.max_metadata_age_days,
        "Configuration loaded"
    );

    let catalog = Arc::new(HttpCatalogClient::new(&config)?);
    let options = SyncOptions {
        root: folder,
        max_age_days: config.max_metadata_age_days,
        force_refresh: cli.refresh_metadata,
        download_images: cli.images,
        verify_hashes: cli.rehash,
        hash_workers: config.hash_workers,
    };

    let ctx = RunContext::new();
    let interrupt = ctx.interrupt_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::warn!("Stopping after the current file");
        interrupt.store(true, Ordering::SeqCst);
    });

    let report = Reconciler::new(options, catalog).run(&ctx).await?;
    println!("{}", report);

    Ok(if report.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
