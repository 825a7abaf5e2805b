// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Vision Coordinator — machine-triggered camera recording, preview
//! streaming and archive indexing.
//!
//! Usage:
//!   coordinator run         --config config.json
//!   coordinator status      --config config.json
//!   coordinator reindex     --config config.json [--camera camera1] [--dry-run]
//!   coordinator verify      --config config.json
//!   coordinator check-time  --config config.json

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use coordinator::api;
use coordinator::auto_record::AutoRecordController;
use coordinator::bus::{BusClient, SimulatedBroker};
use coordinator::camera_manager::CameraManager;
use coordinator::clock::Clock;
use coordinator::config::Config;
use coordinator::device::{DeviceAdapter, SimulatedDeviceAdapter};
use coordinator::events::EventBus;
use coordinator::state::StateStore;
use coordinator::storage::index::StorageIndex;

#[derive(Parser)]
#[command(name = "coordinator", about = "Industrial vision-capture coordinator", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the coordinator: bus client, camera manager, auto-record
    /// controller and the HTTP control plane.
    Run {
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,
    },
    /// Print a brief status snapshot and exit.
    Status {
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,
    },
    /// Fold disk-only recordings (status "unknown") into the storage index.
    Reindex {
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,
        /// Only process files for this camera.
        #[arg(long)]
        camera: Option<String>,
        /// Show what would change without writing the index.
        #[arg(long)]
        dry_run: bool,
    },
    /// Reconcile the storage index against the filesystem: drop entries
    /// whose files are gone, report orphan files with no index entry.
    Verify {
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,
    },
    /// Report the configured timezone offset and current wall-clock time.
    CheckTime {
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let exit_code = match cli.command {
        Command::Run { config } => run(config).await,
        Command::Status { config } => run_status(config),
        Command::Reindex { config, camera, dry_run } => run_reindex(config, camera, dry_run),
        Command::Verify { config } => run_verify(config),
        Command::CheckTime { config } => run_check_time(config),
    };
    std::process::exit(exit_code);
}

fn load_config(path: &PathBuf) -> Option<Config> {
    match Config::from_file(path) {
        Ok(c) => Some(c),
        Err(e) => {
            error!(error = %e, path = %path.display(), "failed to load config");
            None
        }
    }
}

async fn run(config_path: PathBuf) -> i32 {
    let Some(cfg) = load_config(&config_path) else {
        return 1;
    };

    info!(
        cameras = cfg.cameras.len(),
        base_path = ?cfg.storage.base_path,
        api_port = cfg.system.api_port,
        "starting coordinator"
    );

    let clock = Arc::new(Clock::new(&cfg.system.timezone));
    let state_store = Arc::new(StateStore::new());
    let events = Arc::new(EventBus::new());

    let index = match StorageIndex::open(cfg.storage.clone()) {
        Ok(index) => Arc::new(index),
        Err(e) => {
            error!(error = %e, "failed to open storage index");
            return 1;
        }
    };

    let adapter: Arc<dyn DeviceAdapter> =
        Arc::new(SimulatedDeviceAdapter::new(cfg.cameras.len()));

    let cameras = match CameraManager::new(
        &cfg,
        adapter,
        state_store.clone(),
        events.clone(),
        index.clone(),
        clock.clone(),
    ) {
        Ok(cameras) => cameras,
        Err(e) => {
            error!(error = %e, "failed to start camera manager");
            return 1;
        }
    };
    cameras.subscribe(&events);

    let auto_record = AutoRecordController::new(
        &cfg,
        cameras.clone(),
        state_store.clone(),
        events.clone(),
        clock.clone(),
    );
    let auto_record_handle = auto_record.spawn();

    let broker: Arc<dyn coordinator::bus::BusTransport> = Arc::new(SimulatedBroker::new());
    let bus_client = Arc::new(BusClient::new(broker, &cfg.bus));
    let bus_handle = bus_client.clone().spawn(state_store.clone(), events.clone(), clock.clone());
    state_store.mark_started();

    let app_state = Arc::new(api::AppState::new(
        state_store.clone(),
        events.clone(),
        cameras.clone(),
        auto_record.clone(),
        index.clone(),
        clock.clone(),
        bus_client.clone(),
    ));
    api::install_event_forwarder(&app_state, tokio::runtime::Handle::current());

    let server_handle = if cfg.system.enable_api {
        let host = cfg.system.api_host.clone();
        let port = cfg.system.api_port;
        let app_state = app_state.clone();
        Some(tokio::spawn(async move {
            api::start_server(app_state, &host, port).await;
        }))
    } else {
        None
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received CTRL+C, shutting down"),
        Err(e) => error!(error = %e, "signal error"),
    }

    if let Some(handle) = server_handle {
        handle.abort();
    }
    auto_record_handle.abort();
    bus_client.shutdown();
    let _ = tokio::time::timeout(std::time::Duration::from_secs(2), bus_handle).await;

    0
}

fn run_status(config_path: PathBuf) -> i32 {
    let Some(cfg) = load_config(&config_path) else {
        return 1;
    };

    let index = match StorageIndex::open(cfg.storage.clone()) {
        Ok(index) => index,
        Err(e) => {
            eprintln!("Error opening storage index: {e}");
            return 1;
        }
    };
    let stats = index.statistics();

    println!("=== Coordinator Status ===");
    println!("Base path     : {}", cfg.storage.base_path.display());
    println!("Cameras       : {}", cfg.cameras.len());
    println!("Indexed files : {}", stats.file_count);
    println!("Total bytes   : {}", stats.total_bytes);
    for camera in &cfg.cameras {
        let rollup = stats.per_camera.get(&camera.name);
        let (count, bytes) = rollup.map(|r| (r.file_count, r.total_bytes)).unwrap_or((0, 0));
        println!(
            "  {} (topic {}): {} files, {} bytes",
            camera.name, camera.machine_topic, count, bytes
        );
    }
    0
}

fn run_reindex(config_path: PathBuf, camera: Option<String>, dry_run: bool) -> i32 {
    let Some(cfg) = load_config(&config_path) else {
        return 1;
    };
    let index = match StorageIndex::open(cfg.storage.clone()) {
        Ok(index) => index,
        Err(e) => {
            eprintln!("Error opening storage index: {e}");
            return 1;
        }
    };

    match index.reindex_unknown(camera.as_deref(), dry_run) {
        Ok(count) => {
            if dry_run {
                println!("{count} file(s) would be reindexed to 'completed'");
            } else {
                println!("{count} file(s) reindexed to 'completed'");
            }
            0
        }
        Err(e) => {
            eprintln!("Reindex failed: {e}");
            1
        }
    }
}

fn run_verify(config_path: PathBuf) -> i32 {
    let Some(cfg) = load_config(&config_path) else {
        return 1;
    };
    let index = match StorageIndex::open(cfg.storage.clone()) {
        Ok(index) => index,
        Err(e) => {
            eprintln!("Error opening storage index: {e}");
            return 1;
        }
    };

    match index.verify_integrity() {
        Ok(report) => {
            println!("Missing files removed : {}", report.missing_files_removed);
            println!("Orphan files found    : {}", report.orphan_files_found.len());
            for path in &report.orphan_files_found {
                println!("  {}", path.display());
            }
            0
        }
        Err(e) => {
            eprintln!("Integrity check failed: {e}");
            1
        }
    }
}

fn run_check_time(config_path: PathBuf) -> i32 {
    let Some(cfg) = load_config(&config_path) else {
        return 1;
    };
    let clock = Clock::new(&cfg.system.timezone);
    println!("Configured timezone : {}", cfg.system.timezone);
    println!("Resolved offset     : {}", clock.offset());
    println!("Current time        : {}", clock.format_iso());
    if cfg.system.timezone.trim() != "UTC" && clock.offset().local_minus_utc() == 0 {
        warn!(
            timezone = %cfg.system.timezone,
            "configured timezone was not recognized and fell back to UTC"
        );
    }
    0
}
