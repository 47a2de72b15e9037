//! Trigger Label Agent CLI
//!
//! Threshold-triggered video retention and pose labeling.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use trigger_label_agent::{
    activity::create_shared_log_with_persistence,
    config::Config,
    core::DetectorStatus,
    receiver::{build_labeler, TriggerReceiver},
    store::MemoryStore,
    VERSION,
};

#[cfg(feature = "server")]
use trigger_label_agent::server::{self, ServerConfig};

#[derive(Parser)]
#[command(name = "trigger-agent")]
#[command(version = VERSION)]
#[command(about = "Threshold-triggered video retention and pose labeling", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true, env = "TRIGGER_AGENT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume the sensor stream and serve the control API until Ctrl+C
    Start {
        /// HTTP port (overrides the config file)
        #[arg(long, env = "TRIGGER_AGENT_PORT")]
        port: Option<u16>,

        /// Collection watched for notifications (overrides the config file)
        #[arg(long, env = "TRIGGER_AGENT_COLLECTION")]
        collection: Option<String>,
    },

    /// Show persisted activity counters
    Status,

    /// Show configuration
    Config,

    /// Label one pose window from the persisted store
    Label {
        /// End of the window, UTC milliseconds
        #[arg(long)]
        timestamp: i64,

        /// Label to store (1, 0 or -1)
        #[arg(long, allow_hyphen_values = true)]
        label: i32,

        /// Window length in seconds (defaults to the detector save time, 0 takes the latest samples)
        #[arg(long)]
        window: Option<f64>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(Config::config_path);

    let result = match cli.command {
        Commands::Start { port, collection } => cmd_start(&config_path, port, collection).await,
        Commands::Status => cmd_status(&config_path),
        Commands::Config => cmd_config(&config_path),
        Commands::Label {
            timestamp,
            label,
            window,
        } => cmd_label(&config_path, timestamp, label, window),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn open_store(config: &Config) -> anyhow::Result<Arc<MemoryStore>> {
    let store = match config.snapshot_path() {
        Some(path) => MemoryStore::load(&path)
            .with_context(|| format!("could not load store snapshot {}", path.display()))?,
        None => MemoryStore::new(),
    };
    Ok(Arc::new(store))
}

fn save_store(config: &Config, store: &MemoryStore) {
    if let Some(path) = config.snapshot_path() {
        if let Err(e) = store.save(&path) {
            eprintln!("Warning: Could not save store snapshot: {e}");
        }
    }
}

async fn cmd_start(config_path: &Path, port: Option<u16>, collection: Option<String>) -> anyhow::Result<()> {
    println!("Trigger Label Agent v{VERSION}");
    println!();

    let mut config = Config::load_from(config_path)?;
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(collection) = collection {
        config.storage.notification_collection = collection;
    }
    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create directories: {e}");
    }

    let activity = create_shared_log_with_persistence(config.activity_path());
    let store = open_store(&config)?;
    let receiver = Arc::new(TriggerReceiver::new(
        config.clone(),
        store.clone(),
        activity.clone(),
    )?);

    println!("  Stream: {}", config.stream.stream_url());
    println!("  Threshold: {}", config.detector.threshold);
    println!("  Save time: {}s", config.detector.save_time.as_secs());
    println!("  Cameras: {}", config.camera.camera_names.join(", "));
    println!(
        "  Auto-tagging: every {} min ({})",
        config.labeling.trigger_interval_minutes,
        if config.labeling.auto_tagging {
            "enabled"
        } else {
            "disabled"
        }
    );

    let outcome = receiver.start().await?;
    println!("  Receiver: {outcome}");

    #[cfg(feature = "server")]
    let shutdown = {
        let (addr, shutdown) = server::run(ServerConfig::new(config.server.port), receiver.clone()).await?;
        println!("  Control API: http://{addr}/api/v1/trigger");
        shutdown
    };

    println!();
    println!("Press Ctrl+C to stop");
    println!();

    tokio::signal::ctrl_c()
        .await
        .context("could not listen for Ctrl+C")?;

    println!();
    println!("Stopping receiver...");
    receiver.shutdown().await;

    #[cfg(feature = "server")]
    let _ = shutdown.send(());

    if let Err(e) = activity.save() {
        eprintln!("Warning: Could not save activity log: {e}");
    }
    save_store(&config, &store);

    println!();
    println!("{}", activity.summary());
    Ok(())
}

fn cmd_status(config_path: &Path) -> anyhow::Result<()> {
    let config = Config::load_from(config_path)?;
    let activity = create_shared_log_with_persistence(config.activity_path());

    println!("Trigger Label Agent Status");
    println!("==========================");
    println!();
    println!("Device: {}", config.stream.device_name);
    println!("Data directory: {:?}", config.data_path);
    println!();
    println!("{}", activity.summary());
    Ok(())
}

fn cmd_config(config_path: &Path) -> anyhow::Result<()> {
    let config = Config::load_from(config_path)?;

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", config_path);
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn cmd_label(config_path: &Path, timestamp: i64, label: i32, window: Option<f64>) -> anyhow::Result<()> {
    let status = DetectorStatus::from_label(label)
        .with_context(|| format!("label must be 1, 0 or -1, got {label}"))?;

    let config = Config::load_from(config_path)?;
    let activity = create_shared_log_with_persistence(config.activity_path());
    let store = open_store(&config)?;
    let labeler = build_labeler(&config, store.clone(), activity.clone())?;

    let window = window.unwrap_or_else(|| config.detector.save_time.as_secs_f64());
    let outcome = labeler.label(status.label(), timestamp, window)?;

    println!(
        "Stored label {} for {} samples ending at {}",
        outcome.label, outcome.samples, outcome.timestamp_ms
    );

    save_store(&config, &store);
    if let Err(e) = activity.save() {
        eprintln!("Warning: Could not save activity log: {e}");
    }
    Ok(())
}
