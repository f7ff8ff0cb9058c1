use capture_monitor::{
    config::MonitorConfig,
    error::CaptureError,
    export::ExportFormat,
    monitor,
    poller::CapturePoller,
    storage::Storage,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "capture-monitor")]
#[command(about = "Capture records written to a shared store and keep a bounded history of them.")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Storage file shared with the producer
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Poll interval in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Maximum number of records kept
    #[arg(long)]
    capacity: Option<usize>,

    /// Storage quota in bytes
    #[arg(long)]
    quota_bytes: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the store and capture new records until interrupted
    Watch {
        /// Location path of the hosting page; monitoring only starts on admin pages
        #[arg(short, long, default_value = "/admin")]
        location: String,
    },
    /// Show record statistics
    Stats,
    /// Export captured records
    Export {
        /// Output format: json or csv
        #[arg(short, long, default_value = "json")]
        format: ExportFormat,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Write a raw value to the watched key, as a producer would
    Push {
        /// Serialized record, e.g. '{"cpf":"123","nome":"Ana"}'
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), CaptureError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let store_path = cli.store.clone().unwrap_or_else(Storage::default_path);

    match cli.command {
        Commands::Watch { location } => watch(&store_path, config, &location).await?,
        Commands::Stats => show_stats(&store_path, config)?,
        Commands::Export { format, output } => export(&store_path, config, format, output)?,
        Commands::Push { value } => push(&store_path, &config, &value)?,
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<MonitorConfig, CaptureError> {
    let mut config = match &cli.config {
        Some(path) => MonitorConfig::from_file(path)?,
        None => MonitorConfig::default(),
    };
    if let Some(ms) = cli.interval_ms {
        config.poll_interval_ms = ms;
    }
    if let Some(capacity) = cli.capacity {
        config.capacity = capacity;
    }
    if cli.quota_bytes.is_some() {
        config.quota_bytes = cli.quota_bytes;
    }
    config.validate()?;
    Ok(config)
}

fn open_storage(path: &Path, config: &MonitorConfig) -> Result<Storage, CaptureError> {
    let storage = Storage::with_path(path)?;
    Ok(match config.quota_bytes {
        Some(quota) => storage.with_quota(quota),
        None => storage,
    })
}

async fn watch(path: &Path, config: MonitorConfig, location: &str) -> Result<(), CaptureError> {
    if !config.should_activate(location) {
        info!("⏸️  Location {} is not an admin page, monitor not started", location);
        return Ok(());
    }

    info!("🚀 Watching {}", path.display());
    let storage = open_storage(path, &config)?;
    let mut poller = CapturePoller::new(storage, config);
    poller.set_notify_hook(|record| match serde_json::to_string(record) {
        Ok(line) => println!("{}", line),
        Err(e) => eprintln!("Failed to print record: {}", e),
    });

    let poller = Arc::new(Mutex::new(poller));
    let handle = monitor::spawn(poller.clone()).await;

    tokio::signal::ctrl_c().await?;
    handle.shutdown();

    let stats = poller.lock().await.get_stats();
    info!("📊 {} records in history", stats.total_consultas);
    Ok(())
}

fn show_stats(path: &Path, config: MonitorConfig) -> Result<(), CaptureError> {
    let poller = CapturePoller::new(open_storage(path, &config)?, config);
    let stats = poller.get_stats();

    println!("📈 Capture statistics");
    println!("{}", "─".repeat(50));
    println!("📋 Records: {}", stats.total_consultas);
    println!("📞 With phone: {}", stats.with_telefone);
    match &stats.last_consulta {
        Some(record) => println!("🎯 Latest: {}", serde_json::to_string_pretty(record)?),
        None => println!("🎯 Latest: none"),
    }
    Ok(())
}

fn export(
    path: &Path,
    config: MonitorConfig,
    format: ExportFormat,
    output: Option<PathBuf>,
) -> Result<(), CaptureError> {
    let poller = CapturePoller::new(open_storage(path, &config)?, config);
    let data = poller.export_data(format);

    match output {
        Some(file) => {
            std::fs::write(&file, data).map_err(|e| CaptureError::FileSystem(e.to_string()))?;
            info!("💾 Exported {} records as {} to {}", poller.history().len(), format, file.display());
        }
        None => println!("{}", data),
    }
    Ok(())
}

fn push(path: &Path, config: &MonitorConfig, value: &str) -> Result<(), CaptureError> {
    let storage = open_storage(path, config)?;
    storage.set_item(&config.watched_key, value)?;
    info!("📤 Wrote {} bytes to {}", value.len(), config.watched_key);
    Ok(())
}
