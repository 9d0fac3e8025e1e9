//! CLI Entry Point for plc-daq
//!
//! Provides command-line interface for:
//! - Running the acquisition service against an S7 controller
//! - Running it against a simulated production line (`--simulate`)
//! - Validating a configuration file
//!
//! # Usage
//!
//! ```bash
//! plc-daq run --config config/plc_daq.toml
//! plc-daq run --config config/plc_daq.toml --simulate
//! plc-daq check-config --config config/plc_daq.toml
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use plc_daq::config::{Settings, StorageBackend};
use plc_daq::logging::{self, LoggingConfig};
use plc_daq::simulator::LineSimulator;
use plc_daq::{
    AcquisitionStats, AddressableLink, EventSink, LinkGuardian, MemorySink, S7Link,
    ShutdownReport, TriggerPoller,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

const DEFAULT_CONFIG: &str = "config/plc_daq.toml";
const SIMULATION_TICK: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "plc-daq")]
#[command(about = "Trigger-driven box and measurement logging from an S7 controller", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the controller until Ctrl+C
    Run {
        /// Configuration file (TOML)
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        /// Use a simulated line instead of a real controller
        #[arg(long)]
        simulate: bool,

        /// Seed for the simulated line
        #[arg(long, default_value_t = 0, requires = "simulate")]
        seed: u64,
    },

    /// Load and validate a configuration file, then exit
    CheckConfig {
        /// Configuration file (TOML)
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            simulate,
            seed,
        } => run(&config, simulate.then_some(seed)).await,
        Commands::CheckConfig { config } => check_config(&config),
    }
}

fn load_settings(path: &Path) -> Result<Settings> {
    Settings::load(path).with_context(|| format!("Invalid configuration in {}", path.display()))
}

fn check_config(path: &Path) -> Result<()> {
    let settings = load_settings(path)?;
    let layout = &settings.layout;
    println!("Configuration OK: {}", path.display());
    println!(
        "  controller:  {}:{} (rack {}, slot {})",
        settings.plc.host, settings.plc.port, settings.plc.rack, settings.plc.slot
    );
    println!(
        "  layout:      DB{}, {} slots, bitmap at {}, data at {} stride {}",
        layout.region,
        layout.slot_count,
        layout.sampling_bitmap_offset,
        layout.data_base,
        layout.data_stride
    );
    println!(
        "  timing:      poll {:?}, sample every {:?} for {:?}",
        settings.timing.poll_interval,
        settings.timing.sampling_interval,
        settings.timing.logging_duration
    );
    println!(
        "  storage:     {} -> {}",
        settings.storage.backend,
        settings.storage.output_dir.display()
    );
    Ok(())
}

fn open_sink(settings: &Settings) -> Result<Arc<dyn EventSink>> {
    match settings.storage.backend()? {
        #[cfg(feature = "storage_csv")]
        StorageBackend::Csv => {
            let sink = plc_daq::sink::CsvSink::open(&settings.storage.output_dir)
                .context("Failed to open CSV logs")?;
            Ok(Arc::new(sink))
        }
        #[cfg(not(feature = "storage_csv"))]
        StorageBackend::Csv => {
            anyhow::bail!("CSV storage requires the 'storage_csv' feature")
        }
        StorageBackend::Memory => Ok(Arc::new(MemorySink::new())),
    }
}

async fn run(config: &Path, simulation_seed: Option<u64>) -> Result<()> {
    let settings = load_settings(config)?;
    logging::init(LoggingConfig::from_settings(&settings)?)?;
    info!(
        name = %settings.application.name,
        config = %config.display(),
        simulate = simulation_seed.is_some(),
        "Acquisition service starting"
    );

    let sink = open_sink(&settings)?;
    let stats = Arc::new(AcquisitionStats::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let report = match simulation_seed {
        Some(seed) => {
            let plc = LineSimulator::plc_for(&settings.layout);
            let simulator = LineSimulator::new(plc.clone(), settings.layout.clone(), seed);
            let line = tokio::spawn(simulator.run(SIMULATION_TICK, shutdown_rx.clone()));
            let report = serve(plc, &settings, sink, stats, shutdown_tx, shutdown_rx).await?;
            line.await.context("Simulator task failed")?;
            report
        }
        None => {
            let link = S7Link::new(settings.plc.clone());
            serve(link, &settings, sink, stats, shutdown_tx, shutdown_rx).await?
        }
    };

    info!(
        cycles = report.cycles,
        tasks_stopped = report.tasks_stopped,
        stats = %report.stats,
        "Acquisition service stopped"
    );
    Ok(())
}

/// Run the poller until Ctrl+C, then drive its shutdown sequence.
async fn serve<L>(
    link: L,
    settings: &Settings,
    sink: Arc<dyn EventSink>,
    stats: Arc<AcquisitionStats>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<ShutdownReport>
where
    L: AddressableLink + 'static,
{
    let guardian = LinkGuardian::new(link, Arc::clone(&stats));
    let poller = TriggerPoller::new(
        settings.layout.clone(),
        settings.timing,
        guardian,
        sink,
        stats,
    );
    let poller = tokio::spawn(poller.run(shutdown_rx));

    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "Failed to listen for Ctrl+C, shutting down");
    }
    info!("Shutdown signal received, stopping sampling tasks");
    // Receivers may already be gone if the poller exited on its own.
    let _ = shutdown_tx.send(true);

    poller.await.context("Poller task failed")
}
