//! Cooler HUD - CPU telemetry relay binary
//!
//! Streams CPU power, temperature, utilization and frequency to the cooler
//! display once per interval until interrupted.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use cooler_hud::metrics::probe::{poll_expensive, poll_gpu_usage, CommandProbe};
use cooler_hud::{
    HardwareInfo, MetricsSnapshot, MonitorConfig, Pipeline, Scheduler, DEFAULT_INTERVAL_MS,
    DEFAULT_PRODUCT_ID, DEFAULT_VENDOR_ID,
};
use futures_util::StreamExt;
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "cooler_hud")]
#[command(about = "CPU telemetry for USB HID cooler displays")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    long_about = "Samples CPU power, temperature, utilization and frequency and streams them to a cooler's built-in display"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Sampling interval in milliseconds
    #[arg(short, long, default_value_t = DEFAULT_INTERVAL_MS)]
    interval: u64,

    /// Mount point whose disk usage is reported
    #[arg(short, long, default_value = "/")]
    mount: PathBuf,

    /// USB vendor id of the display (hex with 0x prefix, or decimal)
    #[arg(long, value_parser = parse_usb_id, default_value_t = DEFAULT_VENDOR_ID)]
    vendor_id: u16,

    /// USB product id of the display (hex with 0x prefix, or decimal)
    #[arg(long, value_parser = parse_usb_id, default_value_t = DEFAULT_PRODUCT_ID)]
    product_id: u16,

    /// Seconds between GPU/RAM identity queries (0 = startup only)
    #[arg(long, default_value_t = 300)]
    profile_interval: u64,

    /// Seconds between GPU usage samples (0 = disabled)
    #[arg(long, default_value_t = 5)]
    gpu_usage_interval: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream metrics to the display until interrupted (default)
    Run(RunArgs),

    /// Take a single snapshot and exit
    Snapshot(SnapshotArgs),

    /// Show detected hardware and configuration
    Info,
}

#[derive(Args, Default)]
struct RunArgs {
    /// Also print every published snapshot as a JSON line
    #[arg(long)]
    echo: bool,
}

#[derive(Args)]
struct SnapshotArgs {
    /// Output format: json or pretty
    #[arg(short, long, default_value = "pretty")]
    format: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli)?;

    let config = build_config(&cli);
    config.validate().context("invalid configuration")?;

    match &cli.command {
        Some(Commands::Run(args)) => run_command(config, args).await?,
        Some(Commands::Snapshot(args)) => snapshot_command(config, args).await?,
        Some(Commands::Info) => info_command(config).await?,
        None => run_command(config, &RunArgs::default()).await?,
    }

    Ok(())
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let level = if cli.debug {
        Level::DEBUG
    } else if cli.verbose {
        Level::INFO
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install tracing subscriber")?;

    Ok(())
}

fn build_config(cli: &Cli) -> MonitorConfig {
    MonitorConfig::new(cli.vendor_id, cli.product_id)
        .with_interval_ms(cli.interval)
        .with_mount_point(cli.mount.clone())
        .with_profile_interval_secs(cli.profile_interval)
        .with_gpu_usage_interval_secs(cli.gpu_usage_interval)
}

fn parse_usb_id(value: &str) -> Result<u16, String> {
    let trimmed = value.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => trimmed.parse::<u16>(),
    };
    parsed.map_err(|e| format!("invalid USB id '{}': {}", value, e))
}

async fn run_command(config: MonitorConfig, args: &RunArgs) -> anyhow::Result<()> {
    info!(
        "Starting cooler HUD for {:04x}:{:04x}",
        config.vendor_id, config.product_id
    );

    let mut scheduler = Scheduler::new(config).context("failed to build pipeline")?;
    let mut updates = scheduler.stream();
    scheduler.start()?;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    error!("Failed to listen for shutdown signal: {}", err);
                }
                info!("Shutdown requested");
                break;
            }
            Some(snapshot) = updates.next() => {
                if args.echo {
                    println!("{}", serde_json::to_string(&snapshot)?);
                }
            }
        }
    }

    scheduler.stop().await?;
    scheduler.disconnect_device()?;
    Ok(())
}

async fn snapshot_command(config: MonitorConfig, args: &SnapshotArgs) -> anyhow::Result<()> {
    let mut pipeline = Pipeline::from_config(&config)?;
    pipeline.prepare();

    let probe = CommandProbe::new(config.query_timeout());
    let mut hardware = HardwareInfo::default();
    poll_expensive(&probe, &mut hardware).await;
    poll_gpu_usage(&probe, &mut hardware).await;

    // Differential metrics need two samples one interval apart.
    pipeline.run_tick(&hardware);
    tokio::time::sleep(config.interval()).await;
    let snapshot = pipeline.run_tick(&hardware);
    pipeline.device_mut().disconnect();

    match args.format.as_str() {
        "json" => {
            let json = serde_json::to_string_pretty(&snapshot)?;
            println!("{}", json);
        }
        "pretty" => print_pretty_snapshot(&snapshot),
        other => anyhow::bail!("Unsupported format: {}. Use 'json' or 'pretty'", other),
    }

    Ok(())
}

async fn info_command(config: MonitorConfig) -> anyhow::Result<()> {
    println!("Cooler HUD System Information");
    println!("=============================");
    println!();

    let mut pipeline = Pipeline::from_config(&config)?;
    pipeline.prepare();
    let snapshot = pipeline.run_tick(&HardwareInfo::default());

    let probe = CommandProbe::new(config.query_timeout());
    let mut hardware = HardwareInfo::default();
    poll_expensive(&probe, &mut hardware).await;

    println!("Hardware:");
    println!(
        "  CPU: {} ({} cores)",
        snapshot.cpu.model, snapshot.cpu.core_count
    );
    println!(
        "  GPU: {}",
        hardware.gpu_model.as_deref().unwrap_or("not detected")
    );
    if let Some(vram) = hardware.gpu_vram_gb {
        println!("  VRAM: {:.1} GB", vram);
    }
    if let Some(mhz) = hardware.ram_frequency_mhz {
        println!("  RAM speed: {:.0} MHz", mhz);
    }
    println!("  Memory: {:.1} GB total", gib(snapshot.memory.total_bytes));
    println!();

    println!("Display:");
    println!(
        "  Target: {:04x}:{:04x}",
        config.vendor_id, config.product_id
    );
    println!(
        "  Status: {}",
        if pipeline.device().is_connected() {
            "connected"
        } else {
            "not found"
        }
    );
    pipeline.device_mut().disconnect();
    println!();

    println!("Configuration:");
    println!("  Interval: {}ms", config.interval_ms);
    println!("  Disk mount: {}", config.mount_point.display());
    println!("  Identity refresh: {}s", config.profile_interval_secs);
    println!("  GPU usage refresh: {}s", config.gpu_usage_interval_secs);
    println!();

    println!("Features compiled:");
    #[cfg(feature = "hid")]
    println!("  - HID support: ✓");
    #[cfg(not(feature = "hid"))]
    println!("  - HID support: ✗");

    Ok(())
}

fn gib(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0 / 1024.0
}

fn print_pretty_snapshot(snapshot: &MetricsSnapshot) {
    println!(
        "Snapshot ({})",
        chrono::DateTime::from_timestamp_millis(snapshot.timestamp as i64)
            .unwrap_or_default()
            .format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("==========================================");
    println!();

    println!("CPU:");
    println!("  Model: {}", snapshot.cpu.model);
    println!("  Cores: {}", snapshot.cpu.core_count);
    println!("  Usage: {:.1}%", snapshot.cpu.utilization_percent);
    println!("  Frequency: {:.0} MHz", snapshot.cpu.frequency_mhz);
    println!("  Package temperature: {:.1}°C", snapshot.cpu.package_temp_c);
    println!("  Package power: {:.1} W", snapshot.cpu.package_power_w);
    println!();

    println!("Memory:");
    println!(
        "  Used: {:.1} / {:.1} GB ({:.1}%)",
        gib(snapshot.memory.used_bytes),
        gib(snapshot.memory.total_bytes),
        snapshot.memory.usage_percent()
    );
    if snapshot.memory.frequency_mhz > 0.0 {
        println!("  Speed: {:.0} MHz", snapshot.memory.frequency_mhz);
    }
    println!();

    println!("Disk ({}):", snapshot.disk.mount_point);
    println!(
        "  Used: {:.1} / {:.1} GB ({:.1}%)",
        gib(snapshot.disk.used_bytes),
        gib(snapshot.disk.total_bytes),
        snapshot.disk.usage_percent()
    );
    println!();

    println!("Network:");
    println!(
        "  Upload: {:.1} KB/s, Download: {:.1} KB/s",
        snapshot.network.upload_bps / 1024.0,
        snapshot.network.download_bps / 1024.0
    );
    println!(
        "  Totals: {:.1} MB sent, {:.1} MB received",
        snapshot.network.sent_bytes as f64 / 1024.0 / 1024.0,
        snapshot.network.received_bytes as f64 / 1024.0 / 1024.0
    );
    println!();

    println!("GPU:");
    println!("  Model: {}", snapshot.gpu.model);
    if snapshot.gpu.vram_gb > 0.0 {
        println!("  VRAM: {:.1} GB", snapshot.gpu.vram_gb);
    }
    println!("  Usage: {:.1}%", snapshot.gpu.usage_percent);
    println!();

    println!(
        "Display: {}",
        if snapshot.device_connected {
            "connected"
        } else {
            "not connected"
        }
    );
}
