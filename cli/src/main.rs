// epdlink: desktop CLI for BLE electronic paper displays
//
// Cross-platform (macOS, Linux, Windows) front end over epdlink-core: scan for
// panels, push images, upgrade firmware, read status, and drive the LEDs. The
// `simulate` command runs the same task flow against an in-process device.

mod btle;
mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use epdlink_core::image::{adjust, codec, dither_for_panel, Adjustment, Bitmap, PanelType, Rgb};
use epdlink_core::transport::ble::ScanReport;
use epdlink_core::{
    build_image_frame, BlePlatform, DeviceAddress, ImageTask, LedState, ManagerHandle,
    ScanListener, SimDevice, SimulatedPeripheral, Task, TaskError, TaskHandler,
    TaskHandlerCallback, TaskOptions,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "epdlink")]
#[command(about = "EPD Link: BLE electronic paper display tool", long_about = None)]
#[command(version)]
struct Cli {
    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List supported panels
    Panels,
    /// Encode a PPM image into a wire frame
    Encode {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[command(flatten)]
        image: ImageArgs,
    },
    /// Run a task against a simulated device
    Simulate {
        /// Image to push; a test pattern when omitted
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[command(flatten)]
        image: ImageArgs,
        /// Transfers that lose the link before completing
        #[arg(long, default_value = "0")]
        drops: u32,
        /// Status byte the device reports after the last block
        #[arg(long, default_value = "0")]
        status: u8,
        /// Run a firmware upgrade instead of an image push
        #[arg(long)]
        firmware: bool,
    },
    /// Scan for nearby panels
    Scan {
        /// Scan duration in seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// Push an image to a panel
    Push {
        address: String,
        #[arg(short, long)]
        input: PathBuf,
        #[command(flatten)]
        image: ImageArgs,
    },
    /// Upgrade panel firmware
    Firmware {
        address: String,
        #[arg(short, long)]
        package: PathBuf,
        /// Version the package carries; defaults to the file name
        #[arg(long)]
        version: Option<String>,
    },
    /// Read firmware version and LED state
    Status { address: String },
    /// Set the three LEDs
    Led {
        address: String,
        led1: Switch,
        led2: Switch,
        led3: Switch,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args)]
struct ImageArgs {
    /// Panel model (EPD-250, EPD-252, EPD-353); config default when omitted
    #[arg(long)]
    panel: Option<PanelType>,
    /// 1-based page to store the image in
    #[arg(long, default_value = "1")]
    page: u16,
    /// Store the image without refreshing the screen
    #[arg(long)]
    no_refresh: bool,
    /// Dither to the panel palette before encoding
    #[arg(long)]
    dither: bool,
    #[arg(long, default_value = "1.0")]
    saturation: f64,
    #[arg(long, default_value = "1.0")]
    brightness: f64,
    #[arg(long, default_value = "1.0")]
    contrast: f64,
}

impl ImageArgs {
    fn panel(&self, config: &config::Config) -> PanelType {
        self.panel.unwrap_or(config.default_panel)
    }

    fn adjustment(&self) -> Adjustment {
        Adjustment {
            saturation: self.saturation,
            brightness: self.brightness,
            contrast: self.contrast,
        }
    }

    fn task(&self, panel: PanelType, bitmap: Bitmap) -> ImageTask {
        ImageTask {
            page: self.page,
            refresh: !self.no_refresh,
            dither: self.dither,
            adjustment: self.adjustment(),
            ..ImageTask::new(panel, bitmap)
        }
    }
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Switch {
    On,
    Off,
}

impl Switch {
    fn is_on(self) -> bool {
        matches!(self, Switch::On)
    }
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    /// Show the config file location
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;
    let _log_guard = init_logging(&config, cli.json);

    match cli.command {
        Commands::Panels => cmd_panels(),
        Commands::Encode {
            input,
            output,
            image,
        } => cmd_encode(&config, input, output, image),
        Commands::Simulate {
            input,
            image,
            drops,
            status,
            firmware,
        } => cmd_simulate(&config, input, image, drops, status, firmware).await,
        Commands::Scan { duration } => cmd_scan(&config, duration).await,
        Commands::Push {
            address,
            input,
            image,
        } => cmd_push(&config, address, input, image).await,
        Commands::Firmware {
            address,
            package,
            version,
        } => cmd_firmware(&config, address, package, version).await,
        Commands::Status { address } => cmd_status(&config, address).await,
        Commands::Led {
            address,
            led1,
            led2,
            led3,
        } => cmd_led(&config, address, LedState::new(led1.is_on(), led2.is_on(), led3.is_on())).await,
        Commands::Config { action } => cmd_config(config, action),
    }
}

/// Stderr logging filtered by RUST_LOG (default "warn"), plus a daily rolling
/// file when `log_dir` is configured. The guard flushes the file on drop.
fn init_logging(config: &config::Config, json: bool) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "epdlink.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    if json || config.log_json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    guard
}

fn cmd_panels() -> Result<()> {
    println!("{}", "Supported Panels".bold());
    for panel in PanelType::ALL {
        println!(
            "  • {} {:?}, {} bytes per image",
            panel.to_string().bright_cyan(),
            panel.color_model(),
            panel.encoded_len()
        );
    }
    Ok(())
}

fn cmd_encode(
    config: &config::Config,
    input: PathBuf,
    output: PathBuf,
    image: ImageArgs,
) -> Result<()> {
    let panel = image.panel(config);
    let mut bitmap = load_bitmap(&input)?;
    codec::validate(panel, &bitmap)?;

    let adjustment = image.adjustment();
    if !adjustment.is_identity() {
        adjust(&mut bitmap, adjustment);
    }
    if image.dither {
        dither_for_panel(&mut bitmap, panel);
    }
    let frame = build_image_frame(panel, &bitmap, image.page, !image.no_refresh)?;
    std::fs::write(&output, frame.as_bytes())
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!("{} Encoded for {}", "✓".green(), panel.to_string().bright_cyan());
    println!("  Frame:  {} bytes", frame.len());
    println!("  Blocks: {}", frame.total_blocks());
    println!("  CRC:    {:#06x}", frame.crc());
    println!("  Output: {}", output.display().to_string().bright_cyan());
    Ok(())
}

async fn cmd_simulate(
    config: &config::Config,
    input: Option<PathBuf>,
    image: ImageArgs,
    drops: u32,
    status: u8,
    firmware: bool,
) -> Result<()> {
    let panel = image.panel(config);
    let address = DeviceAddress::from("5A:5A:5A:00:00:01");

    let mut device = SimDevice::new(format!("Advantech_{}", panel.name()));
    device.transfer_drops = drops;
    device.status = Some(status);
    let sim = Arc::new(SimulatedPeripheral::new());
    sim.add_device(address.clone(), device);

    let task = if firmware {
        Task::FirmwareUpgrade {
            package: (0..4_096u32).map(|i| (i % 251) as u8).collect(),
            version: "2.0.0".to_string(),
        }
    } else {
        let bitmap = match input {
            Some(path) => load_bitmap(&path)?,
            None => test_pattern(panel),
        };
        codec::validate(panel, &bitmap)?;
        Task::PushImage(image.task(panel, bitmap))
    };

    println!(
        "{} Simulated {} at {}",
        "→".bright_blue(),
        panel.to_string().bright_cyan(),
        address
    );
    let manager = ManagerHandle::spawn(sim.clone(), config.epd.clone())?;
    let result = run_task(&manager, address.clone(), task, task_options(config)).await;
    manager.shutdown().await?;
    result?;

    if let Some(version) = sim.firmware_version(&address) {
        println!("  Device firmware: {}", version.bright_cyan());
    }
    if let Some(frame) = sim.last_frame(&address) {
        println!("  Last frame:      {} bytes", frame.len());
    }
    Ok(())
}

async fn cmd_scan(config: &config::Config, duration: Option<u64>) -> Result<()> {
    let manager = spawn_ble_manager(config).await?;
    let listener = Arc::new(ScanPrinter::default());
    let (stopped_tx, mut stopped_rx) = mpsc::unbounded_channel();
    *listener.stopped.lock() = Some(stopped_tx);
    manager.add_scan_listener(listener.clone()).await?;

    let duration = duration.map(Duration::from_secs);
    println!("{}", "Scanning for panels...".bold());
    manager.start_scan(duration).await?;

    tokio::select! {
        _ = stopped_rx.recv() => {}
        _ = tokio::signal::ctrl_c() => {
            manager.stop_scan().await?;
        }
    }

    let seen = listener.seen.lock().clone();
    println!();
    if seen.is_empty() {
        println!("No panels found.");
    } else {
        println!("{}", format!("Found {} panel(s)", seen.len()).bold());
        for report in seen.values() {
            let panel = report
                .panel
                .map(|p| p.name().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let alarm = if report.alarm {
                " ALARM".bright_red().bold().to_string()
            } else {
                String::new()
            };
            println!(
                "  • {} {} {} dBm (~{:.1} m){}",
                report.address.to_string().bright_cyan(),
                panel,
                report.rssi,
                report.estimate_distance(),
                alarm
            );
        }
    }
    manager.shutdown().await?;
    Ok(())
}

async fn cmd_push(
    config: &config::Config,
    address: String,
    input: PathBuf,
    image: ImageArgs,
) -> Result<()> {
    let panel = image.panel(config);
    let bitmap = load_bitmap(&input)?;
    codec::validate(panel, &bitmap)?;
    let task = Task::PushImage(image.task(panel, bitmap));
    run_on_device(config, address, task).await
}

async fn cmd_firmware(
    config: &config::Config,
    address: String,
    package: PathBuf,
    version: Option<String>,
) -> Result<()> {
    let bytes = std::fs::read(&package)
        .with_context(|| format!("Failed to read {}", package.display()))?;
    let version = match version {
        Some(v) => v,
        None => package
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .context("Cannot derive a version from the package name; pass --version")?,
    };
    let task = Task::FirmwareUpgrade {
        package: bytes,
        version,
    };
    run_on_device(config, address, task).await
}

async fn cmd_status(config: &config::Config, address: String) -> Result<()> {
    run_on_device(config, address, Task::CheckStatus).await
}

async fn cmd_led(config: &config::Config, address: String, led: LedState) -> Result<()> {
    let manager = spawn_ble_manager(config).await?;
    let address = DeviceAddress::new(address);

    // a status check leaves the session Ready when auto-disconnect is off
    let options = TaskOptions {
        auto_disconnect: false,
        ..task_options(config)
    };
    let outcome = match run_task(&manager, address.clone(), Task::CheckStatus, options).await {
        Ok(_) => {
            manager.write_led(address.clone(), led).await?;
            tokio::time::sleep(Duration::from_millis(500)).await;
            println!("{} LEDs set to {}", "✓".green(), led.to_string().bright_cyan());
            Ok(())
        }
        Err(e) => Err(e),
    };
    manager.disconnect(address).await?;
    manager.shutdown().await?;
    outcome
}

fn cmd_config(mut config: config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }
        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{}", value),
            None => anyhow::bail!("Unknown config key: {}", key),
        },
        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            for (key, value) in config.list() {
                println!("  {:<20} {}", key.bright_cyan(), value);
            }
        }
        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
    }
    Ok(())
}

// ============================================================================
// HELPERS
// ============================================================================

async fn spawn_ble_manager(config: &config::Config) -> Result<ManagerHandle> {
    let platform: Arc<dyn BlePlatform> = Arc::new(
        btle::BtlePlatform::new()
            .await
            .context("Failed to open the Bluetooth adapter")?,
    );
    Ok(ManagerHandle::spawn(platform, config.epd.clone())?)
}

async fn run_on_device(config: &config::Config, address: String, task: Task) -> Result<()> {
    let manager = spawn_ble_manager(config).await?;
    let result = run_task(&manager, DeviceAddress::new(address), task, task_options(config)).await;
    manager.shutdown().await?;
    result.map(|_| ())
}

fn task_options(config: &config::Config) -> TaskOptions {
    TaskOptions {
        auto_disconnect: config.auto_disconnect,
        ..TaskOptions::from(&config.epd)
    }
}

/// Start `task` and wait for its outcome, cancelling on Ctrl-C
async fn run_task(
    manager: &ManagerHandle,
    address: DeviceAddress,
    task: Task,
    options: TaskOptions,
) -> Result<String> {
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let reporter = Arc::new(Reporter { done: done_tx });
    let handler = TaskHandler::new(manager.clone(), address.clone(), reporter, options);

    println!(
        "{} {:?} on {}",
        "→".bright_blue(),
        task.task_type(),
        address.to_string().bright_cyan()
    );
    if !handler.start_task(task).await {
        anyhow::bail!("Could not start the task on {} (busy or rejected)", address);
    }

    tokio::select! {
        outcome = done_rx.recv() => match outcome {
            Some(Ok(message)) => Ok(message),
            Some(Err(error)) => Err(anyhow::anyhow!("{}", error)),
            None => anyhow::bail!("Task ended without an outcome"),
        },
        _ = tokio::signal::ctrl_c() => {
            println!("Cancelling...");
            handler.disconnect().await?;
            anyhow::bail!("Cancelled")
        }
    }
}

fn load_bitmap(path: &Path) -> Result<Bitmap> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(Bitmap::from_ppm(&data)?)
}

/// Vertical bars in every palette color of the panel
fn test_pattern(panel: PanelType) -> Bitmap {
    let palette = epdlink_core::image::dither::palette_for(panel);
    let bar = (panel.width() / palette.len() as u32).max(1);
    Bitmap::from_fn(panel.width(), panel.height(), |x, _| {
        palette
            .get((x / bar) as usize)
            .copied()
            .unwrap_or(Rgb::WHITE)
    })
}

/// Prints task callbacks and forwards the outcome
struct Reporter {
    done: mpsc::UnboundedSender<Result<String, TaskError>>,
}

impl TaskHandlerCallback for Reporter {
    fn on_ready(&self, message: &str) {
        println!("  {} {}", "•".bright_blue(), message);
    }

    fn on_progress(&self, progress: u8, message: &str) {
        println!("  {} {:>3}% {}", "•".bright_blue(), progress, message);
    }

    fn on_success(&self, message: &str) {
        println!("{} {}", "✓".green(), message.green());
        let _ = self.done.send(Ok(message.to_string()));
    }

    fn on_error(&self, error: &TaskError) {
        println!("{} {}", "✗".red(), error.to_string().red());
        let _ = self.done.send(Err(error.clone()));
    }

    fn on_firmware_read(&self, version: &str) {
        println!("  Firmware: {}", version.bright_cyan());
    }

    fn on_led_read(&self, led: LedState) {
        println!("  LEDs:     {}", led.to_string().bright_cyan());
    }
}

/// Collects scan reports, one entry per address
#[derive(Default)]
struct ScanPrinter {
    seen: Mutex<BTreeMap<DeviceAddress, ScanReport>>,
    stopped: Mutex<Option<mpsc::UnboundedSender<()>>>,
}

impl ScanListener for ScanPrinter {
    fn on_device_seen(&self, report: &ScanReport) {
        let mut seen = self.seen.lock();
        if !seen.contains_key(&report.address) {
            println!(
                "  {} {} {}",
                "+".green(),
                report.address.to_string().bright_cyan(),
                report.name.as_deref().unwrap_or("")
            );
        }
        seen.insert(report.address.clone(), report.clone());
    }

    fn on_scan_state_changed(&self, scanning: bool) {
        if !scanning {
            if let Some(tx) = self.stopped.lock().take() {
                let _ = tx.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epdlink_core::EpdConfig;

    #[test]
    fn test_cli_parses_led_switches() {
        let cli = Cli::try_parse_from(["epdlink", "led", "AA:BB", "on", "off", "on"]).expect("parse");
        match cli.command {
            Commands::Led { led1, led2, led3, .. } => {
                assert!(led1.is_on() && !led2.is_on() && led3.is_on());
            }
            _ => panic!("expected led command"),
        }
    }

    #[test]
    fn test_cli_parses_panel_names() {
        let cli = Cli::try_parse_from([
            "epdlink", "push", "AA:BB", "--input", "x.ppm", "--panel", "EPD-353", "--dither",
        ])
        .expect("parse");
        match cli.command {
            Commands::Push { image, .. } => {
                assert_eq!(image.panel, Some(PanelType::Epd353));
                assert!(image.dither);
                assert!(image.adjustment().is_identity());
            }
            _ => panic!("expected push command"),
        }
    }

    #[test]
    fn test_pattern_matches_panel() {
        for panel in PanelType::ALL {
            let bitmap = test_pattern(panel);
            codec::validate(panel, &bitmap).expect("valid");
        }
    }

    #[tokio::test]
    async fn test_simulated_status_check() {
        let config = config::Config::default();
        let sim = Arc::new(SimulatedPeripheral::new());
        let address = DeviceAddress::from("5A:5A:5A:00:00:02");
        sim.add_device(address.clone(), SimDevice::new("Advantech_EPD-250"));
        let manager = ManagerHandle::spawn(sim.clone(), EpdConfig::default()).expect("spawn");

        let message = run_task(&manager, address.clone(), Task::CheckStatus, task_options(&config))
            .await
            .expect("task");
        assert_eq!(message, "Status Read!");
        manager.shutdown().await.expect("shutdown");
    }
}
