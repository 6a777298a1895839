//! usb-midi-host
//!
//! Runs the USB-MIDI host driver and logs every decoded event.

use anyhow::{Context, Result};
use clap::Parser;
use common::{DriverBridge, DriverCommand, create_driver_bridge, setup_logging};
use host::config::{self, HostConfig};
use host::usb::rusb_host::list_midi_devices;
use host::usb::{DeviceAddress, RusbHost, SimulatedHost, UsbHost};
use host::{DriverSettings, MidiDriver, MidiEvents, RunningDriver};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-midi-host")]
#[command(author, version, about = "USB-MIDI host driver")]
#[command(long_about = "
Claims the first class-compliant USB-MIDI device that is plugged in and
logs the channel-voice messages it sends.

EXAMPLES:
    # Run with default config
    usb-midi-host

    # List attached MIDI devices
    usb-midi-host --list-devices

    # Drive a virtual keyboard instead of real hardware
    usb-midi-host --simulate --log-level debug

CONFIGURATION:
    The host looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-midi-host/host.toml
    3. /etc/usb-midi-host/host.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List attached MIDI devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Use a simulated keyboard instead of libusb
    #[arg(long)]
    simulate: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = HostConfig::default();
        let path = HostConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = match args.config.as_deref() {
        Some(path) => config::load_config(path).context("Failed to load configuration")?,
        None => HostConfig::load_or_default(),
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.host.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-midi-host v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    if args.list_devices {
        return list_devices_mode(&config.usb.filters);
    }

    let (bridge, worker) = create_driver_bridge();
    let settings = config.driver_settings();
    let stop = Arc::new(AtomicBool::new(false));

    let (driver, player) = if args.simulate {
        info!("Running against a simulated keyboard");
        let sim = SimulatedHost::new();
        let driver = start_driver(sim.clone(), settings, worker)?;
        let player = spawn_demo_player(sim, Arc::clone(&stop))?;
        (driver, Some(player))
    } else {
        let host = RusbHost::install(config.usb.filters.clone())
            .context("Failed to initialize libusb")?;
        (start_driver(host, settings, worker)?, None)
    };

    let consumer = spawn_consumer(driver.events(), Arc::clone(&stop));
    let notifier = tokio::spawn(log_driver_events(bridge.clone()));

    info!("Press Ctrl+C to shutdown");
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
        Err(e) => error!("Error waiting for Ctrl+C: {}", e),
    }

    if let Ok(status) = bridge.status().await {
        info!(
            "Final state: {} ({} events queued, {} dropped)",
            status.state, status.queued_events, status.dropped_events
        );
    }

    stop.store(true, Ordering::Release);
    if let Err(e) = bridge.send_command(DriverCommand::Shutdown).await {
        error!("Error shutting down driver: {:#}", e);
        driver.stop();
    }
    notifier.abort();

    tokio::task::spawn_blocking(move || {
        driver.join();
        if let Some(player) = player
            && player.join().is_err()
        {
            warn!("Demo player panicked");
        }
    })
    .await
    .context("Failed to join driver threads")?;

    if let Err(e) = consumer.await {
        warn!("Event consumer ended abnormally: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}

fn start_driver<H: UsbHost>(
    host: H,
    settings: DriverSettings,
    worker: common::DriverWorker,
) -> Result<RunningDriver> {
    let driver = MidiDriver::install(host, settings)
        .context("Failed to install driver")?
        .register_client()
        .context("Failed to register client")?
        .start_event_loop(worker)
        .context("Failed to start event loop")?;
    Ok(driver)
}

/// List attached MIDI devices and exit
fn list_devices_mode(filters: &[String]) -> Result<()> {
    let devices = list_midi_devices(filters).context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No USB-MIDI devices found.");
    } else {
        println!("Found {} USB-MIDI device(s):\n", devices.len());
        for device in devices {
            println!(
                "  {:04x}:{:04x} - {}",
                device.vendor_id,
                device.product_id,
                device.product.as_deref().unwrap_or("Unknown Product")
            );
            println!(
                "      Bus {:03} Device {:03}",
                device.address.bus, device.address.address
            );
        }
    }

    Ok(())
}

/// Log decoded events until `stop` is set
fn spawn_consumer(events: MidiEvents, stop: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while !stop.load(Ordering::Acquire) {
            if let Some(event) = events.try_pop(Duration::from_millis(50)) {
                info!("{}", event);
            }
        }
        let dropped = events.dropped();
        if dropped > 0 {
            warn!("{} MIDI events were dropped on a full queue", dropped);
        }
    })
}

async fn log_driver_events(bridge: DriverBridge) {
    while let Ok(event) = bridge.recv_event().await {
        info!("Driver event: {:?}", event);
    }
}

/// Plug in a virtual keyboard and play a C major scale on it, forever
fn spawn_demo_player(
    sim: SimulatedHost,
    stop: Arc<AtomicBool>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    const SCALE: [u8; 8] = [60, 62, 64, 65, 67, 69, 71, 72];

    std::thread::Builder::new()
        .name("demo-player".to_string())
        .spawn(move || {
            sim.attach(DeviceAddress::new(1, 1));
            while !stop.load(Ordering::Acquire) {
                for note in SCALE {
                    if stop.load(Ordering::Acquire) {
                        return;
                    }
                    sim.feed(&[0x09, 0x90, note, 0x64]);
                    std::thread::sleep(Duration::from_millis(200));
                    sim.feed(&[0x08, 0x80, note, 0x00]);
                }
                sim.feed(&[0x0B, 0xB0, 0x40, 0x7F]);
                std::thread::sleep(Duration::from_millis(400));
                sim.feed(&[0x0B, 0xB0, 0x40, 0x00]);
            }
        })
}
