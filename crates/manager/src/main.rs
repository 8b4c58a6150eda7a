//! hw-devmgr
//!
//! Discovers hardware signing devices attached over USB and prints the device
//! registry as it changes.

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use manager::{DeviceManager, ManagerConfig, RegistrySnapshot, RusbBackend};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "hw-devmgr")]
#[command(
    author,
    version,
    about = "Hardware signing device manager - discover and watch USB wallets"
)]
#[command(long_about = "
Discovers hardware signing devices (Ledger, Jade, Trezor, ...) and keeps a
live registry of them, reconciling hot-plug events as they happen.

EXAMPLES:
    # Watch the registry with default config
    hw-devmgr

    # Run with custom config
    hw-devmgr --config /path/to/manager.toml

    # Scan once, print devices and exit
    hw-devmgr --list-devices

    # Run with debug logging
    hw-devmgr --log-level debug

CONFIGURATION:
    The manager looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/hw-devmgr/manager.toml
    3. /etc/hw-devmgr/manager.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Scan once, list devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = ManagerConfig::default();
        let path = ManagerConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        manager::config::load_config(path).context("Failed to load configuration")?
    } else {
        ManagerConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.manager.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("hw-devmgr v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let usb = Arc::new(
        RusbBackend::new(config.usb.hotplug, config.usb.filters.clone())
            .context("Failed to initialize libusb")?,
    );
    let connector = Arc::new(usb.connector());
    let manager = DeviceManager::builder(config)
        .with_usb(usb, connector)
        .start()
        .await;

    if args.list_devices {
        print_devices(&manager.devices());
        manager.shutdown().await;
        return Ok(());
    }

    let result = watch_devices(&manager).await;

    info!("Shutting down device manager...");
    manager.shutdown().await;
    result
}

/// Print each registry snapshot until Ctrl+C
async fn watch_devices(manager: &DeviceManager) -> Result<()> {
    let mut updates = manager.subscribe();
    print_devices(&updates.borrow_and_update().clone());
    info!("Watching for device changes, press Ctrl+C to exit");

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    error!("Registry stream closed");
                    return Ok(());
                }
                let snapshot = updates.borrow_and_update().clone();
                print_devices(&snapshot);
            }
            signal = signal::ctrl_c() => {
                match signal {
                    Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                return Ok(());
            }
        }
    }
}

fn print_devices(snapshot: &RegistrySnapshot) {
    if snapshot.is_empty() {
        println!("No signing devices found.");
        return;
    }

    println!("Found {} device(s):\n", snapshot.len());
    for device in snapshot.iter() {
        println!(
            "  [{}] {} - {} ({})",
            device.discovery_seq,
            device.transport(),
            device.label,
            device.state
        );
        println!("      {}", device.key);
        if let Some(bonded) = device.bonded {
            println!("      Bonded: {}", bonded);
        }
        println!();
    }
}
