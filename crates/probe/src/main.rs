//! usb-probe
//!
//! lsusb-style inspector: lists USB devices with their string descriptors and
//! BOS capabilities, and can watch hotplug events.

mod config;
mod report;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::setup_logging;
use config::{DeviceFilter, ProbeConfig, check_filters};
use host::{Device, EventKind, Usb, UsbEvent, UsbOptions};
use report::{DeviceSummary, describe};
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-probe")]
#[command(author, version, about = "Inspect USB devices attached to this host")]
#[command(long_about = "
Lists USB devices with their string descriptors and BOS capabilities.

EXAMPLES:
    # List every device
    usb-probe

    # Only devices from one vendor, as JSON
    usb-probe --filter 0x04f9:* --json

    # Look up a device by serial number
    usb-probe --serial A1B2C3

    # Print attach and detach events until Ctrl+C
    usb-probe --watch

CONFIGURATION:
    The probe looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-probe/probe.toml
    3. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Only report devices matching VID:PID (repeatable, adds to config filters)
    #[arg(short, long, value_name = "VID:PID")]
    filter: Vec<String>,

    /// Only report the device with this serial number
    #[arg(long, value_name = "SERIAL")]
    serial: Option<String>,

    /// Control transfer timeout in milliseconds
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Skip BOS capability reads
    #[arg(long)]
    no_capabilities: bool,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,

    /// Watch hotplug events after listing
    #[arg(short, long)]
    watch: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = ProbeConfig::default();
        let path = ProbeConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        ProbeConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        ProbeConfig::load_or_default()
    };
    apply_args(&mut config, &args)?;

    setup_logging(&config.probe.log_level).context("Failed to setup logging")?;
    info!("usb-probe v{}", env!("CARGO_PKG_VERSION"));

    let usb = Usb::with_libusb(UsbOptions::default()).context("Failed to initialize libusb")?;
    let filters = config.device_filters()?;

    let summaries = if let Some(serial) = &args.serial {
        let device = usb
            .find_by_serial_number(serial)
            .await
            .context("Failed to search devices")?
            .ok_or_else(|| anyhow!("No device with serial number '{}'", serial))?;
        vec![probe_device(device, &config).await]
    } else {
        let mut summaries = Vec::new();
        for device in usb.devices().context("Failed to enumerate devices")? {
            let descriptor = device.device_descriptor();
            if !check_filters(&filters, descriptor.vendor_id, descriptor.product_id) {
                continue;
            }
            summaries.push(probe_device(device, &config).await);
        }
        summaries
    };

    print_summaries(&summaries, args.json)?;

    if args.watch {
        watch(&usb, &config, &filters, args.json).await?;
    }

    Ok(())
}

/// Fold CLI overrides into the loaded configuration and re-validate it
fn apply_args(config: &mut ProbeConfig, args: &Args) -> Result<()> {
    if let Some(level) = &args.log_level {
        config.probe.log_level = level.clone();
    }
    if let Some(timeout) = args.timeout_ms {
        config.probe.control_timeout_ms = timeout;
    }
    if args.no_capabilities {
        config.probe.show_capabilities = false;
    }
    config.usb.filters.extend(args.filter.iter().cloned());
    config.validate().context("Invalid options")
}

async fn probe_device(mut device: Device, config: &ProbeConfig) -> DeviceSummary {
    describe(
        &mut device,
        config.probe.control_timeout(),
        config.probe.show_capabilities,
    )
    .await
}

fn print_summaries(summaries: &[DeviceSummary], json: bool) -> Result<()> {
    if json {
        let out = serde_json::to_string_pretty(summaries).context("Failed to encode JSON")?;
        println!("{}", out);
        return Ok(());
    }

    if summaries.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", summaries.len());
    for summary in summaries {
        println!("{}", report::render(summary));
    }
    Ok(())
}

/// Print hotplug events until Ctrl+C
async fn watch(
    usb: &Usb,
    config: &ProbeConfig,
    filters: &[DeviceFilter],
    json: bool,
) -> Result<()> {
    let attach = usb
        .subscribe(EventKind::Attach)
        .context("Failed to enable hotplug events")?;
    let detach = usb.subscribe(EventKind::Detach)?;
    let errors = usb.subscribe(EventKind::Error)?;

    info!("Watching hotplug events, press Ctrl+C to stop");

    loop {
        let event = tokio::select! {
            Some(event) = attach.recv() => event,
            Some(event) = detach.recv() => event,
            Some(event) = errors.recv() => event,
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Error waiting for Ctrl+C: {}", e);
                }
                info!("Stopping hotplug watch");
                return Ok(());
            }
        };

        match event {
            UsbEvent::Attach(device) => {
                let descriptor = device.device_descriptor();
                if !check_filters(filters, descriptor.vendor_id, descriptor.product_id) {
                    continue;
                }
                // Give the OS a moment to finish enumerating before opening
                tokio::time::sleep(Duration::from_millis(100)).await;
                let summary = probe_device(device, config).await;
                print_event("attached", &summary, json)?;
            }
            UsbEvent::Detach(device) => {
                let descriptor = device.device_descriptor();
                if !check_filters(filters, descriptor.vendor_id, descriptor.product_id) {
                    continue;
                }
                print_event("detached", &report::identify(&device), json)?;
            }
            UsbEvent::Error(message) => warn!("Hotplug error: {}", message),
        }
    }
}

fn print_event(action: &str, summary: &DeviceSummary, json: bool) -> Result<()> {
    if json {
        let value = serde_json::json!({ "event": action, "device": summary });
        println!("{}", serde_json::to_string(&value).context("Failed to encode JSON")?);
    } else {
        println!(
            "{} {:04x}:{:04x} on bus {:03} device {:03}",
            action,
            summary.vendor_id,
            summary.product_id,
            summary.bus_number,
            summary.device_address
        );
        if action == "attached" {
            print!("{}", report::render(summary));
        }
    }
    Ok(())
}
