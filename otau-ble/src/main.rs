//! Over-the-air update tool for CSR Bluetooth targets
//!
//! Scans for targets, inspects them, checks and personalises image files and
//! runs full updates.

use std::path::{Path, PathBuf};

use btleplug::api::Peripheral as _;
use clap::{Parser, Subcommand};
use log::warn;
use tokio::sync::mpsc;

use otau_ble_controller::{ble, update};
use otau_engine::{Event, KeyKind, OtauConfig, Outcome, ProvisioningKeys};
use otau_image::{ImageFile, merge_keys_into_file, validate_image_file};

#[derive(Parser)]
#[command(name = "otau-ble")]
#[command(about = "Over-the-air update tool for CSR Bluetooth targets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for devices
    Scan {
        /// Scan duration in seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// Connect to a device and show what it exposes
    Info {
        /// Device name or address to connect to
        #[arg(short, long)]
        device: Option<String>,
    },
    /// Check an image file's CRCs
    Validate {
        image: PathBuf,
    },
    /// Merge per-device keys into an image without a device
    Merge {
        image: PathBuf,
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
        /// Bluetooth address, e.g. 00:02:5b:00:a5:a5
        #[arg(long)]
        bdaddr: Option<String>,
        /// Crystal trim as hex
        #[arg(long)]
        xtal: Option<String>,
        /// Identity root as hex
        #[arg(long)]
        ir: Option<String>,
        /// Encryption root as hex
        #[arg(long)]
        er: Option<String>,
        /// CS layout version
        #[arg(long)]
        cs_version: Option<u16>,
        /// JSON key database
        #[arg(long)]
        keydb: Option<PathBuf>,
    },
    /// Update a device with an image
    Update {
        image: PathBuf,
        /// Device name or address to connect to
        #[arg(short, long)]
        device: Option<String>,
        /// Application slot to flash
        #[arg(long)]
        target_app: Option<u8>,
        /// Bytes per data write
        #[arg(long)]
        chunk_size: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();
    let config = OtauConfig::load()?;

    match cli.command {
        Commands::Scan { duration } => {
            scan_devices(duration.unwrap_or(config.scan_secs)).await?;
        }
        Commands::Info { device } => {
            show_info(device, &config).await?;
        }
        Commands::Validate { image } => {
            validate(&image)?;
        }
        Commands::Merge { image, output, bdaddr, xtal, ir, er, cs_version, keydb } => {
            let keys = [
                (KeyKind::BtAddress, bdaddr),
                (KeyKind::CrystalTrim, xtal),
                (KeyKind::IdentityRoot, ir),
                (KeyKind::EncryptionRoot, er),
            ];
            let mut config = config;
            if let Some(version) = cs_version {
                config.cs_version = version;
            }
            if keydb.is_some() {
                config.key_database = keydb;
            }
            merge(&image, &output, keys, &config)?;
        }
        Commands::Update { image, device, target_app, chunk_size } => {
            let mut config = config;
            if target_app.is_some() {
                config.target_app = target_app;
            }
            if let Some(size) = chunk_size {
                config.chunk_size = size;
            }
            run_update(&image, device, config).await?;
        }
    }

    Ok(())
}

async fn scan_devices(duration: u64) -> Result<(), Box<dyn std::error::Error>> {
    println!("Scanning for devices ({} seconds)...", duration);
    let adapter = ble::get_adapter().await?;
    let devices = ble::scan(&adapter, duration).await?;

    println!("\nFound {} devices:", devices.len());
    for device in devices {
        let rssi = device.rssi.map(|r| format!("{} dBm", r)).unwrap_or_else(|| "N/A".to_string());
        let marker = if device.is_otau { " [OTAU]" } else { "" };
        println!("  {} ({}) RSSI: {}{}", device.name, device.address, rssi, marker);
    }
    Ok(())
}

async fn show_info(target: Option<String>, config: &OtauConfig) -> Result<(), Box<dyn std::error::Error>> {
    let adapter = ble::get_adapter().await?;
    println!("Scanning...");
    let peripheral = ble::find_device(&adapter, target.as_deref(), config.scan_secs).await?;
    println!("Connecting to {}...", peripheral.address());
    let info = ble::info(&peripheral, config.connect_timeout_secs).await?;

    let show = |v: Option<u8>| v.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string());
    println!("Name:          {}", info.name);
    println!("Address:       {}", info.address);
    println!("Mode:          {:?}", info.mode);
    println!("Key protocol:  {:?}", info.key_protocol);
    println!("Version:       {}", show(info.version));
    println!("Current app:   {}", show(info.current_app));
    println!("Battery:       {}", show(info.battery_level));
    println!("Characteristics:");
    for c in info.characteristics {
        println!("  {}", c);
    }
    Ok(())
}

fn validate(image: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if validate_image_file(image)? {
        println!("{}: CRCs OK", image.display());
        Ok(())
    } else {
        Err(format!("{}: CRC mismatch", image.display()).into())
    }
}

fn merge(
    image: &Path,
    output: &Path,
    keys: [(KeyKind, Option<String>); 4],
    config: &OtauConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut provisioning = ProvisioningKeys::new();
    for (kind, text) in keys {
        if let Some(text) = text {
            provisioning.set_hex(kind, &text)?;
        }
    }
    for kind in provisioning.missing() {
        warn!("no {kind} given, keeping the image value");
    }

    let db = config.key_database()?;
    let (merged, report) = merge_keys_into_file(image, &provisioning, db.as_ref(), config.cs_version)?;
    merged.save(output)?;
    println!(
        "Merged {} keys into {} (CS CRC 0x{:04x}, header CRC 0x{:04x})",
        report.merged.len(),
        output.display(),
        report.cs_block_crc,
        report.control_header_crc
    );
    Ok(())
}

async fn run_update(
    image: &Path,
    target: Option<String>,
    config: OtauConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let request = update::UpdateRequest {
        image: ImageFile::open(image)?,
        db: config.key_database()?,
        config,
        responder: None,
    };
    request.validate()?;

    let adapter = ble::get_adapter().await?;
    println!("Scanning...");
    let peripheral = ble::find_device(&adapter, target.as_deref(), request.config.scan_secs).await?;
    println!("Updating {} with {}...", peripheral.address(), image.display());

    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nAborting...");
            let _ = tx.send(Event::Abort).await;
        }
    });

    let outcome = update::update(&adapter, &peripheral, request, rx, |percent| {
        println!("  {}%", percent);
    })
    .await?;

    match outcome {
        Outcome::Completed => println!("Update complete! Device is restarting."),
        Outcome::Paused => println!("Update paused."),
        Outcome::Aborted => println!("Update aborted."),
        Outcome::Failed(reason) => return Err(format!("update failed: {reason}").into()),
    }
    Ok(())
}
