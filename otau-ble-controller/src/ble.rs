//! BLE client for OTA-capable targets
//!
//! Provides functions to scan for targets, connect to them and describe what
//! they expose.

use std::time::Duration;

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use log::debug;
use uuid::Uuid;

use otau_engine::{Capabilities, Characteristic, DeviceMode, GattError, KeyProtocol, SessionError};
use otau_proto::ble::{APPLICATION_SERVICE_UUID, BOOTLOADER_SERVICE_UUID};

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("bluetooth: {0}")]
    Ble(#[from] btleplug::Error),
    #[error("no Bluetooth adapter found")]
    NoAdapter,
    #[error("no OTA capable device found")]
    NotFound,
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
    #[error("target did not come back after switching to the bootloader")]
    ReconnectFailed,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("adapter event stream ended")]
    StreamClosed,
}

/// A discovered device
#[derive(Debug, Clone)]
pub struct OtauDevice {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
    /// Advertises the application OTA or bootloader service
    pub is_otau: bool,
}

/// What a connected target exposes
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub address: String,
    pub mode: DeviceMode,
    pub key_protocol: KeyProtocol,
    pub version: Option<u8>,
    pub current_app: Option<u8>,
    pub battery_level: Option<u8>,
    pub characteristics: Vec<Characteristic>,
}

pub(crate) fn is_otau(services: &[Uuid]) -> bool {
    services.iter().any(|s| {
        *s == Uuid::from_u128(BOOTLOADER_SERVICE_UUID) || *s == Uuid::from_u128(APPLICATION_SERVICE_UUID)
    })
}

/// Map a btleplug failure onto the error classes the session understands
///
/// btleplug does not surface ATT error codes; a permission failure is the
/// closest it gets to "insufficient authentication".
pub(crate) fn gatt_error(e: btleplug::Error) -> GattError {
    match e {
        btleplug::Error::PermissionDenied => GattError::InsufficientAuthentication,
        other => GattError::Other(other.to_string()),
    }
}

/// Get the default Bluetooth adapter
pub async fn get_adapter() -> Result<Adapter, DriverError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or(DriverError::NoAdapter)
}

/// Scan for BLE devices
///
/// Returns every device seen. OTA capable ones have `is_otau = true`.
pub async fn scan(adapter: &Adapter, duration_secs: u64) -> Result<Vec<OtauDevice>, DriverError> {
    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(Duration::from_secs(duration_secs)).await;

    let peripherals = adapter.peripherals().await?;
    let mut devices = Vec::new();

    for peripheral in peripherals {
        if let Some(props) = peripheral.properties().await? {
            let name = props.local_name.unwrap_or_else(|| "Unknown".to_string());
            let address = peripheral.address().to_string();
            let is_otau = is_otau(&props.services);
            devices.push(OtauDevice { name, address, rssi: props.rssi, is_otau });
        }
    }

    adapter.stop_scan().await?;
    Ok(devices)
}

/// Find a device by name/address pattern, or the first OTA capable one
pub async fn find_device(
    adapter: &Adapter,
    target: Option<&str>,
    scan_secs: u64,
) -> Result<Peripheral, DriverError> {
    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(Duration::from_secs(scan_secs)).await;

    let peripherals = adapter.peripherals().await?;

    for peripheral in peripherals {
        if let Some(props) = peripheral.properties().await? {
            let name = props.local_name.unwrap_or_default();
            let addr = peripheral.address().to_string();

            let matches = match target {
                Some(t) => name.contains(t) || addr.eq_ignore_ascii_case(t),
                None => is_otau(&props.services),
            };

            if matches {
                adapter.stop_scan().await?;
                debug!("found {name} ({addr})");
                return Ok(peripheral);
            }
        }
    }

    adapter.stop_scan().await?;
    Err(DriverError::NotFound)
}

/// Connect, discover services and report the characteristics we know
pub async fn connect(peripheral: &Peripheral, timeout_secs: u64) -> Result<Capabilities, DriverError> {
    if !peripheral.is_connected().await? {
        tokio::time::timeout(Duration::from_secs(timeout_secs), peripheral.connect())
            .await
            .map_err(|_| DriverError::ConnectTimeout(peripheral.address().to_string()))??;
    }
    peripheral.discover_services().await?;
    let caps = Capabilities::from_uuids(peripheral.characteristics().iter().map(|c| c.uuid.as_u128()));
    debug!("capabilities: {:?}", caps.iter().collect::<Vec<_>>());
    Ok(caps)
}

pub(crate) fn find_characteristic(
    peripheral: &Peripheral,
    c: Characteristic,
) -> Option<btleplug::api::Characteristic> {
    let uuid = Uuid::from_u128(c.uuid());
    peripheral.characteristics().into_iter().find(|ch| ch.uuid == uuid)
}

async fn read_byte(peripheral: &Peripheral, c: Characteristic) -> Option<u8> {
    let ch = find_characteristic(peripheral, c)?;
    match peripheral.read(&ch).await {
        Ok(value) => value.first().copied(),
        Err(e) => {
            debug!("reading {c} failed: {e}");
            None
        }
    }
}

/// Connect to a target, read its identity bytes and disconnect
pub async fn info(peripheral: &Peripheral, timeout_secs: u64) -> Result<DeviceInfo, DriverError> {
    let caps = connect(peripheral, timeout_secs).await?;
    let name = peripheral
        .properties()
        .await?
        .and_then(|p| p.local_name)
        .unwrap_or_else(|| "Unknown".to_string());

    let info = DeviceInfo {
        name,
        address: peripheral.address().to_string(),
        mode: DeviceMode::detect(&caps),
        key_protocol: KeyProtocol::detect(&caps),
        version: read_byte(peripheral, Characteristic::Version).await,
        current_app: read_byte(peripheral, Characteristic::CurrentApp).await,
        battery_level: read_byte(peripheral, Characteristic::BatteryLevel).await,
        characteristics: caps.iter().collect(),
    };

    let _ = peripheral.disconnect().await;
    Ok(info)
}
