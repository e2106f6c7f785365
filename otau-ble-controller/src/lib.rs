//! OTAU BLE Controller
//!
//! btleplug driver for the update engine: finds targets, performs the engine's
//! GATT actions and feeds completions and notifications back.
//!
//! # Example
//!
//! ```ignore
//! use otau_ble_controller::{ble, update};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let adapter = ble::get_adapter().await?;
//!     let peripheral = ble::find_device(&adapter, None, 5).await?;
//!
//!     let config = otau_engine::OtauConfig::load()?;
//!     let request = update::UpdateRequest {
//!         image: otau_image::ImageFile::open("app.img".as_ref())?,
//!         db: config.key_database()?,
//!         config,
//!         responder: None,
//!     };
//!     let (_tx, rx) = tokio::sync::mpsc::channel(4);
//!     let outcome = update::update(&adapter, &peripheral, request, rx, |p| println!("{p}%")).await?;
//!     println!("{outcome:?}");
//!     Ok(())
//! }
//! ```

pub mod ble;
pub mod update;

pub use ble::{DeviceInfo, DriverError, OtauDevice};
pub use update::UpdateRequest;
