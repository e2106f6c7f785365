//! OTAU Engine - transport-agnostic OTA update state machine
//!
//! The driver feeds [`Event`]s observed on the BLE link into a [`Session`] and
//! performs the [`Action`]s it returns, in order. The engine runs no tasks and
//! keeps no timers of its own.

mod config;
mod event;
mod gatt;
mod queue;
mod session;

pub use config::{ConfigError, OtauConfig, otau_home};
pub use event::{Action, ConnectionParameters, Event, FailureReason, Outcome};
pub use gatt::{Capabilities, Characteristic, GattError, WriteMode};
pub use queue::{GattOp, GattQueue, Lane};
pub use session::{ChallengeResponder, DeviceMode, KeyProtocol, Session, SessionError, State};

pub use otau_image::{ImageFile, KeyKind, ProvisioningKeys};
