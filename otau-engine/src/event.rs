//! Events fed to a session and the actions it asks the transport to perform

use serde::{Deserialize, Serialize};

use otau_image::KeyKind;
use otau_proto::TargetError;

use crate::gatt::{Capabilities, Characteristic, GattError, WriteMode};

/// Something the transport observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Link (re)established and services discovered
    Connected { capabilities: Capabilities },
    ReadDone {
        characteristic: Characteristic,
        result: Result<Vec<u8>, GattError>,
    },
    /// Also reports completion of a subscription request
    WriteDone {
        characteristic: Characteristic,
        result: Result<(), GattError>,
    },
    Notified {
        characteristic: Characteristic,
        value: Vec<u8>,
    },
    SecurityChanged { result: Result<(), GattError> },
    Disconnected,
    Pause,
    Abort,
}

/// Something the transport must do, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Read(Characteristic),
    Write {
        characteristic: Characteristic,
        value: Vec<u8>,
        mode: WriteMode,
    },
    Subscribe(Characteristic),
    RequestEncryption,
    UpdateConnectionParameters(ConnectionParameters),
    Disconnect,
    Reconnect,
    RefreshServices,
    /// Percent of the image sent so far
    Progress(u8),
    Finished(Outcome),
}

/// Connection parameters requested for the data transfer phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParameters {
    /// Units of 1.25 ms
    pub min_interval: u16,
    pub max_interval: u16,
    pub latency: u16,
    /// Supervision timeout, units of 10 ms
    pub timeout: u16,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self {
            min_interval: 6,
            max_interval: 12,
            latency: 0,
            timeout: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Paused,
    Aborted,
    Failed(FailureReason),
}

/// Why a session ended early
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    #[error("link lost")]
    LinkLost,
    #[error("target battery is empty")]
    BatteryLow,
    #[error("target does not support OTA update")]
    NotSupporting,
    #[error("target came back still running the application")]
    BootloaderNotEntered,
    #[error("challenge response failed: {0}")]
    Challenge(String),
    #[error("could not read {0}")]
    KeyRead(KeyKind),
    #[error("key merge failed: {0}")]
    Merge(String),
    #[error("target rejected the image: {0}")]
    Target(TargetError),
    #[error("target reported a failed transfer")]
    TransferFailed,
    #[error("{characteristic}: {error}")]
    Gatt {
        characteristic: Characteristic,
        error: GattError,
    },
}
