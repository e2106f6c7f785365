//! OTA update wire protocol - control values, target error codes and request framing

pub mod ble;

use std::fmt;
use std::io;

// Transfer control values (u16 little-endian on the wire)
pub const CONTROL_START: u16 = 2;
pub const CONTROL_PAUSED: u16 = 3;
pub const CONTROL_COMPLETED: u16 = 4;
pub const CONTROL_FAILED: u16 = 5;
pub const CONTROL_ABORT: u16 = 6;

// Target error codes, reported as ATT application errors
pub const ERR_IMAGE_TOO_BIG: u8 = 0x81;
pub const ERR_IMAGE_CORRUPT: u8 = 0x82;
pub const ERR_BATTERY_LOW: u8 = 0x83;

// CS-key ids understood by the read-by-id characteristic
pub const CS_KEY_BDADDR: u8 = 1;
pub const CS_KEY_CRYSTAL_FTRIM: u8 = 2;
pub const CS_KEY_IDENTITY_ROOT: u8 = 17;
pub const CS_KEY_ENCRYPTION_ROOT: u8 = 18;

/// Current-app value selecting the bootloader
pub const APP_BOOTLOADER: u8 = 0;

/// Bootloaders at or above this version re-read the CS block after the mode switch
pub const CS_BLOCK_REREAD_VERSION: u8 = 6;

/// Largest chunk carried by one data transfer write
pub const MAX_CHUNK_SIZE: usize = 20;

/// Command written to (or notified on) the transfer control characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferControl {
    Start,
    Paused,
    Completed,
    Failed,
    Abort,
}

impl TransferControl {
    pub fn value(self) -> u16 {
        match self {
            TransferControl::Start => CONTROL_START,
            TransferControl::Paused => CONTROL_PAUSED,
            TransferControl::Completed => CONTROL_COMPLETED,
            TransferControl::Failed => CONTROL_FAILED,
            TransferControl::Abort => CONTROL_ABORT,
        }
    }

    pub fn from_value(value: u16) -> Option<Self> {
        match value {
            CONTROL_START => Some(TransferControl::Start),
            CONTROL_PAUSED => Some(TransferControl::Paused),
            CONTROL_COMPLETED => Some(TransferControl::Completed),
            CONTROL_FAILED => Some(TransferControl::Failed),
            CONTROL_ABORT => Some(TransferControl::Abort),
            _ => None,
        }
    }

    pub fn to_bytes(self) -> Vec<u8> {
        self.value().to_le_bytes().to_vec()
    }

    /// Single-byte notifications are accepted as well as the full u16
    pub fn from_bytes(data: &[u8]) -> io::Result<Self> {
        let value = match data {
            [lo] => *lo as u16,
            [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
            [] => return Err(io::Error::new(io::ErrorKind::InvalidData, "transfer control empty")),
        };
        Self::from_value(value).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown transfer control value {value}"),
            )
        })
    }
}

/// CS-block read request: word offset into the CS block, length in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsBlockRequest {
    pub offset: u16,
    pub length: u16,
}

impl CsBlockRequest {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4);
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> io::Result<Self> {
        if data.len() < 4 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "CS block request too short"));
        }
        Ok(Self {
            offset: u16::from_le_bytes([data[0], data[1]]),
            length: u16::from_le_bytes([data[2], data[3]]),
        })
    }
}

/// Failure reported by the target while receiving an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetError {
    ImageTooBig,
    ImageCorrupt,
    BatteryLow,
}

impl TargetError {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            ERR_IMAGE_TOO_BIG => Some(TargetError::ImageTooBig),
            ERR_IMAGE_CORRUPT => Some(TargetError::ImageCorrupt),
            ERR_BATTERY_LOW => Some(TargetError::BatteryLow),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            TargetError::ImageTooBig => ERR_IMAGE_TOO_BIG,
            TargetError::ImageCorrupt => ERR_IMAGE_CORRUPT,
            TargetError::BatteryLow => ERR_BATTERY_LOW,
        }
    }
}

impl fmt::Display for TargetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            TargetError::ImageTooBig => "image too big",
            TargetError::ImageCorrupt => "image corrupt",
            TargetError::BatteryLow => "battery low",
        };
        write!(f, "{msg} (0x{:02x})", self.code())
    }
}
