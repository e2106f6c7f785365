//! GATT vocabulary shared by the session and its transport

use std::fmt;

use otau_proto::TargetError;
use otau_proto::ble::{
    BATTERY_LEVEL_UUID, CHALLENGE_UUID, CS_BLOCK_UUID, CS_KEY_UUID, CURRENT_APP_UUID,
    DATA_TRANSFER_UUID, SERVICE_CHANGED_UUID, TRANSFER_CONTROL_UUID, VERSION_UUID,
};

/// Characteristics the update protocol touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Characteristic {
    Version,
    CurrentApp,
    DataTransfer,
    TransferControl,
    CsKey,
    CsBlock,
    Challenge,
    BatteryLevel,
    ServiceChanged,
}

impl Characteristic {
    pub const ALL: [Characteristic; 9] = [
        Characteristic::Version,
        Characteristic::CurrentApp,
        Characteristic::DataTransfer,
        Characteristic::TransferControl,
        Characteristic::CsKey,
        Characteristic::CsBlock,
        Characteristic::Challenge,
        Characteristic::BatteryLevel,
        Characteristic::ServiceChanged,
    ];

    pub fn uuid(self) -> u128 {
        match self {
            Characteristic::Version => VERSION_UUID,
            Characteristic::CurrentApp => CURRENT_APP_UUID,
            Characteristic::DataTransfer => DATA_TRANSFER_UUID,
            Characteristic::TransferControl => TRANSFER_CONTROL_UUID,
            Characteristic::CsKey => CS_KEY_UUID,
            Characteristic::CsBlock => CS_BLOCK_UUID,
            Characteristic::Challenge => CHALLENGE_UUID,
            Characteristic::BatteryLevel => BATTERY_LEVEL_UUID,
            Characteristic::ServiceChanged => SERVICE_CHANGED_UUID,
        }
    }

    pub fn from_uuid(uuid: u128) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid() == uuid)
    }

    fn bit(self) -> u16 {
        1 << self as u16
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Characteristic::Version => "version",
            Characteristic::CurrentApp => "current-app",
            Characteristic::DataTransfer => "data-transfer",
            Characteristic::TransferControl => "transfer-control",
            Characteristic::CsKey => "cs-key",
            Characteristic::CsBlock => "cs-block",
            Characteristic::Challenge => "challenge",
            Characteristic::BatteryLevel => "battery-level",
            Characteristic::ServiceChanged => "service-changed",
        };
        f.write_str(name)
    }
}

/// Set of characteristics discovered on the connected target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities(u16);

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, c: Characteristic) -> Self {
        self.insert(c);
        self
    }

    pub fn insert(&mut self, c: Characteristic) {
        self.0 |= c.bit();
    }

    pub fn contains(&self, c: Characteristic) -> bool {
        self.0 & c.bit() != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Characteristic> + '_ {
        Characteristic::ALL.into_iter().filter(|c| self.contains(*c))
    }

    /// Capabilities from discovered characteristic UUIDs; unknown UUIDs are ignored
    pub fn from_uuids(uuids: impl IntoIterator<Item = u128>) -> Self {
        uuids
            .into_iter()
            .filter_map(Characteristic::from_uuid)
            .collect()
    }
}

impl FromIterator<Characteristic> for Capabilities {
    fn from_iter<I: IntoIterator<Item = Characteristic>>(iter: I) -> Self {
        let mut caps = Self::new();
        for c in iter {
            caps.insert(c);
        }
        caps
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// Failure reported by the transport for one GATT operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GattError {
    #[error("insufficient authentication")]
    InsufficientAuthentication,
    #[error("insufficient encryption")]
    InsufficientEncryption,
    #[error("insufficient authorization")]
    InsufficientAuthorization,
    #[error("application error 0x{0:02x}")]
    Application(u8),
    #[error("{0}")]
    Other(String),
}

impl GattError {
    /// Errors that an encrypted link may cure
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            GattError::InsufficientAuthentication
                | GattError::InsufficientEncryption
                | GattError::InsufficientAuthorization
        )
    }

    pub fn target_error(&self) -> Option<TargetError> {
        match self {
            GattError::Application(code) => TargetError::from_code(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_from_uuids() {
        let caps = Capabilities::from_uuids([VERSION_UUID, CS_BLOCK_UUID, 0x1234]);
        assert!(caps.contains(Characteristic::Version));
        assert!(caps.contains(Characteristic::CsBlock));
        assert!(!caps.contains(Characteristic::CsKey));
        assert_eq!(caps.iter().count(), 2);
    }

    #[test]
    fn uuids_are_distinct() {
        for c in Characteristic::ALL {
            assert_eq!(Characteristic::from_uuid(c.uuid()), Some(c));
        }
    }

    #[test]
    fn error_classes() {
        assert!(GattError::InsufficientEncryption.is_security());
        assert!(!GattError::Application(0x81).is_security());
        assert_eq!(GattError::Application(0x83).target_error(), Some(TargetError::BatteryLow));
        assert_eq!(GattError::Application(0x0e).target_error(), None);
    }
}
