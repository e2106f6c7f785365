//! BLE GATT Service Protocol Constants for OTA Update
//!
//! This module defines the 128-bit service and characteristic UUIDs exposed by
//! targets running either the OTA-capable application or the bootloader.
//! All custom UUIDs share the base `0000xxxx-d102-11e1-9b23-00025b00a5a5`.

/// Build a custom OTA UUID from its 16-bit alias
pub const fn otau_uuid(alias: u16) -> u128 {
    0x0000_0000_d102_11e1_9b23_0002_5b00_a5a5 | ((alias as u128) << 96)
}

/// Build a Bluetooth SIG UUID from its 16-bit alias
pub const fn sig_uuid(alias: u16) -> u128 {
    0x0000_0000_0000_1000_8000_0080_5f9b_34fb | ((alias as u128) << 96)
}

/// Bootloader service: 00001010-d102-11e1-9b23-00025b00a5a5
pub const BOOTLOADER_SERVICE_UUID: u128 = otau_uuid(0x1010);

/// Version Characteristic UUID (read)
pub const VERSION_UUID: u128 = otau_uuid(0x1011);

/// Current Application Characteristic UUID (read/write)
pub const CURRENT_APP_UUID: u128 = otau_uuid(0x1013);

/// Data Transfer Characteristic UUID (write/notify)
pub const DATA_TRANSFER_UUID: u128 = otau_uuid(0x1014);

/// Transfer Control Characteristic UUID (write/notify)
pub const TRANSFER_CONTROL_UUID: u128 = otau_uuid(0x1015);

/// Application OTA service: 00001016-d102-11e1-9b23-00025b00a5a5
pub const APPLICATION_SERVICE_UUID: u128 = otau_uuid(0x1016);

/// Read CS-key by id (older bootloaders): write the key id, then read
pub const CS_KEY_UUID: u128 = otau_uuid(0x1017);

/// Read CS-block by offset/length (newer bootloaders): value arrives on data transfer
pub const CS_BLOCK_UUID: u128 = otau_uuid(0x1018);

/// Challenge-response Characteristic UUID (read challenge, write response)
pub const CHALLENGE_UUID: u128 = otau_uuid(0x1019);

/// Standard Battery Level characteristic
pub const BATTERY_LEVEL_UUID: u128 = sig_uuid(0x2A19);

/// Standard Service Changed characteristic
pub const SERVICE_CHANGED_UUID: u128 = sig_uuid(0x2A05);
