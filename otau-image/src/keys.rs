//! Device provisioning keys harvested from the target before an update

use std::fmt;

use otau_proto::{CS_KEY_BDADDR, CS_KEY_CRYSTAL_FTRIM, CS_KEY_ENCRYPTION_ROOT, CS_KEY_IDENTITY_ROOT};

/// The four per-device keys merged into every image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    BtAddress,
    CrystalTrim,
    IdentityRoot,
    EncryptionRoot,
}

impl KeyKind {
    /// Read and merge order
    pub const ALL: [KeyKind; 4] = [
        KeyKind::BtAddress,
        KeyKind::CrystalTrim,
        KeyKind::IdentityRoot,
        KeyKind::EncryptionRoot,
    ];

    /// Size of the key in image words
    pub fn words(self) -> usize {
        match self {
            KeyKind::BtAddress => 3,
            KeyKind::CrystalTrim => 1,
            KeyKind::IdentityRoot | KeyKind::EncryptionRoot => 8,
        }
    }

    pub fn byte_len(self) -> usize {
        self.words() * 2
    }

    /// Name used by the key database
    pub fn name(self) -> &'static str {
        match self {
            KeyKind::BtAddress => "bdaddr",
            KeyKind::CrystalTrim => "crystal_ftrim",
            KeyKind::IdentityRoot => "identity_root",
            KeyKind::EncryptionRoot => "encryption_root",
        }
    }

    /// Id used by the read-by-id characteristic
    pub fn cs_key_id(self) -> u8 {
        match self {
            KeyKind::BtAddress => CS_KEY_BDADDR,
            KeyKind::CrystalTrim => CS_KEY_CRYSTAL_FTRIM,
            KeyKind::IdentityRoot => CS_KEY_IDENTITY_ROOT,
            KeyKind::EncryptionRoot => CS_KEY_ENCRYPTION_ROOT,
        }
    }

    fn index(self) -> usize {
        match self {
            KeyKind::BtAddress => 0,
            KeyKind::CrystalTrim => 1,
            KeyKind::IdentityRoot => 2,
            KeyKind::EncryptionRoot => 3,
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("{kind} needs {expected} bytes, got {actual}")]
    TooShort {
        kind: KeyKind,
        expected: usize,
        actual: usize,
    },
    #[error("invalid hex for {kind}: {text:?}")]
    BadHex { kind: KeyKind, text: String },
}

#[derive(Debug, Clone, Default)]
struct KeyBuffer {
    bytes: Vec<u8>,
    valid: bool,
}

/// Key buffers with validity flags, filled incrementally from target reads
///
/// The Bluetooth address is kept least-significant byte first, whichever read
/// protocol produced it.
#[derive(Debug, Clone, Default)]
pub struct ProvisioningKeys {
    buffers: [KeyBuffer; 4],
}

impl ProvisioningKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self, kind: KeyKind) -> bool {
        self.buffers[kind.index()].valid
    }

    pub fn get(&self, kind: KeyKind) -> Option<&[u8]> {
        let buf = &self.buffers[kind.index()];
        buf.valid.then_some(buf.bytes.as_slice())
    }

    /// Store a key value as returned by the read-by-id characteristic
    ///
    /// Extra trailing bytes are dropped.
    pub fn set(&mut self, kind: KeyKind, bytes: &[u8]) -> Result<(), KeyError> {
        if bytes.len() < kind.byte_len() {
            return Err(KeyError::TooShort {
                kind,
                expected: kind.byte_len(),
                actual: bytes.len(),
            });
        }
        self.buffers[kind.index()] = KeyBuffer {
            bytes: bytes[..kind.byte_len()].to_vec(),
            valid: true,
        };
        Ok(())
    }

    /// Store a key value read from the CS block
    ///
    /// The CS block keeps the address most-significant word first, so its word
    /// order is reversed to match the read-by-id layout.
    pub fn set_from_cs_block(&mut self, kind: KeyKind, bytes: &[u8]) -> Result<(), KeyError> {
        if kind != KeyKind::BtAddress {
            return self.set(kind, bytes);
        }
        if bytes.len() < kind.byte_len() {
            return Err(KeyError::TooShort {
                kind,
                expected: kind.byte_len(),
                actual: bytes.len(),
            });
        }
        let address: Vec<u8> = bytes[..kind.byte_len()]
            .chunks(2)
            .rev()
            .flatten()
            .copied()
            .collect();
        self.set(kind, &address)
    }

    /// Parse a hex string; the address takes the usual `00:02:5b:00:a5:a5` display form
    pub fn set_hex(&mut self, kind: KeyKind, text: &str) -> Result<(), KeyError> {
        let cleaned: String = text.chars().filter(|c| !matches!(c, ':' | '-' | ' ')).collect();
        let mut bytes = data_encoding::HEXLOWER_PERMISSIVE
            .decode(cleaned.as_bytes())
            .map_err(|_| KeyError::BadHex {
                kind,
                text: text.to_string(),
            })?;
        if kind == KeyKind::BtAddress {
            bytes.reverse();
        }
        self.set(kind, &bytes)
    }

    pub fn invalidate(&mut self, kind: KeyKind) {
        self.buffers[kind.index()] = KeyBuffer::default();
    }

    pub fn invalidate_all(&mut self) {
        self.buffers = Default::default();
    }

    /// Keys not yet read, in read order
    pub fn missing(&self) -> impl Iterator<Item = KeyKind> + '_ {
        KeyKind::ALL.into_iter().filter(|k| !self.is_valid(*k))
    }

    pub fn all_valid(&self) -> bool {
        self.missing().next().is_none()
    }

    /// Address in display form, most-significant byte first
    pub fn bt_address_string(&self) -> Option<String> {
        let bytes = self.get(KeyKind::BtAddress)?;
        Some(
            bytes
                .iter()
                .rev()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(":"),
        )
    }
}
