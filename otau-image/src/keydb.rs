//! CS-key database: where each provisioning key lives inside the CS block
//!
//! The database is consumed as an opaque lookup. A built-in table covers the
//! default CS version and a JSON file can supply others.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::keys::KeyKind;

/// One CS-key entry; offset and length are in words relative to the CS block data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDescriptor {
    pub id: u8,
    pub name: String,
    pub offset: u16,
    pub length: u16,
    #[serde(default)]
    pub min: u16,
    #[serde(default = "default_max")]
    pub max: u16,
    #[serde(default)]
    pub defaults: Vec<u16>,
}

fn default_max() -> u16 {
    u16::MAX
}

/// Lookup from key name or id to its descriptor, scoped by CS version
pub trait KeyDatabase {
    fn lookup(&self, cs_version: u16, name: &str) -> Option<KeyDescriptor>;

    fn lookup_id(&self, cs_version: u16, id: u8) -> Option<KeyDescriptor>;

    fn key(&self, cs_version: u16, kind: KeyKind) -> Option<KeyDescriptor> {
        self.lookup(cs_version, kind.name())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyDbError {
    #[error("failed to read key database: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid key database: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("key database defines no CS versions")]
    Empty,
}

/// Table for CS version 1, the layout shipped with the default image
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinKeyDatabase;

impl BuiltinKeyDatabase {
    pub const CS_VERSION: u16 = 1;

    fn entries() -> Vec<KeyDescriptor> {
        [
            (KeyKind::BtAddress, 0),
            (KeyKind::CrystalTrim, 3),
            (KeyKind::IdentityRoot, 4),
            (KeyKind::EncryptionRoot, 12),
        ]
        .into_iter()
        .map(|(kind, offset)| KeyDescriptor {
            id: kind.cs_key_id(),
            name: kind.name().to_string(),
            offset,
            length: kind.words() as u16,
            min: 0,
            max: u16::MAX,
            defaults: vec![0; kind.words()],
        })
        .collect()
    }
}

impl KeyDatabase for BuiltinKeyDatabase {
    fn lookup(&self, cs_version: u16, name: &str) -> Option<KeyDescriptor> {
        if cs_version != Self::CS_VERSION {
            return None;
        }
        Self::entries().into_iter().find(|d| d.name == name)
    }

    fn lookup_id(&self, cs_version: u16, id: u8) -> Option<KeyDescriptor> {
        if cs_version != Self::CS_VERSION {
            return None;
        }
        Self::entries().into_iter().find(|d| d.id == id)
    }
}

/// Key database loaded from `{"versions": {"<cs version>": [descriptor, ...]}}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JsonKeyDatabase {
    versions: BTreeMap<u16, Vec<KeyDescriptor>>,
}

impl JsonKeyDatabase {
    pub fn load(path: &Path) -> Result<Self, KeyDbError> {
        let data = std::fs::read_to_string(path)?;
        data.parse()
    }

    pub fn cs_versions(&self) -> impl Iterator<Item = u16> + '_ {
        self.versions.keys().copied()
    }
}

impl std::str::FromStr for JsonKeyDatabase {
    type Err = KeyDbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let db: JsonKeyDatabase = serde_json::from_str(s)?;
        if db.versions.is_empty() {
            return Err(KeyDbError::Empty);
        }
        Ok(db)
    }
}

impl KeyDatabase for JsonKeyDatabase {
    fn lookup(&self, cs_version: u16, name: &str) -> Option<KeyDescriptor> {
        self.versions
            .get(&cs_version)?
            .iter()
            .find(|d| d.name == name)
            .cloned()
    }

    fn lookup_id(&self, cs_version: u16, id: u8) -> Option<KeyDescriptor> {
        self.versions
            .get(&cs_version)?
            .iter()
            .find(|d| d.id == id)
            .cloned()
    }
}
