//! Tool configuration, read from `$OTAU_HOME/config.json`

use std::path::{Path, PathBuf};

use otau_image::{BuiltinKeyDatabase, JsonKeyDatabase, KeyDatabase, KeyDbError};
use otau_proto::MAX_CHUNK_SIZE;
use serde::{Deserialize, Serialize};

use crate::event::ConnectionParameters;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no home directory; set OTAU_HOME")]
    NoHome,
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(transparent)]
    KeyDatabase(#[from] KeyDbError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtauConfig {
    /// CS layout version used to look up key offsets
    pub cs_version: u16,
    pub chunk_size: usize,
    /// JSON key database; the built-in table is used when unset
    pub key_database: Option<PathBuf>,
    /// Application slot to flash; defaults to the one the bootloader reports
    pub target_app: Option<u8>,
    pub connect_timeout_secs: u64,
    pub scan_secs: u64,
    pub fast_connection: ConnectionParameters,
}

impl Default for OtauConfig {
    fn default() -> Self {
        Self {
            cs_version: BuiltinKeyDatabase::CS_VERSION,
            chunk_size: MAX_CHUNK_SIZE,
            key_database: None,
            target_app: None,
            connect_timeout_secs: 10,
            scan_secs: 5,
            fast_connection: ConnectionParameters::default(),
        }
    }
}

/// `$OTAU_HOME`, or `~/.otau`
pub fn otau_home() -> Result<PathBuf, ConfigError> {
    if let Ok(home) = std::env::var("OTAU_HOME") {
        return Ok(PathBuf::from(home));
    }
    dirs::home_dir()
        .map(|home| home.join(".otau"))
        .ok_or(ConfigError::NoHome)
}

impl OtauConfig {
    /// Load from the default location; a missing file gives the defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&otau_home()?.join("config.json"))
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::debug!("{} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io = |source| ConfigError::Io { path: path.to_path_buf(), source };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(io)?;
        }
        let data = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, data).map_err(io)
    }

    /// Chunk size clamped to what one data transfer write can carry, and to
    /// at least one image word
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.clamp(2, MAX_CHUNK_SIZE)
    }

    pub fn key_database(&self) -> Result<Box<dyn KeyDatabase + Send>, ConfigError> {
        match &self.key_database {
            Some(path) => Ok(Box::new(JsonKeyDatabase::load(path)?)),
            None => Ok(Box::new(BuiltinKeyDatabase)),
        }
    }
}
