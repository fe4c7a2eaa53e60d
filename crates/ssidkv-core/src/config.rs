//! Protocol tuning knobs shared by coordinators and partitions.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Largest accepted offset tolerance. Anything near the SSID space would let
/// every transaction skip validation.
const MAX_OFFSET_TOLERANCE: u64 = 1 << 32;

/// Protocol configuration, loadable from JSON.
///
/// Every field has a default, so `{}` is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Distance accepted by the offset-1 shortcut.
    pub offset_tolerance: u64,
    /// Restart bound after aborts. `None` retries forever.
    pub max_restarts: Option<u32>,
    /// Force a Validate round when dispatch left dependencies undecided.
    pub validate_undecided: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            offset_tolerance: 1,
            max_restarts: None,
            validate_undecided: true,
        }
    }
}

impl ProtocolConfig {
    /// Parse a config from a JSON string.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.check()?;
        Ok(config)
    }

    /// Read and parse a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Builder-style setter for `max_restarts`.
    pub fn with_max_restarts(mut self, max: u32) -> Self {
        self.max_restarts = Some(max);
        self
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.offset_tolerance >= MAX_OFFSET_TOLERANCE {
            return Err(ConfigError::OffsetToleranceTooLarge {
                max: MAX_OFFSET_TOLERANCE,
                actual: self.offset_tolerance,
            });
        }
        Ok(())
    }
}
