//! Store configuration.

use serde::{Deserialize, Serialize};

use crate::block::{BLOCK_ALIGN, DEFAULT_BLOCK_SIZE};
use crate::EcsError;

/// Configuration for a [`World`](crate::world::World).
///
/// ```
/// use chunk_ecs::StoreConfig;
///
/// let config = StoreConfig::from_json_str(r#"{ "block_size": 4096 }"#).unwrap();
/// assert_eq!(config.block_size, 4096);
/// assert_eq!(config.initial_blocks, 0);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Size of every block in bytes (default: 16384).
    pub block_size: usize,
    /// Blocks allocated into the pool when the world is created (default: 0).
    pub initial_blocks: usize,
    /// Hard limit on blocks obtained from the allocator (default: unlimited).
    pub max_blocks: Option<usize>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            initial_blocks: 0,
            max_blocks: None,
        }
    }
}

impl StoreConfig {
    /// Parse and validate a JSON configuration. Missing fields take their
    /// default values.
    pub fn from_json_str(json: &str) -> Result<Self, EcsError> {
        let config: StoreConfig =
            serde_json::from_str(json).map_err(|e| EcsError::InvalidConfig {
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EcsError> {
        if self.block_size == 0 || self.block_size % BLOCK_ALIGN != 0 {
            return Err(EcsError::InvalidConfig {
                reason: format!(
                    "block_size {} is not a positive multiple of {BLOCK_ALIGN}",
                    self.block_size
                ),
            });
        }
        if let Some(max) = self.max_blocks {
            if self.initial_blocks > max {
                return Err(EcsError::InvalidConfig {
                    reason: format!(
                        "initial_blocks {} exceeds max_blocks {max}",
                        self.initial_blocks
                    ),
                });
            }
        }
        Ok(())
    }
}
