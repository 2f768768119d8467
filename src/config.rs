//! Engine configuration.
//!
//! [`EngineConfig`] is a plain struct with defaults for every field, so it can be
//! built in code with struct-update syntax or loaded from a JSON file in which every
//! key is optional:
//!
//! ```
//! use ironframe::config::{Backend, EngineConfig};
//!
//! let config = EngineConfig {
//!     num_workers: 4,
//!     backend: Backend::Distributed,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use crate::error::{EngineError, Result};
use crate::index::PartitionOptions;
use crate::tiling::DEFAULT_TILE_BYTES;
use serde::{Deserialize, Serialize};
use std::fs::read_to_string;
use std::path::{Path, PathBuf};

/// Default partition size hint: 128 MiB.
pub const DEFAULT_PARTITION_BYTES: usize = 128 << 20;

/// Default number of transient-failure retries per partition.
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Which executor backend runs the tasks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Local,
    Distributed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Worker threads (local) or cluster workers (distributed).
    pub num_workers: usize,
    /// Target bytes per partition.
    pub partition_size_hint: usize,
    pub backend: Backend,
    /// Retries per partition after transient failures.
    pub retry_limit: u32,
    /// Shared directory for compiled kernels; process-local cache when unset.
    pub compile_cache_location: Option<PathBuf>,
    /// Fixed frames per partition, overriding `partition_size_hint`.
    pub frames_per_partition: Option<usize>,
    /// Target bytes per tile.
    pub tile_size_hint: usize,
    /// Cap on outstanding distributed tasks (default `2 * num_workers`).
    pub max_in_flight: Option<usize>,
    /// Idle read buffers kept for reuse (default `2 * num_workers`).
    pub read_pool_blocks: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            partition_size_hint: DEFAULT_PARTITION_BYTES,
            backend: Backend::Local,
            retry_limit: DEFAULT_RETRY_LIMIT,
            compile_cache_location: None,
            frames_per_partition: None,
            tile_size_hint: DEFAULT_TILE_BYTES,
            max_in_flight: None,
            read_pool_blocks: None,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Json`] for malformed JSON and [`EngineError::Config`] for
    /// out-of-range values.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid configuration.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&read_to_string(path)?)
    }

    /// # Errors
    ///
    /// Returns [`EngineError::Config`] naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("num_workers", self.num_workers),
            ("partition_size_hint", self.partition_size_hint),
            ("tile_size_hint", self.tile_size_hint),
            ("frames_per_partition", self.frames_per_partition.unwrap_or(1)),
            ("max_in_flight", self.max_in_flight.unwrap_or(1)),
            ("read_pool_blocks", self.read_pool_blocks.unwrap_or(1)),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(EngineError::Config(format!("{name} must be positive")));
        }
        Ok(())
    }

    #[must_use]
    pub fn partition_options(&self) -> PartitionOptions {
        PartitionOptions {
            target_bytes: self.partition_size_hint,
            frames_per_partition: self.frames_per_partition,
            tile_bytes: self.tile_size_hint,
        }
    }

    #[must_use]
    pub fn effective_max_in_flight(&self) -> usize {
        self.max_in_flight.unwrap_or(2 * self.num_workers)
    }

    #[must_use]
    pub fn effective_read_pool_blocks(&self) -> usize {
        self.read_pool_blocks.unwrap_or(2 * self.num_workers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            EngineConfig::from_json(r#"{ "num_workers": 2, "backend": "distributed", "retry_limit": 5 }"#).unwrap();
        assert_eq!(config.num_workers, 2);
        assert_eq!(config.backend, Backend::Distributed);
        assert_eq!(config.retry_limit, 5);
        assert_eq!(config.partition_size_hint, DEFAULT_PARTITION_BYTES);
        assert_eq!(config.effective_max_in_flight(), 4);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            EngineConfig::from_json(r#"{ "num_workers": 0 }"#),
            Err(EngineError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_json(r#"{ "workers": 2 }"#),
            Err(EngineError::Json(_))
        ));
    }
}
