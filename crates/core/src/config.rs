//! Memory Tree Configuration
//!
//! Validated settings for the process-default managers, loaded from an
//! optional TOML file layered under `MEMTREE_*` environment variables.

use std::path::Path;
use std::sync::OnceLock;

use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, MemoryResult};

/// Environment variable prefix (`MEMTREE_USE_MMAP_ALLOCATOR=true`, ...)
pub const ENV_PREFIX: &str = "MEMTREE";

static PROCESS_CONFIG: OnceLock<MemoryConfig> = OnceLock::new();

/// Memory tree configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MemoryConfig {
    /// Serve the process-default pools from the page-mapped allocator
    #[garde(skip)]
    pub use_mmap_allocator: bool,

    /// Bytes all pools of one manager may hold together
    #[garde(range(min = 1))]
    pub process_quota_bytes: u64,

    /// Cap applied by `default_memory_pool` when the caller passes none
    #[garde(range(min = 1))]
    pub default_pool_cap_bytes: Option<u64>,

    /// Name of each manager's root pool
    #[garde(length(min = 1))]
    pub root_pool_name: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            use_mmap_allocator: false,
            process_quota_bytes: u64::MAX,
            default_pool_cap_bytes: None,
            root_pool_name: "root".to_string(),
        }
    }
}

impl MemoryConfig {
    /// Load configuration from an optional TOML file and the environment
    ///
    /// Environment variables win over file values. A missing file is not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::Configuration`] if a source cannot be parsed,
    /// or [`MemoryError::Validation`] if the result is out of range.
    pub fn load(path: Option<&Path>) -> MemoryResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let config: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;

        tracing::info!(
            "Loaded memory configuration (mmap: {}, quota: {} bytes)",
            config.use_mmap_allocator,
            config.process_quota_bytes
        );
        Ok(config)
    }

    /// Parse configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::Configuration`] on malformed TOML, or
    /// [`MemoryError::Validation`] if a value is out of range.
    pub fn from_toml_str(text: &str) -> MemoryResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::Validation`] naming the first invalid field.
    pub fn validate(&self) -> MemoryResult<()> {
        garde::Validate::validate(self, &())?;
        Ok(())
    }
}

/// Install the process-wide configuration
///
/// Must run before the first call to [`process_config`] (directly or through
/// the process-default managers).
///
/// # Errors
///
/// Returns [`MemoryError::Validation`] for an invalid configuration and
/// [`MemoryError::Configuration`] if a configuration is already installed.
pub fn configure_process(config: MemoryConfig) -> MemoryResult<()> {
    config.validate()?;
    PROCESS_CONFIG
        .set(config)
        .map_err(|_| MemoryError::config("process memory configuration is already installed"))
}

/// Process-wide configuration
///
/// Falls back to the environment on first use, and to defaults if the
/// environment cannot be loaded.
pub fn process_config() -> &'static MemoryConfig {
    PROCESS_CONFIG.get_or_init(|| {
        MemoryConfig::load(None).unwrap_or_else(|err| {
            tracing::warn!("Falling back to default memory configuration: {}", err);
            MemoryConfig::default()
        })
    })
}
