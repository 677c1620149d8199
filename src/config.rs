//! Service configuration using Figment.
//!
//! Configuration is layered (lowest to highest precedence):
//! 1. Compiled-in defaults from [`crate::limits`]
//! 2. An optional TOML file (default: `config/device_health.toml`)
//! 3. Environment variables prefixed with `DEVICE_HEALTH_`, nested keys
//!    separated by a double underscore
//!
//! ```text
//! DEVICE_HEALTH_APPLICATION__LOG_LEVEL=debug
//! DEVICE_HEALTH_REGION__PATH=/run/device-health/region
//! DEVICE_HEALTH_RECONCILER__RETRY_INTERVAL=30s
//! DEVICE_HEALTH_INGEST__DEASSERTION_ENABLED=true
//! ```

use crate::error::ConfigError;
use crate::limits;
use crate::store::region::MIN_REGION_SIZE;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/device_health.toml";

/// Top-level service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Backing region settings
    #[serde(default)]
    pub region: RegionConfig,
    /// Per-device limits enforced by the store
    #[serde(default)]
    pub store: StoreConfig,
    /// Deferred publish retry settings
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    /// Inbound notification handling
    #[serde(default)]
    pub ingest: IngestConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "device-health-service".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Sizing of the memory-mapped region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionConfig {
    /// Backing file of the region
    pub path: PathBuf,
    /// Size in bytes of a freshly created region
    pub initial_size: u64,
    /// Bytes added per growth step
    pub grow_increment: u64,
    /// Hard ceiling; growth past it is fatal
    pub maximum_size: u64,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(limits::MAPPED_FILE_NAME),
            initial_size: limits::INITIAL_REGION_SIZE,
            grow_increment: limits::REGION_GROW_INCREMENT,
            maximum_size: limits::MAXIMUM_REGION_SIZE,
        }
    }
}

/// Limits on stored error ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Maximum active error ids per device and severity
    pub max_ids_per_device_severity: usize,
    /// Maximum error id length in bytes
    pub max_error_id_length: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_ids_per_device_severity: limits::MAX_ASSERTED_ERROR_IDS_PER_DEV_SEV,
            max_error_id_length: limits::MAX_ERROR_ID_LENGTH,
        }
    }
}

/// Deferred publish retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Interval of the retry timer while devices are deferred
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            retry_interval: limits::DEFERRED_UPDATE_INTERVAL,
        }
    }
}

/// Inbound notification configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Whether resolved log entries clear the matching error id
    pub deassertion_enabled: bool,
}

impl ServiceConfig {
    /// Load configuration from the default file location and environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path and validate it.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(ServiceConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DEVICE_HEALTH_").split("__"))
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Region sizes are non-zero, ordered, and large enough for the header
    /// - Store limits are non-zero
    /// - Retry interval is non-zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let region = &self.region;
        if region.initial_size < MIN_REGION_SIZE {
            return Err(ConfigError::Validation(format!(
                "region.initial_size {} is below the minimum of {} bytes",
                region.initial_size, MIN_REGION_SIZE
            )));
        }
        if region.grow_increment == 0 {
            return Err(ConfigError::Validation(
                "region.grow_increment must be > 0".to_string(),
            ));
        }
        if region.initial_size > region.maximum_size {
            return Err(ConfigError::Validation(format!(
                "region.initial_size {} exceeds region.maximum_size {}",
                region.initial_size, region.maximum_size
            )));
        }
        if region.maximum_size > u64::from(u32::MAX) {
            return Err(ConfigError::Validation(format!(
                "region.maximum_size {} exceeds the addressable limit of {} bytes",
                region.maximum_size,
                u32::MAX
            )));
        }

        if self.store.max_ids_per_device_severity == 0 {
            return Err(ConfigError::Validation(
                "store.max_ids_per_device_severity must be > 0".to_string(),
            ));
        }
        if self.store.max_error_id_length == 0 {
            return Err(ConfigError::Validation(
                "store.max_error_id_length must be > 0".to_string(),
            ));
        }

        if self.reconciler.retry_interval.is_zero() {
            return Err(ConfigError::Validation(
                "reconciler.retry_interval must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Validation(e.to_string()))
    }
}
