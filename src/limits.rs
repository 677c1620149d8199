//! Shared hard limits for the persistent region and inbound notifications.
//!
//! These are the compiled-in defaults; every one of them can be overridden
//! through [`crate::config::ServiceConfig`].

use crate::error::IngestError;
use std::time::Duration;

/// Default path of the backing region file.
pub const MAPPED_FILE_NAME: &str = "/tmp/device-health-service-shmem";
/// Default size of a freshly created region (64 KiB).
pub const INITIAL_REGION_SIZE: u64 = 64 * 1024;
/// Default step by which the region grows when it runs out of space (64 KiB).
pub const REGION_GROW_INCREMENT: u64 = 64 * 1024;
/// Default hard ceiling on the region size (1 MiB).
pub const MAXIMUM_REGION_SIZE: u64 = 1024 * 1024;
/// Default cap on active error ids per device and severity.
pub const MAX_ASSERTED_ERROR_IDS_PER_DEV_SEV: usize = 50;
/// Default maximum error id length in bytes.
pub const MAX_ERROR_ID_LENGTH: usize = 100;
/// Maximum device key length in bytes.
pub const MAX_DEVICE_KEY_LENGTH: usize = 255;
/// Default interval between deferred publish retries.
pub const DEFERRED_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

/// Validate an inbound error id against the configured length limit.
pub fn validate_error_id(error_id: &str, max_len: usize) -> Result<(), IngestError> {
    if error_id.is_empty() {
        return Err(IngestError::EmptyErrorId);
    }
    if error_id.len() > max_len {
        return Err(IngestError::ErrorIdTooLong {
            length: error_id.len(),
            max: max_len,
        });
    }
    Ok(())
}

/// Validate an inbound device key.
pub fn validate_device_key(device: &str) -> Result<(), IngestError> {
    if device.is_empty() {
        return Err(IngestError::MissingDevice);
    }
    if device.len() > MAX_DEVICE_KEY_LENGTH {
        return Err(IngestError::DeviceTooLong {
            length: device.len(),
            max: MAX_DEVICE_KEY_LENGTH,
        });
    }
    Ok(())
}
