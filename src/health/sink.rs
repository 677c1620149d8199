//! Publish targets for device health.

use crate::core::Health;
use crate::error::PublishError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// External write of a device's health value.
///
/// Failure is expected and non-fatal: the object addressed for a device is
/// often not there yet because the service owning it has not started.
#[async_trait]
pub trait HealthSink: Send + Sync {
    /// Write `health` to every object representing `device`.
    async fn set_device_health(&self, device: &str, health: Health) -> Result<(), PublishError>;
}

#[async_trait]
impl<S: HealthSink + ?Sized> HealthSink for Arc<S> {
    async fn set_device_health(&self, device: &str, health: Health) -> Result<(), PublishError> {
        (**self).set_device_health(device, health).await
    }
}

/// Publishes health into a directory tree owned by another service.
///
/// `<root>/<device>` is the device's object. If it is a regular file the
/// qualified health value is written into it. If it is a directory, every
/// regular file inside it is one object of the device and all of them are
/// written. Nothing is ever created: a missing object means its owner has not
/// come up yet.
#[derive(Clone, Debug)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    /// Publish under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the device objects.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, device: &str) -> Option<PathBuf> {
        // Device keys are single path components
        if device.is_empty() || device == "." || device == ".." || device.contains('/') {
            return None;
        }
        Some(self.root.join(device))
    }
}

#[async_trait]
impl HealthSink for DirectorySink {
    async fn set_device_health(&self, device: &str, health: Health) -> Result<(), PublishError> {
        let not_found = || PublishError::ObjectNotFound(device.to_string());
        let path = self.object_path(device).ok_or_else(not_found)?;
        let value = health.qualified();

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(PublishError::Transport(e.to_string())),
        };

        if !metadata.is_dir() {
            return tokio::fs::write(&path, &value)
                .await
                .map_err(|e| PublishError::Transport(e.to_string()));
        }

        let mut objects = Vec::new();
        let mut entries = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?
        {
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                objects.push(entry.path());
            }
        }
        if objects.is_empty() {
            return Err(not_found());
        }

        let total = objects.len();
        let mut failed = 0;
        for object in &objects {
            if let Err(e) = tokio::fs::write(object, &value).await {
                debug!(object = %object.display(), error = %e, "health write failed");
                failed += 1;
            }
        }
        match failed {
            0 => Ok(()),
            f if f == total => Err(PublishError::Transport(format!(
                "all {} health objects of '{}' rejected the write",
                total, device
            ))),
            _ => Err(PublishError::Partial { failed, total }),
        }
    }
}
