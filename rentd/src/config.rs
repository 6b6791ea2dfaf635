//! Runtime configuration shared by the library components.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Root of all on-disk state.
    pub data_dir: PathBuf,
    /// Host name or address renters connect to.
    pub public_host: String,
    /// Start resources right after provisioning.
    pub auto_start: bool,
    /// Grace period for a guest to power off before it is killed.
    pub stop_timeout: Duration,
    /// Timeout for image downloads.
    pub download_timeout: Duration,
}

impl Config {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            public_host: "127.0.0.1".to_string(),
            auto_start: false,
            stop_timeout: Duration::from_secs(30),
            download_timeout: Duration::from_secs(3600),
        }
    }

    pub fn images_dir(&self) -> PathBuf {
        self.data_dir.join("images")
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.data_dir.join("credentials")
    }

    pub fn vm_dir(&self) -> PathBuf {
        self.data_dir.join("vm")
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.data_dir.join("volumes")
    }

    /// Create the directory layout under `data_dir`.
    pub async fn prepare(&self) -> Result<()> {
        for dir in [
            self.images_dir(),
            self.credentials_dir(),
            self.vm_dir(),
            self.volumes_dir(),
        ] {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}
