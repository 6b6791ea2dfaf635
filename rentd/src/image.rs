//! Image cache.
//!
//! Container images are resolved to registry references and left for the
//! engine to pull. VM cloud images are downloaded once into the images
//! directory and reused by every VM booting the same template.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{Catalog, ImageSource};
use crate::error::{Error, Result};
use crate::spec::{BackendKind, OsTemplate};

/// A locally usable image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    /// Registry reference for the container engine.
    Registry(String),
    /// Cached base image on disk.
    File(PathBuf),
}

impl ImageRef {
    pub fn reference(&self) -> Option<&str> {
        match self {
            ImageRef::Registry(r) => Some(r),
            ImageRef::File(_) => None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            ImageRef::Registry(_) => None,
            ImageRef::File(p) => Some(p),
        }
    }
}

pub struct ImageCache {
    dir: PathBuf,
    catalog: Arc<Catalog>,
    client: reqwest::Client,
    /// One lock per cached file name.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ImageCache {
    pub fn new(
        dir: PathBuf,
        catalog: Arc<Catalog>,
        download_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(download_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            dir,
            catalog,
            client,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Make sure the image for `template` on `backend` is available locally.
    pub async fn ensure(&self, template: OsTemplate, backend: BackendKind) -> Result<ImageRef> {
        let source = self
            .catalog
            .resolve(backend, template)
            .ok_or_else(|| Error::ImageUnavailable {
                template: template.to_string(),
                reason: format!("no {} image in catalog", backend),
            })?;

        match source {
            ImageSource::Registry { reference } => Ok(ImageRef::Registry(reference.clone())),
            ImageSource::Download { url, file_name } => {
                let path = self
                    .fetch(url, file_name)
                    .await
                    .map_err(|e| Error::ImageUnavailable {
                        template: template.to_string(),
                        reason: format!("{:#}", e),
                    })?;
                Ok(ImageRef::File(path))
            }
        }
    }

    async fn lock_for(&self, file_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(file_name.to_string()).or_default())
    }

    async fn fetch(&self, url: &str, file_name: &str) -> anyhow::Result<PathBuf> {
        if file_name.is_empty() || file_name.contains('/') || file_name.starts_with('.') {
            return Err(anyhow!("invalid image file name '{}'", file_name));
        }

        let lock = self.lock_for(file_name).await;
        let _guard = lock.lock().await;

        let path = self.dir.join(file_name);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(image = %path.display(), "Image cache hit");
            return Ok(path);
        }

        let tmp_dir = self.dir.join(".tmp");
        tokio::fs::create_dir_all(&tmp_dir)
            .await
            .context("Failed to create temp directory")?;
        let tmp_file = tmp_dir.join(format!("{}.part", Uuid::new_v4()));

        info!(url = %url, image = %path.display(), "Downloading image");

        match self.download(url, &tmp_file).await {
            Ok(bytes) => {
                tokio::fs::rename(&tmp_file, &path)
                    .await
                    .context("Failed to move image into cache")?;
                info!(image = %path.display(), bytes = bytes, "Image cached");
                Ok(path)
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Image download failed");
                let _ = tokio::fs::remove_file(&tmp_file).await;
                Err(e)
            }
        }
    }

    async fn download(&self, url: &str, dest: &Path) -> anyhow::Result<u64> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to start HTTP request")?;

        if !response.status().is_success() {
            return Err(anyhow!("HTTP request failed: {}", response.status()));
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .context("Failed to create temp file")?;

        let mut stream = response.bytes_stream();
        let mut bytes_downloaded: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Failed to read HTTP chunk")?;
            file.write_all(&chunk).await?;
            bytes_downloaded += chunk.len() as u64;
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(bytes_downloaded)
    }
}
