//! SSH credentials.
//!
//! Every resource gets its own ed25519 keypair. The public half is injected
//! into the substrate at boot; the private half is written under the
//! credentials directory and handed out by an opaque handle.

use std::collections::HashMap;
use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{Error, Result};

const KEY_FILE: &str = "id_ed25519";

/// Opaque reference to a stored private key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct CredentialHandle(String);

impl CredentialHandle {
    fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CredentialHandle {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for CredentialHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// OpenSSH formatted keypair.
#[derive(Clone)]
pub struct KeyPair {
    pub public_key: String,
    pub private_key: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct IssuedCredential {
    pub public_key: String,
    pub handle: CredentialHandle,
}

#[async_trait]
pub trait KeyGenerator: Send + Sync {
    async fn generate(&self, comment: &str) -> anyhow::Result<KeyPair>;
}

/// Generates keys with the system `ssh-keygen`.
pub struct SshKeygen {
    bin: String,
    scratch_dir: PathBuf,
}

impl SshKeygen {
    pub fn new(scratch_dir: PathBuf) -> Self {
        Self {
            bin: "ssh-keygen".to_string(),
            scratch_dir,
        }
    }
}

#[async_trait]
impl KeyGenerator for SshKeygen {
    async fn generate(&self, comment: &str) -> anyhow::Result<KeyPair> {
        let work = self.scratch_dir.join(format!(".keygen-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&work)
            .await
            .context("Failed to create keygen directory")?;
        tokio::fs::set_permissions(&work, std::fs::Permissions::from_mode(0o700)).await?;

        let key_path = work.join(KEY_FILE);
        let result = async {
            let output = Command::new(&self.bin)
                .args(["-q", "-t", "ed25519", "-N", "", "-C", comment, "-f"])
                .arg(&key_path)
                .output()
                .await
                .context("Failed to run ssh-keygen")?;
            if !output.status.success() {
                return Err(anyhow!(
                    "ssh-keygen failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                ));
            }

            let private_key = tokio::fs::read(&key_path).await?;
            let public_key = tokio::fs::read_to_string(key_path.with_extension("pub")).await?;
            Ok(KeyPair {
                public_key: public_key.trim().to_string(),
                private_key,
            })
        }
        .await;

        let _ = tokio::fs::remove_dir_all(&work).await;
        result
    }
}

pub struct CredentialIssuer {
    dir: PathBuf,
    generator: Arc<dyn KeyGenerator>,
    handles: RwLock<HashMap<CredentialHandle, String>>,
}

impl CredentialIssuer {
    pub fn new(dir: PathBuf, generator: Arc<dyn KeyGenerator>) -> Self {
        Self {
            dir,
            generator,
            handles: RwLock::new(HashMap::new()),
        }
    }

    fn key_dir(&self, resource: &str) -> PathBuf {
        self.dir.join(resource)
    }

    /// Generate and store a keypair for `resource`.
    pub async fn issue(&self, resource: &str) -> Result<IssuedCredential> {
        let pair = self
            .generator
            .generate(&format!("rentd@{}", resource))
            .await
            .map_err(|e| Error::Internal(format!("key generation failed: {:#}", e)))?;

        self.store(resource, &pair.private_key)
            .await
            .map_err(|e| Error::Internal(format!("failed to store credential: {:#}", e)))?;

        let handle = CredentialHandle::generate();
        self.handles
            .write()
            .await
            .insert(handle.clone(), resource.to_string());

        info!(resource = %resource, "Credential issued");
        Ok(IssuedCredential {
            public_key: pair.public_key,
            handle,
        })
    }

    async fn store(&self, resource: &str, private_key: &[u8]) -> anyhow::Result<()> {
        let dir = self.key_dir(resource);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).await?;

        let path = dir.join(KEY_FILE);
        tokio::fs::write(&path, private_key).await?;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        debug!(path = %path.display(), "Private key written");
        Ok(())
    }

    /// Private key bytes for `handle`.
    pub async fn retrieve(&self, handle: &CredentialHandle) -> Result<Vec<u8>> {
        let resource = self
            .handles
            .read()
            .await
            .get(handle)
            .cloned()
            .ok_or(Error::CredentialNotFound)?;

        tokio::fs::read(self.key_dir(&resource).join(KEY_FILE))
            .await
            .map_err(|_| Error::CredentialNotFound)
    }

    /// Forget every handle for `resource` and delete its key material.
    pub async fn revoke(&self, resource: &str) {
        self.handles.write().await.retain(|_, r| r != resource);

        let dir = self.key_dir(resource);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(resource = %resource, "Credential revoked"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(resource = %resource, error = %e, "Failed to remove credential"),
        }
    }
}
