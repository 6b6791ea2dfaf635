//! OS template catalog.
//!
//! Maps each (backend, template) pair to the image it boots. Built-in
//! defaults cover the common Linux distributions; a JSON file can replace
//! or extend them at startup.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::spec::{BackendKind, OsTemplate};

/// Where an image comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ImageSource {
    /// Container registry reference, pulled by the engine.
    Registry { reference: String },
    /// Cloud image fetched over HTTP(S) into the local cache.
    Download { url: String, file_name: String },
}

/// One catalog row, as read from or written to JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CatalogEntry {
    pub backend: BackendKind,
    pub template: OsTemplate,
    pub source: ImageSource,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    images: HashMap<(BackendKind, OsTemplate), ImageSource>,
}

impl Catalog {
    pub fn empty() -> Self {
        Self {
            images: HashMap::new(),
        }
    }

    pub fn resolve(&self, backend: BackendKind, template: OsTemplate) -> Option<&ImageSource> {
        self.images.get(&(backend, template))
    }

    pub fn insert(&mut self, backend: BackendKind, template: OsTemplate, source: ImageSource) {
        self.images.insert((backend, template), source);
    }

    /// All entries, ordered by backend then template.
    pub fn entries(&self) -> Vec<CatalogEntry> {
        let mut entries: Vec<CatalogEntry> = self
            .images
            .iter()
            .map(|((backend, template), source)| CatalogEntry {
                backend: *backend,
                template: *template,
                source: source.clone(),
            })
            .collect();
        entries.sort_by_key(|e| (e.backend.as_str(), e.template.as_str()));
        entries
    }

    /// Overlay entries from a JSON array onto this catalog.
    pub fn merge_json(&mut self, json: &str) -> Result<()> {
        let entries: Vec<CatalogEntry> =
            serde_json::from_str(json).context("Failed to parse catalog")?;
        for entry in entries {
            self.insert(entry.backend, entry.template, entry.source);
        }
        Ok(())
    }

    /// Built-in defaults overlaid with the entries in `path`.
    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read catalog {}", path.display()))?;
        let mut catalog = Self::default();
        catalog.merge_json(&json)?;
        Ok(catalog)
    }
}

impl Default for Catalog {
    fn default() -> Self {
        let mut catalog = Self::empty();

        for (template, reference) in [
            (OsTemplate::Ubuntu, "ubuntu:20.04"),
            (OsTemplate::CentOs, "quay.io/centos/centos:stream9"),
            (OsTemplate::Fedora, "fedora:latest"),
        ] {
            catalog.insert(
                BackendKind::Container,
                template,
                ImageSource::Registry {
                    reference: reference.to_string(),
                },
            );
        }

        for (template, url, file_name) in [
            (
                OsTemplate::Ubuntu,
                "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.img",
                "ubuntu-noble.qcow2",
            ),
            (
                OsTemplate::CentOs,
                "https://cloud.centos.org/centos/10-stream/x86_64/images/CentOS-Stream-GenericCloud-10-latest.x86_64.qcow2",
                "centos-stream-10.qcow2",
            ),
            (
                OsTemplate::Fedora,
                "https://download.fedoraproject.org/pub/fedora/linux/releases/42/Cloud/x86_64/images/Fedora-Cloud-Base-Generic-42-1.1.x86_64.qcow2",
                "fedora-42.qcow2",
            ),
        ] {
            catalog.insert(
                BackendKind::Vm,
                template,
                ImageSource::Download {
                    url: url.to_string(),
                    file_name: file_name.to_string(),
                },
            );
        }

        catalog
    }
}
