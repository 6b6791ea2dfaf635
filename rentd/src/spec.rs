//! Resource requests.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::catalog::Catalog;
use crate::error::{Error, Result};

/// Execution substrate a resource runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Container,
    Vm,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Container => "container",
            BackendKind::Vm => "vm",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "container" => Ok(BackendKind::Container),
            "vm" | "virtual-machine" => Ok(BackendKind::Vm),
            other => Err(Error::InvalidSpec(format!("unknown backend '{other}'"))),
        }
    }
}

/// Operating system a resource boots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum OsTemplate {
    Ubuntu,
    #[serde(rename = "CentOS")]
    CentOs,
    Fedora,
    #[serde(rename = "Windows Server")]
    WindowsServer,
}

impl OsTemplate {
    pub const ALL: [OsTemplate; 4] = [
        OsTemplate::Ubuntu,
        OsTemplate::CentOs,
        OsTemplate::Fedora,
        OsTemplate::WindowsServer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OsTemplate::Ubuntu => "Ubuntu",
            OsTemplate::CentOs => "CentOS",
            OsTemplate::Fedora => "Fedora",
            OsTemplate::WindowsServer => "Windows Server",
        }
    }
}

impl fmt::Display for OsTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OsTemplate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        OsTemplate::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::InvalidSpec(format!("unsupported OS template '{s}'")))
    }
}

/// An immutable request for a rented resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ResourceSpec {
    pub backend: BackendKind,
    pub cpu_cores: u32,
    pub memory_gb: u32,
    /// Disk size for virtual machines; containers ignore it.
    #[serde(default)]
    pub storage_gb: u32,
    pub os_template: OsTemplate,
    /// Opaque placement tag.
    #[serde(default)]
    pub location: String,
    pub lease_minutes: u32,
}

impl ResourceSpec {
    /// Reject the spec unless every field is usable and the template
    /// resolves to an image for the requested backend.
    pub fn validate(&self, catalog: &Catalog) -> Result<()> {
        if self.cpu_cores == 0 {
            return Err(Error::InvalidSpec("cpu_cores must be at least 1".into()));
        }
        if self.memory_gb == 0 {
            return Err(Error::InvalidSpec("memory_gb must be at least 1".into()));
        }
        if self.lease_minutes == 0 {
            return Err(Error::InvalidSpec(
                "lease_minutes must be at least 1".into(),
            ));
        }
        if self.backend == BackendKind::Vm && self.storage_gb == 0 {
            return Err(Error::InvalidSpec(
                "storage_gb is required for virtual machines".into(),
            ));
        }
        if catalog.resolve(self.backend, self.os_template).is_none() {
            return Err(Error::InvalidSpec(format!(
                "{} is not available as a {} image",
                self.os_template, self.backend
            )));
        }
        Ok(())
    }
}
