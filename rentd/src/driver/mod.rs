//! Backend drivers.
//!
//! A driver owns the substrate object behind a resource (a Docker
//! container or a QEMU virtual machine) and is the source of truth for
//! its actual state. The lifecycle manager only talks to drivers through
//! the [`Driver`] trait.

mod container;
mod vm;

pub use container::ContainerDriver;
pub use vm::{VmDriver, VmTools};

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::DriverResult;
use crate::image::ImageRef;
use crate::spec::{BackendKind, ResourceSpec};

/// Where a renter connects to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ssh -p {} {}@{}", self.port, self.user, self.host)
    }
}

/// State of a substrate object as observed by its driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubstrateState {
    Created,
    Running,
    Stopped,
    /// Removed out of band, or never existed.
    Missing,
}

/// Boot-time injection for a new substrate.
#[derive(Debug, Clone)]
pub struct BootConfig {
    /// OpenSSH public key line authorized for the login user.
    pub authorized_key: String,
    pub hostname: String,
}

#[derive(Debug, Clone)]
pub struct Provisioned {
    pub substrate_id: String,
    /// Known at provisioning time for some substrates, otherwise after start.
    pub endpoint: Option<Endpoint>,
}

#[async_trait]
pub trait Driver: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Create the substrate object without starting it.
    ///
    /// Fails with `AlreadyExists` if `name` is already provisioned.
    async fn provision(
        &self,
        name: &str,
        spec: &ResourceSpec,
        image: &ImageRef,
        boot: &BootConfig,
    ) -> DriverResult<Provisioned>;

    /// Start the substrate. Starting a running substrate returns its
    /// current endpoint.
    async fn start(&self, substrate_id: &str) -> DriverResult<Endpoint>;

    /// Stop the substrate. Stopping a stopped substrate is a no-op.
    async fn stop(&self, substrate_id: &str) -> DriverResult<()>;

    /// Force-stop and remove compute and storage. Unknown ids succeed.
    async fn delete(&self, substrate_id: &str) -> DriverResult<()>;

    async fn inspect(&self, substrate_id: &str) -> DriverResult<SubstrateState>;
}
