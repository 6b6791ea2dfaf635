//! rentd - short-lived compute rentals.
//!
//! Provisions containers and virtual machines on demand, hands out SSH
//! credentials and tears every resource down once its lease elapses.

pub mod audit;
pub mod catalog;
pub mod config;
pub mod credential;
pub mod driver;
pub mod error;
pub mod image;
pub mod lease;
pub mod manager;
pub mod registry;
pub mod rest;
pub mod spec;

pub use audit::{AuditEvent, AuditLevel, AuditLogger};
pub use catalog::{Catalog, CatalogEntry, ImageSource};
pub use config::Config;
pub use credential::{
    CredentialHandle, CredentialIssuer, IssuedCredential, KeyGenerator, KeyPair, SshKeygen,
};
pub use driver::{
    BootConfig, ContainerDriver, Driver, Endpoint, Provisioned, SubstrateState, VmDriver, VmTools,
};
pub use error::{DriverError, DriverResult, Error, Operation, Result};
pub use image::{ImageCache, ImageRef};
pub use lease::{LeaseInfo, LeaseScheduler};
pub use manager::{ActionOutcome, LifecycleManager, Verb};
pub use registry::{LifecycleState, Registry, Resource, ResourceGuard, ResourceView, Transition};
pub use spec::{BackendKind, OsTemplate, ResourceSpec};
