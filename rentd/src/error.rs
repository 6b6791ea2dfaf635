//! Error types for the lifecycle manager and its backend drivers.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::registry::LifecycleState;

/// Operation a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Provision,
    Start,
    Stop,
    Delete,
    Inspect,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Provision => "provision",
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Delete => "delete",
            Operation::Inspect => "inspect",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by the lifecycle manager.
#[derive(Debug, Error)]
pub enum Error {
    /// The resource spec was rejected before any side effect.
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// The OS image could not be resolved or fetched.
    #[error("image unavailable for {template}: {reason}")]
    ImageUnavailable { template: String, reason: String },

    /// A backend driver call failed.
    #[error("{op} failed for {name}: {source}")]
    Backend {
        op: Operation,
        name: String,
        #[source]
        source: DriverError,
    },

    /// Unknown or already deleted resource.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Unknown or revoked credential handle.
    #[error("credential not found")]
    CredentialNotFound,

    /// The requested operation is not allowed in the current state.
    #[error("cannot {op} {name} while {state}")]
    InvalidState {
        name: String,
        state: LifecycleState,
        op: Operation,
    },

    /// Internal error.
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    pub fn backend(op: Operation, name: &str, source: DriverError) -> Self {
        Error::Backend {
            op,
            name: name.to_string(),
            source,
        }
    }
}

/// Result type for lifecycle operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by a backend driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("substrate already exists: {0}")]
    AlreadyExists(String),

    #[error("substrate not found: {0}")]
    NotFound(String),

    #[error("docker engine: {0}")]
    Engine(#[from] bollard::errors::Error),

    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Result type for driver operations.
pub type DriverResult<T> = std::result::Result<T, DriverError>;
