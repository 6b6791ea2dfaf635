//! Audit trail of lifecycle events.
//!
//! Every event is logged via tracing and kept in a bounded in-memory ring
//! that callers can page through with [`AuditLogger::recent`].

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use utoipa::ToSchema;

use crate::driver::Endpoint;
use crate::spec::ResourceSpec;

const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub level: AuditLevel,
    pub resource: String,
    pub message: String,
}

pub struct AuditLogger {
    events: Mutex<VecDeque<AuditEvent>>,
    capacity: usize,
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl AuditLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
            capacity: capacity.max(1),
        }
    }

    pub async fn log(&self, level: AuditLevel, resource: &str, message: impl Into<String>) {
        let message = message.into();

        match level {
            AuditLevel::Info => {
                tracing::info!(target: "rentd::audit", resource = %resource, "{}", message)
            }
            AuditLevel::Warn => {
                tracing::warn!(target: "rentd::audit", resource = %resource, "{}", message)
            }
            AuditLevel::Error => {
                tracing::error!(target: "rentd::audit", resource = %resource, "{}", message)
            }
        }

        let mut events = self.events.lock().await;
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(AuditEvent {
            timestamp: Utc::now(),
            level,
            resource: resource.to_string(),
            message,
        });
    }

    /// Up to `limit` most recent events, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        let events = self.events.lock().await;
        events.iter().rev().take(limit).cloned().collect()
    }

    // === Resource Events ===

    pub async fn resource_created(&self, name: &str, spec: &ResourceSpec) {
        self.log(
            AuditLevel::Info,
            name,
            format!(
                "{} '{}' created ({} cores, {} GB RAM, {}, {} min lease)",
                spec.backend,
                name,
                spec.cpu_cores,
                spec.memory_gb,
                spec.os_template,
                spec.lease_minutes
            ),
        )
        .await;
    }

    pub async fn provision_failed(&self, name: &str, error: &str) {
        self.log(
            AuditLevel::Error,
            name,
            format!("Provisioning '{}' failed: {}", name, error),
        )
        .await;
    }

    pub async fn resource_started(&self, name: &str, endpoint: &Endpoint) {
        self.log(
            AuditLevel::Info,
            name,
            format!("'{}' started, reachable via {}", name, endpoint),
        )
        .await;
    }

    pub async fn resource_stopped(&self, name: &str) {
        self.log(AuditLevel::Info, name, format!("'{}' stopped", name))
            .await;
    }

    pub async fn resource_deleted(&self, name: &str, reason: &str) {
        self.log(
            AuditLevel::Info,
            name,
            format!("'{}' deleted ({})", name, reason),
        )
        .await;
    }

    // === Lease Events ===

    pub async fn lease_expired(&self, name: &str) {
        self.log(
            AuditLevel::Warn,
            name,
            format!("Lease for '{}' expired, tearing down", name),
        )
        .await;
    }

    pub async fn teardown_failed(&self, name: &str, error: &str) {
        self.log(
            AuditLevel::Error,
            name,
            format!("Teardown of '{}' failed: {}", name, error),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ring_is_bounded_and_newest_first() {
        let audit = AuditLogger::with_capacity(3);
        for i in 0..5 {
            audit
                .log(AuditLevel::Info, &format!("r{}", i), "event")
                .await;
        }

        let recent = audit.recent(10).await;
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].resource, "r4");
        assert_eq!(recent[2].resource, "r2");

        assert_eq!(audit.recent(1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_domain_events() {
        let audit = AuditLogger::new();
        audit.teardown_failed("vm-1", "engine down").await;

        let recent = audit.recent(1).await;
        assert_eq!(recent[0].level, AuditLevel::Error);
        assert!(recent[0].message.contains("engine down"));
    }
}
