//! Resource registry and lifecycle state machine.
//!
//! The registry owns the canonical record of every resource. Each record
//! sits behind its own async mutex; callers hold a [`ResourceGuard`] for
//! the full duration of an operation, and every mutation goes through
//! [`ResourceGuard::apply`]. A read-only snapshot is republished after each
//! transition so listings never wait on a busy resource.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, RwLock as StdRwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;
use utoipa::ToSchema;

use crate::credential::CredentialHandle;
use crate::driver::{Endpoint, SubstrateState};
use crate::error::{Error, Operation, Result};
use crate::spec::{BackendKind, ResourceSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Provisioning,
    Created,
    Running,
    Stopped,
    Deleted,
    Failed,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Deleted | LifecycleState::Failed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Provisioning => "provisioning",
            LifecycleState::Created => "created",
            LifecycleState::Running => "running",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Deleted => "deleted",
            LifecycleState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A state change request.
#[derive(Debug, Clone)]
pub enum Transition {
    Provisioned {
        substrate_id: String,
        endpoint: Option<Endpoint>,
        credential: CredentialHandle,
    },
    Started {
        endpoint: Endpoint,
    },
    Stopped,
    Deleted,
    Failed {
        reason: String,
    },
    /// Substrate state reported by the driver.
    Observed(SubstrateState),
    CredentialDelivered,
}

impl Transition {
    fn operation(&self) -> Operation {
        match self {
            Transition::Provisioned { .. } | Transition::Failed { .. } => Operation::Provision,
            Transition::Started { .. } | Transition::CredentialDelivered => Operation::Start,
            Transition::Stopped => Operation::Stop,
            Transition::Deleted => Operation::Delete,
            Transition::Observed(_) => Operation::Inspect,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resource {
    name: String,
    spec: ResourceSpec,
    state: LifecycleState,
    substrate_id: Option<String>,
    endpoint: Option<Endpoint>,
    credential: Option<CredentialHandle>,
    credential_delivered: bool,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    failure: Option<String>,
}

/// Public, serializable view of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct ResourceView {
    pub name: String,
    pub backend: BackendKind,
    pub state: LifecycleState,
    pub spec: ResourceSpec,
    pub endpoint: Option<Endpoint>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl Resource {
    fn new(name: String, spec: ResourceSpec, created_at: DateTime<Utc>) -> Self {
        let lease = chrono::Duration::minutes(i64::from(spec.lease_minutes));
        Self {
            name,
            spec,
            state: LifecycleState::Provisioning,
            substrate_id: None,
            endpoint: None,
            credential: None,
            credential_delivered: false,
            created_at,
            expires_at: created_at + lease,
            failure: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &ResourceSpec {
        &self.spec
    }

    pub fn backend(&self) -> BackendKind {
        self.spec.backend
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn substrate_id(&self) -> Option<&str> {
        self.substrate_id.as_deref()
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub fn credential(&self) -> Option<&CredentialHandle> {
        self.credential.as_ref()
    }

    pub fn credential_delivered(&self) -> bool {
        self.credential_delivered
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn view(&self) -> ResourceView {
        ResourceView {
            name: self.name.clone(),
            backend: self.spec.backend,
            state: self.state,
            spec: self.spec.clone(),
            endpoint: self.endpoint.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            failure: self.failure.clone(),
        }
    }

    fn reject(&self, transition: &Transition) -> Error {
        Error::InvalidState {
            name: self.name.clone(),
            state: self.state,
            op: transition.operation(),
        }
    }

    /// The only place a record changes.
    fn apply(&mut self, transition: Transition) -> Result<()> {
        use LifecycleState::*;

        match (self.state, transition) {
            (
                Provisioning,
                Transition::Provisioned {
                    substrate_id,
                    endpoint,
                    credential,
                },
            ) => {
                self.substrate_id = Some(substrate_id);
                self.endpoint = endpoint;
                self.credential = Some(credential);
                self.state = Created;
            }
            (Provisioning, Transition::Failed { reason }) => {
                self.failure = Some(reason);
                self.state = Failed;
            }
            (Created | Stopped | Running, Transition::Started { endpoint }) => {
                self.endpoint = Some(endpoint);
                self.state = Running;
            }
            (Running, Transition::Stopped) => {
                // Container host ports are reassigned on every start.
                if self.spec.backend == BackendKind::Container {
                    self.endpoint = None;
                }
                self.state = Stopped;
            }
            (Created | Running | Stopped | Failed, Transition::Deleted) => {
                self.endpoint = None;
                self.state = Deleted;
            }
            (Created | Running | Stopped, Transition::Observed(observed)) => {
                match (self.state, observed) {
                    (_, SubstrateState::Missing) => {
                        self.endpoint = None;
                        self.state = Deleted;
                    }
                    (Running, SubstrateState::Stopped) => {
                        if self.spec.backend == BackendKind::Container {
                            self.endpoint = None;
                        }
                        self.state = Stopped;
                    }
                    // A running substrate without a known endpoint stays
                    // as recorded until an explicit start reports one.
                    (Created | Stopped, SubstrateState::Running) if self.endpoint.is_some() => {
                        self.state = Running;
                    }
                    _ => {}
                }
            }
            (Created | Running | Stopped, Transition::CredentialDelivered) => {
                self.credential_delivered = true;
            }
            (_, transition) => return Err(self.reject(&transition)),
        }
        Ok(())
    }
}

struct Slot {
    record: Arc<Mutex<Resource>>,
    snapshot: StdRwLock<ResourceView>,
}

impl Slot {
    fn publish(&self, view: ResourceView) {
        match self.snapshot.write() {
            Ok(mut s) => *s = view,
            Err(poisoned) => *poisoned.into_inner() = view,
        }
    }

    fn snapshot(&self) -> ResourceView {
        match self.snapshot.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Exclusive access to one resource record.
pub struct ResourceGuard {
    slot: Arc<Slot>,
    record: OwnedMutexGuard<Resource>,
}

impl ResourceGuard {
    pub fn apply(&mut self, transition: Transition) -> Result<()> {
        let from = self.record.state;
        self.record.apply(transition)?;
        if from != self.record.state {
            debug!(
                resource = %self.record.name,
                from = %from,
                to = %self.record.state,
                "State transition"
            );
        }
        self.slot.publish(self.record.view());
        Ok(())
    }
}

impl Deref for ResourceGuard {
    type Target = Resource;

    fn deref(&self) -> &Resource {
        &self.record
    }
}

#[derive(Default)]
struct Entries {
    slots: HashMap<String, Arc<Slot>>,
    /// Names handed out per timestamp base; never reused in this process.
    issued: HashMap<String, u32>,
}

#[derive(Default)]
pub struct Registry {
    entries: RwLock<Entries>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a `Provisioning` record under a fresh name and return it locked.
    pub async fn reserve(&self, spec: ResourceSpec, now: DateTime<Utc>) -> ResourceGuard {
        let mut entries = self.entries.write().await;

        let base = format!("{}-{}", spec.backend, now.format("%Y%m%d-%H%M%S"));
        let name = loop {
            let count = entries.issued.entry(base.clone()).or_insert(0);
            let candidate = if *count == 0 {
                base.clone()
            } else {
                format!("{}-{}", base, count)
            };
            *count += 1;
            if !entries.slots.contains_key(&candidate) {
                break candidate;
            }
        };

        let resource = Resource::new(name.clone(), spec, now);
        let slot = Arc::new(Slot {
            snapshot: StdRwLock::new(resource.view()),
            record: Arc::new(Mutex::new(resource)),
        });
        let record = Arc::clone(&slot.record).lock_owned().await;
        entries.slots.insert(name, Arc::clone(&slot));

        ResourceGuard { slot, record }
    }

    fn slot(entries: &Entries, name: &str) -> Result<Arc<Slot>> {
        entries
            .slots
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Wait for exclusive access to `name`.
    pub async fn lock(&self, name: &str) -> Result<ResourceGuard> {
        let slot = Self::slot(&*self.entries.read().await, name)?;
        let record = Arc::clone(&slot.record).lock_owned().await;
        if record.state == LifecycleState::Deleted {
            return Err(Error::NotFound(name.to_string()));
        }
        Ok(ResourceGuard { slot, record })
    }

    /// Exclusive access if nobody else holds the record right now.
    pub async fn try_lock(&self, name: &str) -> Result<Option<ResourceGuard>> {
        let slot = Self::slot(&*self.entries.read().await, name)?;
        let Ok(record) = Arc::clone(&slot.record).try_lock_owned() else {
            return Ok(None);
        };
        if record.state == LifecycleState::Deleted {
            return Err(Error::NotFound(name.to_string()));
        }
        Ok(Some(ResourceGuard { slot, record }))
    }

    /// Last published view of `name`, without waiting for its lock.
    pub async fn snapshot(&self, name: &str) -> Option<ResourceView> {
        let entries = self.entries.read().await;
        entries.slots.get(name).map(|s| s.snapshot())
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().await.slots.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn remove(&self, name: &str) {
        if self.entries.write().await.slots.remove(name).is_some() {
            debug!(resource = %name, "Record removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::OsTemplate;
    use chrono::TimeZone;

    fn spec(backend: BackendKind) -> ResourceSpec {
        ResourceSpec {
            backend,
            cpu_cores: 1,
            memory_gb: 1,
            storage_gb: 10,
            os_template: OsTemplate::Ubuntu,
            location: String::new(),
            lease_minutes: 5,
        }
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap()
    }

    fn endpoint(port: u16) -> Endpoint {
        Endpoint {
            host: "127.0.0.1".to_string(),
            port,
            user: "root".to_string(),
        }
    }

    fn provisioned() -> Transition {
        Transition::Provisioned {
            substrate_id: "sub".to_string(),
            endpoint: None,
            credential: CredentialHandle::from("h".to_string()),
        }
    }

    #[tokio::test]
    async fn test_names_are_stamped_and_disambiguated() {
        let registry = Registry::new();
        let a = registry.reserve(spec(BackendKind::Container), at()).await;
        let b = registry.reserve(spec(BackendKind::Container), at()).await;
        let c = registry.reserve(spec(BackendKind::Vm), at()).await;

        assert_eq!(a.name(), "container-20240309-140507");
        assert_eq!(b.name(), "container-20240309-140507-1");
        assert_eq!(c.name(), "vm-20240309-140507");
        assert_eq!(a.expires_at() - a.created_at(), chrono::Duration::minutes(5));
    }

    #[tokio::test]
    async fn test_names_not_reused_after_remove() {
        let registry = Registry::new();
        let a = registry.reserve(spec(BackendKind::Vm), at()).await;
        let first = a.name().to_string();
        drop(a);
        registry.remove(&first).await;

        let b = registry.reserve(spec(BackendKind::Vm), at()).await;
        assert_ne!(b.name(), first);
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let registry = Registry::new();
        let mut r = registry.reserve(spec(BackendKind::Container), at()).await;
        assert_eq!(r.state(), LifecycleState::Provisioning);

        r.apply(provisioned()).unwrap();
        assert_eq!(r.state(), LifecycleState::Created);
        assert_eq!(r.substrate_id(), Some("sub"));

        r.apply(Transition::Started { endpoint: endpoint(2222) }).unwrap();
        assert_eq!(r.state(), LifecycleState::Running);

        r.apply(Transition::Stopped).unwrap();
        assert_eq!(r.state(), LifecycleState::Stopped);
        assert!(r.endpoint().is_none());

        r.apply(Transition::Deleted).unwrap();
        assert_eq!(r.state(), LifecycleState::Deleted);
    }

    #[tokio::test]
    async fn test_vm_keeps_endpoint_when_stopped() {
        let registry = Registry::new();
        let mut r = registry.reserve(spec(BackendKind::Vm), at()).await;
        r.apply(Transition::Provisioned {
            substrate_id: "vm".to_string(),
            endpoint: Some(endpoint(40022)),
            credential: CredentialHandle::from("h".to_string()),
        })
        .unwrap();
        r.apply(Transition::Started { endpoint: endpoint(40022) }).unwrap();
        r.apply(Transition::Stopped).unwrap();
        assert_eq!(r.endpoint(), Some(&endpoint(40022)));
    }

    #[tokio::test]
    async fn test_illegal_transitions_rejected() {
        let registry = Registry::new();
        let mut r = registry.reserve(spec(BackendKind::Container), at()).await;

        assert!(matches!(
            r.apply(Transition::Started { endpoint: endpoint(1) }),
            Err(Error::InvalidState { state: LifecycleState::Provisioning, .. })
        ));
        assert!(r.apply(Transition::Stopped).is_err());

        r.apply(Transition::Failed { reason: "boom".into() }).unwrap();
        assert_eq!(r.state(), LifecycleState::Failed);
        assert_eq!(r.failure(), Some("boom"));
        assert!(r.apply(provisioned()).is_err());
        assert!(r.apply(Transition::Started { endpoint: endpoint(1) }).is_err());

        // Failed records can still be disposed of.
        r.apply(Transition::Deleted).unwrap();
        assert!(r.apply(Transition::Deleted).is_err());
    }

    #[tokio::test]
    async fn test_observed_missing_deletes() {
        let registry = Registry::new();
        let mut r = registry.reserve(spec(BackendKind::Container), at()).await;
        r.apply(provisioned()).unwrap();
        r.apply(Transition::Observed(SubstrateState::Missing)).unwrap();
        assert_eq!(r.state(), LifecycleState::Deleted);
    }

    #[tokio::test]
    async fn test_observed_stop_out_of_band() {
        let registry = Registry::new();
        let mut r = registry.reserve(spec(BackendKind::Container), at()).await;
        r.apply(provisioned()).unwrap();
        r.apply(Transition::Started { endpoint: endpoint(2) }).unwrap();
        r.apply(Transition::Observed(SubstrateState::Stopped)).unwrap();
        assert_eq!(r.state(), LifecycleState::Stopped);

        // Running again out of band, but the new port is unknown.
        r.apply(Transition::Observed(SubstrateState::Running)).unwrap();
        assert_eq!(r.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_snapshot_follows_transitions() {
        let registry = Registry::new();
        let mut r = registry.reserve(spec(BackendKind::Container), at()).await;
        let name = r.name().to_string();

        assert_eq!(
            registry.snapshot(&name).await.unwrap().state,
            LifecycleState::Provisioning
        );
        // Held by us, so others cannot lock it.
        assert!(registry.try_lock(&name).await.unwrap().is_none());

        r.apply(provisioned()).unwrap();
        assert_eq!(
            registry.snapshot(&name).await.unwrap().state,
            LifecycleState::Created
        );
        drop(r);

        assert!(registry.try_lock(&name).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lock_deleted_is_not_found() {
        let registry = Registry::new();
        let mut r = registry.reserve(spec(BackendKind::Container), at()).await;
        let name = r.name().to_string();
        r.apply(provisioned()).unwrap();
        r.apply(Transition::Deleted).unwrap();
        drop(r);

        assert!(matches!(registry.lock(&name).await, Err(Error::NotFound(_))));
        registry.remove(&name).await;
        assert!(matches!(registry.lock(&name).await, Err(Error::NotFound(_))));
        assert!(registry.names().await.is_empty());
    }
}
