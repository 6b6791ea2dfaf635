//! Lifecycle manager.
//!
//! Sequences image resolution, credential issuance, driver calls and lease
//! timers for every resource. All operations on one resource run under its
//! registry lock, so manual verbs and lease expiry never interleave.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use crate::audit::{AuditEvent, AuditLogger};
use crate::catalog::Catalog;
use crate::config::Config;
use crate::credential::{CredentialHandle, CredentialIssuer, KeyGenerator};
use crate::driver::{BootConfig, Driver, Endpoint};
use crate::error::{Error, Operation, Result};
use crate::image::ImageCache;
use crate::lease::{LeaseInfo, LeaseScheduler};
use crate::registry::{LifecycleState, Registry, ResourceGuard, ResourceView, Transition};
use crate::spec::{BackendKind, ResourceSpec};

/// Manual operations on an existing resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Start,
    Stop,
    Delete,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verb::Start => "start",
            Verb::Stop => "stop",
            Verb::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Result of a manual verb.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ActionOutcome {
    pub resource: ResourceView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,
    /// Set only on the first successful start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<CredentialHandle>,
}

impl ActionOutcome {
    fn new(resource: ResourceView) -> Self {
        Self {
            endpoint: resource.endpoint.clone(),
            resource,
            credential: None,
        }
    }
}

struct Inner {
    registry: Registry,
    images: ImageCache,
    credentials: CredentialIssuer,
    leases: LeaseScheduler,
    drivers: HashMap<BackendKind, Arc<dyn Driver>>,
    catalog: Arc<Catalog>,
    audit: Arc<AuditLogger>,
    auto_start: bool,
}

#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<Inner>,
}

impl LifecycleManager {
    pub fn new(
        config: &Config,
        catalog: Arc<Catalog>,
        drivers: Vec<Arc<dyn Driver>>,
        keygen: Arc<dyn KeyGenerator>,
        audit: Arc<AuditLogger>,
    ) -> anyhow::Result<Self> {
        let images = ImageCache::new(
            config.images_dir(),
            Arc::clone(&catalog),
            config.download_timeout,
        )?;
        let credentials = CredentialIssuer::new(config.credentials_dir(), keygen);
        let drivers = drivers.into_iter().map(|d| (d.kind(), d)).collect();

        Ok(Self {
            inner: Arc::new(Inner {
                registry: Registry::new(),
                images,
                credentials,
                leases: LeaseScheduler::new(),
                drivers,
                catalog,
                audit,
                auto_start: config.auto_start,
            }),
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    /// Validate `spec`, provision the resource and arm its lease.
    pub async fn create(&self, spec: ResourceSpec) -> Result<ResourceView> {
        let inner = &self.inner;
        spec.validate(&inner.catalog)?;
        let driver = inner.driver(spec.backend)?;

        let mut guard = inner.registry.reserve(spec, Utc::now()).await;
        let name = guard.name().to_string();
        info!(resource = %name, backend = %guard.backend(), "Provisioning resource");

        if let Err(e) = inner.provision(&mut guard, driver.as_ref()).await {
            error!(resource = %name, error = %e, "Provisioning failed");
            if let Err(apply_err) = guard.apply(Transition::Failed {
                reason: e.to_string(),
            }) {
                warn!(resource = %name, error = %apply_err, "Could not record failure");
            }
            inner.credentials.revoke(&name).await;
            inner.audit.provision_failed(&name, &e.to_string()).await;
            return Err(e);
        }

        let remaining = (guard.expires_at() - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.arm_lease(&name, remaining).await;
        inner.audit.resource_created(&name, guard.spec()).await;

        if inner.auto_start {
            if let Err(e) = inner.start_locked(&mut guard, driver.as_ref()).await {
                warn!(resource = %name, error = %e, "Auto-start failed");
            }
        }

        Ok(guard.view())
    }

    async fn arm_lease(&self, name: &str, duration: Duration) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let armed = self
            .inner
            .leases
            .arm(name, duration, move |name| async move {
                if let Some(inner) = weak.upgrade() {
                    inner.expire(&name).await;
                }
            })
            .await;
        if !armed {
            warn!(resource = %name, "Lease was already armed");
        }
    }

    /// Apply a manual verb to `name`.
    pub async fn action(&self, name: &str, verb: Verb) -> Result<ActionOutcome> {
        let inner = &self.inner;
        let mut guard = inner.registry.lock(name).await?;
        let driver = inner.driver(guard.backend())?;

        debug!(resource = %name, verb = %verb, state = %guard.state(), "Applying action");
        match verb {
            Verb::Start => inner.start_locked(&mut guard, driver.as_ref()).await,
            Verb::Stop => inner.stop_locked(&mut guard, driver.as_ref()).await,
            Verb::Delete => inner.delete_locked(guard, driver.as_ref()).await,
        }
    }

    /// All live resources, reconciled with their drivers where possible.
    pub async fn list(&self) -> Vec<ResourceView> {
        let names = self.inner.registry.names().await;
        let views = join_all(names.iter().map(|name| self.inner.observe(name))).await;

        let mut views: Vec<ResourceView> = views.into_iter().flatten().collect();
        views.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        views
    }

    /// One resource, reconciled with its driver.
    pub async fn get(&self, name: &str) -> Result<ResourceView> {
        let inner = &self.inner;
        let mut guard = inner.registry.lock(name).await?;
        inner.reconcile(&mut guard).await;
        if guard.state() == LifecycleState::Deleted {
            return Err(Error::NotFound(name.to_string()));
        }
        Ok(guard.view())
    }

    pub async fn get_credential(&self, handle: &CredentialHandle) -> Result<Vec<u8>> {
        self.inner.credentials.retrieve(handle).await
    }

    pub async fn events(&self, limit: usize) -> Vec<AuditEvent> {
        self.inner.audit.recent(limit).await
    }

    pub async fn leases(&self) -> Vec<LeaseInfo> {
        self.inner.leases.active().await
    }

    /// Drop pending leases. Substrates are left as they are.
    pub async fn shutdown(&self) {
        info!("Shutting down lifecycle manager");
        self.inner.leases.shutdown().await;
    }
}

impl Inner {
    fn driver(&self, backend: BackendKind) -> Result<Arc<dyn Driver>> {
        self.drivers
            .get(&backend)
            .cloned()
            .ok_or_else(|| Error::InvalidSpec(format!("{} backend is not enabled", backend)))
    }

    async fn provision(&self, guard: &mut ResourceGuard, driver: &dyn Driver) -> Result<()> {
        let name = guard.name().to_string();
        let spec = guard.spec().clone();

        let image = self.images.ensure(spec.os_template, spec.backend).await?;
        let issued = self.credentials.issue(&name).await?;

        let boot = BootConfig {
            authorized_key: issued.public_key,
            hostname: name.clone(),
        };
        let provisioned = driver
            .provision(&name, &spec, &image, &boot)
            .await
            .map_err(|e| Error::backend(Operation::Provision, &name, e))?;

        guard.apply(Transition::Provisioned {
            substrate_id: provisioned.substrate_id,
            endpoint: provisioned.endpoint,
            credential: issued.handle,
        })?;
        info!(resource = %name, "Resource provisioned");
        Ok(())
    }

    fn substrate_id(guard: &ResourceGuard, op: Operation) -> Result<String> {
        guard
            .substrate_id()
            .map(str::to_string)
            .ok_or_else(|| Error::InvalidState {
                name: guard.name().to_string(),
                state: guard.state(),
                op,
            })
    }

    async fn start_locked(
        &self,
        guard: &mut ResourceGuard,
        driver: &dyn Driver,
    ) -> Result<ActionOutcome> {
        let name = guard.name().to_string();
        match guard.state() {
            LifecycleState::Running if guard.endpoint().is_some() => {}
            LifecycleState::Created | LifecycleState::Stopped | LifecycleState::Running => {
                let id = Self::substrate_id(guard, Operation::Start)?;
                let endpoint = driver
                    .start(&id)
                    .await
                    .map_err(|e| Error::backend(Operation::Start, &name, e))?;
                guard.apply(Transition::Started {
                    endpoint: endpoint.clone(),
                })?;
                self.audit.resource_started(&name, &endpoint).await;
            }
            state => {
                return Err(Error::InvalidState {
                    name,
                    state,
                    op: Operation::Start,
                });
            }
        }

        let mut outcome = ActionOutcome::new(guard.view());
        if !guard.credential_delivered() {
            outcome.credential = guard.credential().cloned();
            guard.apply(Transition::CredentialDelivered)?;
        }
        Ok(outcome)
    }

    async fn stop_locked(
        &self,
        guard: &mut ResourceGuard,
        driver: &dyn Driver,
    ) -> Result<ActionOutcome> {
        let name = guard.name().to_string();
        match guard.state() {
            LifecycleState::Created | LifecycleState::Stopped => {
                debug!(resource = %name, "Already stopped");
            }
            LifecycleState::Running => {
                let id = Self::substrate_id(guard, Operation::Stop)?;
                driver
                    .stop(&id)
                    .await
                    .map_err(|e| Error::backend(Operation::Stop, &name, e))?;
                guard.apply(Transition::Stopped)?;
                self.audit.resource_stopped(&name).await;
            }
            state => {
                return Err(Error::InvalidState {
                    name,
                    state,
                    op: Operation::Stop,
                });
            }
        }
        Ok(ActionOutcome::new(guard.view()))
    }

    async fn delete_locked(
        &self,
        mut guard: ResourceGuard,
        driver: &dyn Driver,
    ) -> Result<ActionOutcome> {
        let name = guard.name().to_string();
        match guard.state() {
            LifecycleState::Created | LifecycleState::Stopped => {
                let id = Self::substrate_id(&guard, Operation::Delete)?;
                driver
                    .delete(&id)
                    .await
                    .map_err(|e| Error::backend(Operation::Delete, &name, e))?;
            }
            // Nothing was left behind by a failed provision.
            LifecycleState::Failed => {}
            state => {
                return Err(Error::InvalidState {
                    name,
                    state,
                    op: Operation::Delete,
                });
            }
        }

        self.leases.cancel(&name).await;
        guard.apply(Transition::Deleted)?;
        self.dispose(&name).await;
        self.audit.resource_deleted(&name, "deleted by request").await;

        Ok(ActionOutcome::new(guard.view()))
    }

    /// Teardown on lease expiry. Runs at most once per resource.
    async fn expire(&self, name: &str) {
        let mut guard = match self.registry.lock(name).await {
            Ok(guard) => guard,
            Err(_) => {
                debug!(resource = %name, "Lease fired for a resource that is already gone");
                return;
            }
        };
        if !matches!(
            guard.state(),
            LifecycleState::Created | LifecycleState::Running | LifecycleState::Stopped
        ) {
            debug!(resource = %name, state = %guard.state(), "Nothing to tear down");
            return;
        }

        self.audit.lease_expired(name).await;

        let teardown = async {
            let driver = self.driver(guard.backend())?;
            let id = Self::substrate_id(&guard, Operation::Delete)?;
            driver
                .delete(&id)
                .await
                .map_err(|e| Error::backend(Operation::Delete, name, e))
        }
        .await;

        if let Err(e) = teardown {
            error!(resource = %name, error = %e, "Lease teardown failed");
            self.audit.teardown_failed(name, &e.to_string()).await;
            return;
        }

        if let Err(e) = guard.apply(Transition::Deleted) {
            error!(resource = %name, error = %e, "Could not record teardown");
            return;
        }
        self.dispose(name).await;
        self.audit.resource_deleted(name, "lease expired").await;
    }

    /// Refresh the record from its driver. Errors leave it untouched.
    async fn reconcile(&self, guard: &mut ResourceGuard) {
        if !matches!(
            guard.state(),
            LifecycleState::Created | LifecycleState::Running | LifecycleState::Stopped
        ) {
            return;
        }
        let (Ok(driver), Some(id)) = (
            self.driver(guard.backend()),
            guard.substrate_id().map(str::to_string),
        ) else {
            return;
        };

        let name = guard.name().to_string();
        match driver.inspect(&id).await {
            Ok(observed) => {
                if let Err(e) = guard.apply(Transition::Observed(observed)) {
                    warn!(resource = %name, error = %e, "Could not apply observed state");
                    return;
                }
                if guard.state() == LifecycleState::Deleted {
                    warn!(resource = %name, "Substrate disappeared out of band");
                    self.leases.cancel(&name).await;
                    self.dispose(&name).await;
                    self.audit
                        .resource_deleted(&name, "removed outside rentd")
                        .await;
                }
            }
            Err(e) => {
                warn!(resource = %name, error = %e, "Inspect failed, keeping recorded state");
            }
        }
    }

    /// Reconciled view of `name`, or its last snapshot while it is busy.
    async fn observe(&self, name: &str) -> Option<ResourceView> {
        match self.registry.try_lock(name).await {
            Ok(Some(mut guard)) => {
                self.reconcile(&mut guard).await;
                (guard.state() != LifecycleState::Deleted).then(|| guard.view())
            }
            Ok(None) => self
                .registry
                .snapshot(name)
                .await
                .filter(|v| v.state != LifecycleState::Deleted),
            Err(_) => None,
        }
    }

    async fn dispose(&self, name: &str) {
        self.registry.remove(name).await;
        self.credentials.revoke(name).await;
    }
}
