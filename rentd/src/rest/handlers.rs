use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::audit::AuditEvent;
use crate::catalog::CatalogEntry;
use crate::credential::CredentialHandle;
use crate::error::Error;
use crate::lease::LeaseInfo;
use crate::manager::{ActionOutcome, LifecycleManager, Verb};
use crate::registry::ResourceView;
use crate::spec::ResourceSpec;

const DEFAULT_EVENT_LIMIT: usize = 100;

/// Shared application state
pub struct AppState {
    pub manager: LifecycleManager,
}

/// API error response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    pub error: String,
    pub code: u32,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self.code {
            400 => StatusCode::BAD_REQUEST,
            404 => StatusCode::NOT_FOUND,
            409 => StatusCode::CONFLICT,
            502 => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let code = match &e {
            Error::InvalidSpec(_) => 400,
            Error::NotFound(_) | Error::CredentialNotFound => 404,
            Error::InvalidState { .. } => 409,
            Error::ImageUnavailable { .. } | Error::Backend { .. } => 502,
            Error::Internal(_) => 500,
        };
        ApiError {
            error: e.to_string(),
            code,
        }
    }
}

// === System ===

/// Version information
#[derive(Serialize, Deserialize, ToSchema)]
pub struct VersionInfo {
    pub version: String,
}

/// Get service version
#[utoipa::path(
    get,
    path = "/v1/version",
    responses(
        (status = 200, description = "Service version", body = VersionInfo)
    ),
    tag = "system"
)]
pub async fn get_version() -> Json<VersionInfo> {
    Json(VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// List the OS templates available per backend
#[utoipa::path(
    get,
    path = "/v1/catalog",
    responses(
        (status = 200, description = "Catalog entries", body = Vec<CatalogEntry>)
    ),
    tag = "system"
)]
pub async fn get_catalog(State(state): State<Arc<AppState>>) -> Json<Vec<CatalogEntry>> {
    Json(state.manager.catalog().entries())
}

// === Resources ===

/// Request to rent a resource
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateResourceRequest {
    /// "container" or "vm"
    pub backend: String,
    pub cpu_cores: u32,
    pub memory_gb: u32,
    /// Required for virtual machines
    pub storage_gb: Option<u32>,
    /// e.g. "Ubuntu", "CentOS", "Fedora"
    pub os_template: String,
    pub location: Option<String>,
    pub lease_minutes: u32,
}

impl TryFrom<CreateResourceRequest> for ResourceSpec {
    type Error = Error;

    fn try_from(req: CreateResourceRequest) -> Result<Self, Error> {
        Ok(ResourceSpec {
            backend: req.backend.parse()?,
            cpu_cores: req.cpu_cores,
            memory_gb: req.memory_gb,
            storage_gb: req.storage_gb.unwrap_or(0),
            os_template: req.os_template.parse()?,
            location: req.location.unwrap_or_default(),
            lease_minutes: req.lease_minutes,
        })
    }
}

/// Resource list response
#[derive(Serialize, ToSchema)]
pub struct ResourceListResponse {
    pub resources: Vec<ResourceView>,
}

/// Rent a new resource
#[utoipa::path(
    post,
    path = "/v1/resources",
    request_body = CreateResourceRequest,
    responses(
        (status = 201, description = "Resource created", body = ResourceView),
        (status = 400, description = "Invalid spec", body = ApiError),
        (status = 502, description = "Image or backend failure", body = ApiError)
    ),
    tag = "resources"
)]
pub async fn create_resource(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateResourceRequest>,
) -> Result<(StatusCode, Json<ResourceView>), ApiError> {
    let spec = ResourceSpec::try_from(req)?;
    let view = state.manager.create(spec).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// List all resources
#[utoipa::path(
    get,
    path = "/v1/resources",
    responses(
        (status = 200, description = "List of resources", body = ResourceListResponse)
    ),
    tag = "resources"
)]
pub async fn list_resources(State(state): State<Arc<AppState>>) -> Json<ResourceListResponse> {
    Json(ResourceListResponse {
        resources: state.manager.list().await,
    })
}

/// Get a resource by name
#[utoipa::path(
    get,
    path = "/v1/resources/{name}",
    params(
        ("name" = String, Path, description = "Resource name")
    ),
    responses(
        (status = 200, description = "Resource found", body = ResourceView),
        (status = 404, description = "Resource not found", body = ApiError)
    ),
    tag = "resources"
)]
pub async fn get_resource(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ResourceView>, ApiError> {
    Ok(Json(state.manager.get(&name).await?))
}

/// Start a resource
#[utoipa::path(
    post,
    path = "/v1/resources/{name}/start",
    params(
        ("name" = String, Path, description = "Resource name")
    ),
    responses(
        (status = 200, description = "Resource running; the first start also returns the credential handle", body = ActionOutcome),
        (status = 404, description = "Resource not found", body = ApiError),
        (status = 409, description = "Resource cannot be started", body = ApiError),
        (status = 502, description = "Backend failure", body = ApiError)
    ),
    tag = "resources"
)]
pub async fn start_resource(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ActionOutcome>, ApiError> {
    Ok(Json(state.manager.action(&name, Verb::Start).await?))
}

/// Stop a resource
#[utoipa::path(
    post,
    path = "/v1/resources/{name}/stop",
    params(
        ("name" = String, Path, description = "Resource name")
    ),
    responses(
        (status = 200, description = "Resource stopped", body = ActionOutcome),
        (status = 404, description = "Resource not found", body = ApiError),
        (status = 409, description = "Resource cannot be stopped", body = ApiError),
        (status = 502, description = "Backend failure", body = ApiError)
    ),
    tag = "resources"
)]
pub async fn stop_resource(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ActionOutcome>, ApiError> {
    Ok(Json(state.manager.action(&name, Verb::Stop).await?))
}

/// Delete a resource
#[utoipa::path(
    delete,
    path = "/v1/resources/{name}",
    params(
        ("name" = String, Path, description = "Resource name")
    ),
    responses(
        (status = 200, description = "Resource deleted", body = ActionOutcome),
        (status = 404, description = "Resource not found", body = ApiError),
        (status = 409, description = "Resource is running", body = ApiError),
        (status = 502, description = "Backend failure", body = ApiError)
    ),
    tag = "resources"
)]
pub async fn delete_resource(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ActionOutcome>, ApiError> {
    Ok(Json(state.manager.action(&name, Verb::Delete).await?))
}

// === Credentials ===

/// Download the private key behind a credential handle
#[utoipa::path(
    get,
    path = "/v1/credentials/{handle}",
    params(
        ("handle" = String, Path, description = "Credential handle")
    ),
    responses(
        (status = 200, description = "OpenSSH private key", content_type = "application/x-pem-file", body = String),
        (status = 404, description = "Unknown or revoked handle", body = ApiError)
    ),
    tag = "credentials"
)]
pub async fn get_credential(
    State(state): State<Arc<AppState>>,
    Path(handle): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let key = state
        .manager
        .get_credential(&CredentialHandle::from(handle))
        .await?;
    Ok(([(header::CONTENT_TYPE, "application/x-pem-file")], key))
}

// === Events & Leases ===

/// Query parameters for the event log
#[derive(Debug, Deserialize, ToSchema)]
pub struct EventsQuery {
    /// Maximum number of events (default: 100)
    pub limit: Option<usize>,
}

/// Event log response
#[derive(Serialize, ToSchema)]
pub struct EventsResponse {
    pub events: Vec<AuditEvent>,
}

/// Recent lifecycle events, newest first
#[utoipa::path(
    get,
    path = "/v1/events",
    params(
        ("limit" = Option<usize>, Query, description = "Maximum number of events")
    ),
    responses(
        (status = 200, description = "Recent events", body = EventsResponse)
    ),
    tag = "events"
)]
pub async fn list_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Json<EventsResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    Json(EventsResponse {
        events: state.manager.events(limit).await,
    })
}

/// Pending leases, soonest expiry first
#[utoipa::path(
    get,
    path = "/v1/leases",
    responses(
        (status = 200, description = "Pending leases", body = Vec<LeaseInfo>)
    ),
    tag = "events"
)]
pub async fn list_leases(State(state): State<Arc<AppState>>) -> Json<Vec<LeaseInfo>> {
    Json(state.manager.leases().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LifecycleState;
    use crate::spec::{BackendKind, OsTemplate};

    fn request() -> CreateResourceRequest {
        CreateResourceRequest {
            backend: "container".to_string(),
            cpu_cores: 4,
            memory_gb: 8,
            storage_gb: None,
            os_template: "ubuntu".to_string(),
            location: Some("Europe".to_string()),
            lease_minutes: 1,
        }
    }

    #[test]
    fn test_request_to_spec() {
        let spec = ResourceSpec::try_from(request()).unwrap();
        assert_eq!(spec.backend, BackendKind::Container);
        assert_eq!(spec.os_template, OsTemplate::Ubuntu);
        assert_eq!(spec.storage_gb, 0);
        assert_eq!(spec.location, "Europe");
    }

    #[test]
    fn test_request_with_unknown_template() {
        let mut req = request();
        req.os_template = "Plan 9".to_string();
        let err = ResourceSpec::try_from(req).unwrap_err();
        assert_eq!(ApiError::from(err).code, 400);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ApiError::from(Error::NotFound("x".into())).code, 404);
        assert_eq!(ApiError::from(Error::CredentialNotFound).code, 404);
        assert_eq!(
            ApiError::from(Error::InvalidState {
                name: "x".into(),
                state: LifecycleState::Running,
                op: crate::error::Operation::Delete,
            })
            .code,
            409
        );
        assert_eq!(
            ApiError::from(Error::ImageUnavailable {
                template: "Ubuntu".into(),
                reason: "offline".into(),
            })
            .code,
            502
        );
    }
}
