use axum::{
    Json, Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use super::handlers::{self, AppState};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "rentd API",
        version = "0.1.0",
        description = "Rent short-lived containers and virtual machines with SSH access. Every resource is torn down when its lease expires.",
    ),
    tags(
        (name = "system", description = "Version and OS template catalog"),
        (name = "resources", description = "Resource creation and lifecycle"),
        (name = "credentials", description = "SSH private key retrieval"),
        (name = "events", description = "Audit events and pending leases")
    ),
    paths(
        handlers::get_version,
        handlers::get_catalog,
        handlers::create_resource,
        handlers::list_resources,
        handlers::get_resource,
        handlers::start_resource,
        handlers::stop_resource,
        handlers::delete_resource,
        handlers::get_credential,
        handlers::list_events,
        handlers::list_leases,
    ),
    components(schemas(
        handlers::ApiError,
        handlers::VersionInfo,
        handlers::CreateResourceRequest,
        handlers::ResourceListResponse,
        handlers::EventsQuery,
        handlers::EventsResponse,
        crate::catalog::CatalogEntry,
        crate::catalog::ImageSource,
        crate::registry::ResourceView,
        crate::registry::LifecycleState,
        crate::spec::ResourceSpec,
        crate::spec::BackendKind,
        crate::spec::OsTemplate,
        crate::driver::Endpoint,
        crate::manager::ActionOutcome,
        crate::credential::CredentialHandle,
        crate::audit::AuditEvent,
        crate::audit::AuditLevel,
        crate::lease::LeaseInfo,
    ))
)]
pub struct ApiDoc;

pub fn create_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        // System
        .route("/version", get(handlers::get_version))
        .route("/catalog", get(handlers::get_catalog))
        .route("/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        // Resources
        .route("/resources", get(handlers::list_resources))
        .route("/resources", post(handlers::create_resource))
        .route(
            "/resources/{name}",
            get(handlers::get_resource).delete(handlers::delete_resource),
        )
        .route("/resources/{name}/start", post(handlers::start_resource))
        .route("/resources/{name}/stop", post(handlers::stop_resource))
        // Credentials
        .route("/credentials/{handle}", get(handlers::get_credential))
        // Events
        .route("/events", get(handlers::list_events))
        .route("/leases", get(handlers::list_leases));

    Router::new()
        .nest("/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
