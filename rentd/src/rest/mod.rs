//! HTTP API over the lifecycle manager.

pub mod handlers;
pub mod routes;

pub use handlers::{ApiError, AppState, CreateResourceRequest};
pub use routes::{ApiDoc, create_router};
