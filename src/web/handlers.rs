use crate::cas::{AuthenticatedUser, UserIdentity};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

/// Liveness probe - always returns OK if the process is running
pub async fn healthz_handler() -> impl IntoResponse {
    StatusCode::OK
}

pub async fn landing_handler(AuthenticatedUser(user): AuthenticatedUser) -> impl IntoResponse {
    format!("Hello {}", user.username)
}

/// The identity CAS vouched for, attributes included
pub async fn whoami_handler(AuthenticatedUser(user): AuthenticatedUser) -> Json<UserIdentity> {
    tracing::debug!(
        user = %user.username,
        attributes = user.attributes.len(),
        "Identity requested"
    );
    Json(user)
}
