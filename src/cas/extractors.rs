use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

/// Identity stored in the session under `user`
///
/// Serializes flat, CAS attributes next to the username:
/// `{"username": "jdoe", "email": "jdoe@example.org"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub username: String,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, String>,
}

impl UserIdentity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// Rejection when a handler asks for a user outside the CAS filter
#[derive(Debug)]
pub struct MissingUser;

impl IntoResponse for MissingUser {
    fn into_response(self) -> Response {
        tracing::error!("Handler requires a user but the route is not behind the CAS filter");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "Internal server error",
                "message": "Route is not protected by CAS login",
                "code": "MISSING_USER"
            })),
        )
            .into_response()
    }
}

/// Authenticated user extractor
///
/// Reads the identity the CAS filter attached to the request.
///
/// Usage:
/// ```rust,ignore
/// async fn handler(AuthenticatedUser(user): AuthenticatedUser) -> String {
///     format!("Hello {}", user.username)
/// }
/// ```
pub struct AuthenticatedUser(pub UserIdentity);

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = MissingUser;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user = parts
            .extensions
            .get::<UserIdentity>()
            .cloned()
            .ok_or(MissingUser)?;

        tracing::debug!(user = %user.username, "User authenticated via session");
        Ok(AuthenticatedUser(user))
    }
}
