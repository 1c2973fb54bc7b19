use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Why a validation body is not well-formed
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error(transparent)]
    Xml(#[from] quick_xml::Error),

    #[error("element `{0}` is never closed")]
    Unclosed(String),

    #[error("content after the root element")]
    AfterRoot,

    #[error("text outside the root element")]
    TextOutsideRoot,
}

/// Fatal per-request failures of the CAS filter
///
/// None of these are retried: a ticket can only be redeemed once, so a
/// second `serviceValidate` call with the same ticket cannot succeed.
#[derive(Debug, thiserror::Error)]
pub enum CasError {
    /// `serviceValidate` answered with something other than 200
    #[error("{message}")]
    Transport { status: StatusCode, message: String },

    /// The identity provider could not be reached at all
    #[error("Validation request failed: {0}")]
    Unreachable(#[source] reqwest::Error),

    /// Validation body is not well-formed XML
    #[error("FORMAT: Validation cannot be parsed")]
    Format(#[source] FormatError),

    /// CAS answered with `cas:authenticationFailure`
    #[error("{code}: {message}")]
    AuthenticationFailure { code: String, message: String },

    /// Neither success nor failure in the validation response
    #[error("UNEXPECTED: {0}")]
    UnexpectedResponse(String),

    #[error("Invalid service URL `{input}`: {source}")]
    InvalidServiceUrl {
        input: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Session store failure: {0}")]
    Session(#[source] anyhow::Error),

    #[error("Redirect page cannot be rendered: {0}")]
    Render(#[from] askama::Error),
}

impl CasError {
    /// HTTP status this error is surfaced with
    pub fn status(&self) -> StatusCode {
        match self {
            CasError::Transport { status, .. } => *status,
            CasError::Unreachable(_) => StatusCode::BAD_GATEWAY,
            CasError::InvalidServiceUrl { .. } => StatusCode::BAD_REQUEST,
            CasError::Format(_)
            | CasError::AuthenticationFailure { .. }
            | CasError::UnexpectedResponse(_)
            | CasError::Session(_)
            | CasError::Render(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &str {
        match self {
            CasError::Transport { .. } => "TRANSPORT",
            CasError::Unreachable(_) => "UNREACHABLE",
            CasError::Format(_) => "FORMAT",
            CasError::AuthenticationFailure { code, .. } => code,
            CasError::UnexpectedResponse(_) => "UNEXPECTED",
            CasError::InvalidServiceUrl { .. } => "INVALID_SERVICE_URL",
            CasError::Session(_) => "SESSION",
            CasError::Render(_) => "RENDER",
        }
    }
}

impl IntoResponse for CasError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, status = %status, "CAS login failed");
        } else {
            tracing::warn!(error = %self, status = %status, "CAS login rejected");
        }

        (
            status,
            Json(json!({
                "error": status.canonical_reason().unwrap_or("Error"),
                "message": self.to_string(),
                "code": self.code(),
            })),
        )
            .into_response()
    }
}
