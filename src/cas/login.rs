//! CAS login filter
//!
//! Every request goes through exactly one of three branches:
//!
//! 1. `ticket` query parameter present: validate it against CAS, create a
//!    session holding the user, then 302 back to the service URL without
//!    the ticket.
//! 2. Valid session cookie: attach the user and run the wrapped handler.
//! 3. Otherwise: send the login redirect page.

use axum::{
    extract::{Request, State},
    http::{header::LOCATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::future::Future;
use std::sync::Arc;

use super::error::CasError;
use super::extractors::UserIdentity;
use super::helpers::session_hash;
use super::redirect::{LoginRedirect, FRAGMENT_PARAM};
use super::session::{Session, SessionGuard, Sessions};
use super::url::{query_param, ServiceUrl, ServiceUrlResolver};
use super::validate::{TicketValidator, ValidationOutcome};

const TICKET_PARAM: &str = "ticket";

/// Session key the user identity is stored under
pub const USER_KEY: &str = "user";

pub struct CasLogin<S, V> {
    sso: String,
    sessions: S,
    validator: V,
    url: ServiceUrlResolver,
}

impl<S, V> CasLogin<S, V>
where
    S: Sessions,
    V: TicketValidator,
{
    /// Creates a filter for a given SSO base URL, e.g. `https://sso.example.com/cas`.
    /// The service URL is taken from the request unless `with_url` says otherwise.
    pub fn new(sso: &str, sessions: S, validator: V) -> Self {
        Self {
            sso: sso.trim_end_matches('/').to_string(),
            sessions,
            validator,
            url: ServiceUrlResolver::default(),
        }
    }

    pub fn with_url(mut self, url: impl Into<ServiceUrlResolver>) -> Self {
        self.url = url.into();
        self
    }

    pub fn sessions(&self) -> &S {
        &self.sessions
    }

    /// Runs the login state machine, calling `proceed` only for requests
    /// with a valid session
    pub async fn filter<F, Fut>(&self, mut request: Request, proceed: F) -> Result<Response, CasError>
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        let uri = self.url.resolve(&request)?;
        let query = request.uri().query();

        if let Some(ticket) = query_param(query, TICKET_PARAM).filter(|t| !t.is_empty()) {
            let fragment = query_param(query, FRAGMENT_PARAM);
            return self.redeem(&ticket, &uri, fragment.as_deref()).await;
        }

        let located = self
            .sessions
            .locate(request.headers())
            .await
            .map_err(CasError::Session)?;

        if let Some(session) = located {
            let mut session = SessionGuard::new(session);

            match session.value(USER_KEY).map(serde_json::from_value::<UserIdentity>) {
                Some(Ok(user)) => {
                    tracing::debug!(
                        user = %user.username,
                        session_hash = %session_hash(session.id()),
                        "Proceeding with authenticated session"
                    );
                    request.extensions_mut().insert(user);

                    // The guard closes the session if `proceed` unwinds
                    let mut response = proceed(request).await;
                    session.transmit(&mut response);
                    return Ok(response);
                }
                Some(Err(e)) => tracing::warn!(
                    error = %e,
                    session_hash = %session_hash(session.id()),
                    "Stored user cannot be read, treating session as anonymous"
                ),
                None => tracing::debug!(
                    session_hash = %session_hash(session.id()),
                    "Session carries no user"
                ),
            }
        }

        tracing::info!(
            service = %uri,
            sso = %self.sso,
            "No authenticated session, redirecting to CAS login"
        );
        LoginRedirect::new(&self.sso, &uri).into_html()
    }

    /// Validates a ticket, then relocates to self without the ticket
    async fn redeem(
        &self,
        ticket: &str,
        uri: &ServiceUrl,
        fragment: Option<&str>,
    ) -> Result<Response, CasError> {
        let service = uri.without_param(TICKET_PARAM);

        let user = match self.validator.validate(ticket, &service).await? {
            ValidationOutcome::Success(user) => user,
            ValidationOutcome::Failure { code, message } => {
                tracing::warn!(
                    code = %code,
                    service = %service,
                    ticket_len = ticket.len(),
                    "CAS rejected ticket"
                );
                return Err(CasError::AuthenticationFailure { code, message });
            }
        };

        let value = serde_json::to_value(&user).map_err(|e| CasError::Session(e.into()))?;
        let session = self.sessions.create().await.map_err(CasError::Session)?;
        let mut session = SessionGuard::new(session);
        session.register(USER_KEY, value);

        let target = service
            .without_param(FRAGMENT_PARAM)
            .with_fragment(fragment);

        let mut response = (StatusCode::FOUND, [(LOCATION, target.as_str())]).into_response();
        session.transmit(&mut response);

        tracing::info!(
            user = %user.username,
            attributes = user.attributes.len(),
            session_hash = %session_hash(session.id()),
            location = %target,
            "Ticket validated, redirecting to service"
        );

        Ok(response)
    }
}

/// Middleware protecting a router with CAS login
///
/// Usage:
/// ```rust,ignore
/// let protected = Router::new()
///     .route("/", get(handler))
///     .layer(middleware::from_fn_with_state(login, require_login::<_, _>));
/// ```
pub async fn require_login<S, V>(
    State(login): State<Arc<CasLogin<S, V>>>,
    request: Request,
    next: Next,
) -> Response
where
    S: Sessions,
    V: TicketValidator,
{
    login
        .filter(request, |request| next.run(request))
        .await
        .unwrap_or_else(IntoResponse::into_response)
}
