use super::handlers::{healthz_handler, landing_handler, whoami_handler};
use crate::cas::{require_login, CasLogin, Sessions, TicketValidator};
use axum::{middleware, routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn create_router<S, V>(login: Arc<CasLogin<S, V>>) -> Router
where
    S: Sessions,
    V: TicketValidator,
{
    // route_layer: unknown paths 404 instead of bouncing through CAS
    let protected = Router::new()
        .route("/", get(landing_handler))
        .route("/whoami", get(whoami_handler))
        .route_layer(middleware::from_fn_with_state(login, require_login::<S, V>));

    Router::new()
        .route("/healthz", get(healthz_handler))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
}
