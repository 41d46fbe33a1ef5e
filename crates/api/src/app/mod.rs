//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: the composition root (stores, ledger, jobs, router, streamer)
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request DTOs and JSON mapping helpers
//! - `errors.rs`: `ServiceError` to status code mapping

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Secrets the HTTP layer authenticates with.
#[derive(Clone)]
pub struct AuthSecrets {
    pub jwt_secret: String,
    pub worker_token: String,
}

impl std::fmt::Debug for AuthSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSecrets").finish_non_exhaustive()
    }
}

/// Build the full HTTP router over an already composed service graph.
pub fn build_app(services: Arc<AppServices>, secrets: AuthSecrets) -> Router {
    let jwt = Arc::new(pulse_auth::Hs256JwtValidator::new(secrets.jwt_secret.into_bytes()));
    let auth_state = middleware::AuthState { jwt };
    let worker_state = middleware::WorkerAuthState {
        token: Arc::from(secrets.worker_token),
    };

    // User routes: bearer token, user context.
    let protected = routes::router()
        .layer(Extension(services.clone()))
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            middleware::auth_middleware,
        ));

    // Worker routes: shared worker token.
    let worker = routes::worker_router()
        .layer(Extension(services))
        .layer(axum::middleware::from_fn_with_state(
            worker_state,
            middleware::worker_middleware,
        ));

    Router::new()
        .route("/health", get(routes::system::health))
        .nest("/worker", worker)
        .merge(protected)
        .layer(ServiceBuilder::new())
}
