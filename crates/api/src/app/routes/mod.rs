use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Router,
    http::{HeaderName, HeaderValue},
    response::{
        IntoResponse, Response,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
    routing::{get, post, put},
};
use futures::Stream;

pub mod chat;
pub mod jobs;
pub mod media;
pub mod subscription;
pub mod system;
pub mod worker;

/// Router for all user endpoints (bearer-authenticated).
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .route(
            "/subscription",
            post(subscription::open_subscription).delete(subscription::cancel_subscription),
        )
        .route("/usage", get(subscription::usage))
        .route("/usage/events", get(subscription::usage_events))
        .nest("/chat", chat::router())
        .route("/images/generate", post(media::generate_images))
        .route("/videos/generate", post(media::generate_video))
        .route("/slides/generate", post(media::generate_slides))
        .route("/slides/outline", post(media::generate_outline))
        .route("/cv/generate", post(media::generate_cv))
        .nest("/jobs", jobs::router())
}

/// Router for media workers (`X-Worker-Token`).
pub fn worker_router() -> Router {
    Router::new()
        .route("/jobs/:id/begin", post(worker::begin_job))
        .route("/jobs/:id/complete", post(worker::complete_job))
        .route("/jobs/:id/fail", post(worker::fail_job))
        .route("/subscriptions/:user_id/plan", put(worker::change_plan))
}

/// SSE response with a 15s keep-alive and proxy buffering disabled.
pub fn sse_response<S>(stream: S) -> Response
where
    S: Stream<Item = Result<SseEvent, Infallible>> + Send + 'static,
{
    let sse = Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)));
    (
        [
            (
                HeaderName::from_static("cache-control"),
                HeaderValue::from_static("no-cache"),
            ),
            (
                HeaderName::from_static("x-accel-buffering"),
                HeaderValue::from_static("no"),
            ),
        ],
        sse,
    )
        .into_response()
}
