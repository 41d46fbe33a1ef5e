use std::sync::Arc;

use axum::{Extension, Json, http::StatusCode, response::IntoResponse};
use serde_json::json;

use pulse_billing::PlanTier;

use crate::app::errors::{ApiResult, service_error_to_response};
use crate::app::services::AppServices;
use crate::context::UserContext;

/// Open a starter subscription; returns the live one when it already exists.
pub async fn open_subscription(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
) -> ApiResult {
    let subscription = services
        .ledger
        .open_subscription(user.user_id(), PlanTier::Starter)
        .await
        .map_err(service_error_to_response)?;
    let summary = services
        .ledger
        .summary(user.user_id())
        .await
        .map_err(service_error_to_response)?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "subscription_id": subscription.id.to_string(),
            "summary": summary,
        })),
    )
        .into_response())
}

pub async fn cancel_subscription(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
) -> ApiResult {
    let subscription = services
        .ledger
        .cancel_subscription(user.user_id())
        .await
        .map_err(service_error_to_response)?;

    Ok(Json(json!({
        "subscription_id": subscription.id.to_string(),
        "status": subscription.status,
    }))
    .into_response())
}

pub async fn usage(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
) -> ApiResult {
    let summary = services
        .ledger
        .summary(user.user_id())
        .await
        .map_err(service_error_to_response)?;
    Ok(Json(summary).into_response())
}

/// Ledger entries charged to the current period, oldest first.
pub async fn usage_events(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
) -> ApiResult {
    let events = services
        .ledger
        .usage_events(user.user_id())
        .await
        .map_err(service_error_to_response)?;
    Ok(Json(json!({ "events": events })).into_response())
}
