use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use pulse_infra::ServiceError;

/// Handler result: both arms are complete responses.
pub type ApiResult = Result<axum::response::Response, axum::response::Response>;

const PROVIDER_FAILED_MESSAGE: &str = "The AI provider failed to complete the request";

pub fn service_error_to_response(err: ServiceError) -> axum::response::Response {
    match err {
        ServiceError::QuotaExceeded {
            resource,
            limit,
            used,
        } => (
            StatusCode::PAYMENT_REQUIRED,
            axum::Json(json!({
                "error": "quota_exceeded",
                "message": format!("{resource} quota exceeded"),
                "resource": resource,
                "limit": limit,
                "used": used,
            })),
        )
            .into_response(),
        ServiceError::SubscriptionInvalid(problem) => json_error(
            StatusCode::PAYMENT_REQUIRED,
            "subscription_invalid",
            problem.as_str(),
        ),
        ServiceError::ProviderUnavailable(name) => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "provider_unavailable",
            format!("provider not configured: {name}"),
        ),
        ServiceError::ProviderError(cause) => {
            tracing::warn!(error = %cause, "provider error");
            json_error(StatusCode::BAD_GATEWAY, "provider_error", PROVIDER_FAILED_MESSAGE)
        }
        ServiceError::JobNotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        ServiceError::InvalidTransition(msg) => {
            json_error(StatusCode::CONFLICT, "invalid_transition", msg)
        }
        e @ ServiceError::ConflictingUsage { .. } => {
            json_error(StatusCode::CONFLICT, "conflicting_usage", e.to_string())
        }
        ServiceError::Cancelled(_) => json_error(StatusCode::CONFLICT, "cancelled", "job was cancelled"),
        ServiceError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        ServiceError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        ServiceError::Storage(msg) => {
            tracing::error!(error = %msg, "storage error");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_error",
                "internal storage error",
            )
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn bad_request(message: impl Into<String>) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "validation_error", message)
}

pub fn parse_id<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T, axum::response::Response> {
    raw.parse()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_id", format!("invalid {what} id")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_billing::ResourceKind;
    use pulse_core::JobId;
    use pulse_infra::SubscriptionProblem;

    #[test]
    fn status_codes_follow_the_error_taxonomy() {
        let cases = [
            (
                ServiceError::QuotaExceeded {
                    resource: ResourceKind::Images,
                    limit: 2,
                    used: 2,
                },
                StatusCode::PAYMENT_REQUIRED,
            ),
            (
                ServiceError::SubscriptionInvalid(SubscriptionProblem::Missing),
                StatusCode::PAYMENT_REQUIRED,
            ),
            (
                ServiceError::ProviderUnavailable("google".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (ServiceError::ProviderError("boom".into()), StatusCode::BAD_GATEWAY),
            (ServiceError::JobNotFound(JobId::new()), StatusCode::NOT_FOUND),
            (ServiceError::InvalidTransition("x".into()), StatusCode::CONFLICT),
            (ServiceError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (ServiceError::Storage("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(service_error_to_response(err).status(), status);
        }
    }
}
