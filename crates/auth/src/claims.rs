use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use pulse_core::UserId;

/// Claims carried by a bearer token.
///
/// `iat` and `exp` are Unix seconds, as in any RFC 7519 token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtClaims {
    /// The authenticated user.
    pub sub: UserId,

    #[serde(with = "chrono::serde::ts_seconds")]
    pub iat: DateTime<Utc>,

    #[serde(with = "chrono::serde::ts_seconds")]
    pub exp: DateTime<Utc>,
}

impl JwtClaims {
    /// Claims for `user_id` valid from `now` for `ttl`.
    pub fn new(user_id: UserId, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            sub: user_id,
            iat: now,
            exp: now + ttl,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenValidationError {
    #[error("token has expired")]
    Expired,

    #[error("token not yet valid (iat is in the future)")]
    NotYetValid,

    #[error("invalid token time window (exp <= iat)")]
    InvalidTimeWindow,
}

/// Allowed clock drift between the issuer and this process, in seconds.
pub const CLOCK_SKEW_SECS: i64 = 30;

/// Check the claim time window against `now`.
///
/// Signature verification happens before this, in [`crate::JwtValidator`].
pub fn validate_claims(claims: &JwtClaims, now: DateTime<Utc>) -> Result<(), TokenValidationError> {
    if claims.exp <= claims.iat {
        return Err(TokenValidationError::InvalidTimeWindow);
    }
    if now + Duration::seconds(CLOCK_SKEW_SECS) < claims.iat {
        return Err(TokenValidationError::NotYetValid);
    }
    if now >= claims.exp {
        return Err(TokenValidationError::Expired);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_checked() {
        let now = Utc::now();
        let claims = JwtClaims::new(UserId::new(), now, Duration::minutes(10));

        assert_eq!(validate_claims(&claims, now), Ok(()));
        assert_eq!(
            validate_claims(&claims, now + Duration::minutes(10)),
            Err(TokenValidationError::Expired)
        );
        assert_eq!(
            validate_claims(&claims, now - Duration::minutes(5)),
            Err(TokenValidationError::NotYetValid)
        );
        assert_eq!(validate_claims(&claims, now - Duration::seconds(10)), Ok(()));
    }

    #[test]
    fn inverted_window_is_rejected() {
        let now = Utc::now();
        let claims = JwtClaims::new(UserId::new(), now, Duration::zero());
        assert_eq!(
            validate_claims(&claims, now),
            Err(TokenValidationError::InvalidTimeWindow)
        );
    }

    #[test]
    fn timestamps_serialize_as_unix_seconds() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let claims = JwtClaims::new(UserId::new(), now, Duration::seconds(60));
        let json = serde_json::to_value(&claims).unwrap();
        assert_eq!(json["iat"], 1_700_000_000);
        assert_eq!(json["exp"], 1_700_000_060);
    }
}
