//! `pulse-auth`: bearer token verification.
//!
//! Decoupled from HTTP: the api crate extracts the token, this crate turns it
//! into a [`pulse_core::UserId`] or refuses it.

pub mod claims;
pub mod jwt;

pub use claims::{JwtClaims, TokenValidationError, validate_claims};
pub use jwt::{Hs256JwtValidator, JwtError, JwtValidator};
