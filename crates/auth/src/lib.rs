//! `instapay-auth` — bank identity for the settlement channels.
//!
//! A bearer token names exactly one bank. This crate is decoupled from HTTP:
//! the API layer extracts the token, this crate verifies it and returns the
//! claims.

pub mod claims;
pub mod jwt;

pub use claims::{BankClaims, TokenValidationError, validate_claims};
pub use jwt::{Hs256JwtValidator, JwtValidator};
