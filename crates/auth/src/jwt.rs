use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use tracing::debug;

use crate::claims::{BankClaims, TokenValidationError, validate_claims};

/// Verifies a bearer token and yields the bank it was issued to.
pub trait JwtValidator: Send + Sync {
    fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<BankClaims, TokenValidationError>;
}

/// HS256 shared-secret validator.
///
/// The time window lives in `issued_at`/`expires_at` rather than the
/// registered `exp` claim, so `jsonwebtoken` only checks the signature and
/// [`validate_claims`] checks the window.
pub struct Hs256JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl Hs256JwtValidator {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        Self {
            key: DecodingKey::from_secret(secret.as_ref()),
            validation,
        }
    }
}

impl JwtValidator for Hs256JwtValidator {
    fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<BankClaims, TokenValidationError> {
        let data = jsonwebtoken::decode::<BankClaims>(token, &self.key, &self.validation).map_err(|e| {
            debug!(error = %e, "token rejected");
            TokenValidationError::Malformed(e.to_string())
        })?;
        validate_claims(&data.claims, now)?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use instapay_core::BankId;
    use jsonwebtoken::{EncodingKey, Header};

    fn mint(secret: &str, claims: &BankClaims) -> String {
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn claims(now: DateTime<Utc>) -> BankClaims {
        BankClaims {
            sub: BankId::new(),
            issued_at: now,
            expires_at: now + Duration::minutes(10),
        }
    }

    #[test]
    fn valid_token_yields_its_bank() {
        let now = Utc::now();
        let c = claims(now);
        let v = Hs256JwtValidator::new("s3cret");
        assert_eq!(v.validate(&mint("s3cret", &c), now).unwrap(), c);
    }

    #[test]
    fn wrong_secret_and_garbage_are_malformed() {
        let now = Utc::now();
        let v = Hs256JwtValidator::new("s3cret");
        assert!(matches!(
            v.validate(&mint("other", &claims(now)), now),
            Err(TokenValidationError::Malformed(_))
        ));
        assert!(matches!(
            v.validate("not-a-jwt", now),
            Err(TokenValidationError::Malformed(_))
        ));
    }

    #[test]
    fn expired_token_is_rejected_after_signature_check() {
        let now = Utc::now();
        let v = Hs256JwtValidator::new("s3cret");
        let token = mint("s3cret", &claims(now));
        assert_eq!(
            v.validate(&token, now + Duration::minutes(11)),
            Err(TokenValidationError::Expired)
        );
    }
}
