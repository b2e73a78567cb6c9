//! Bearer token verification
//!
//! Tokens are verified against a shared HS256 secret when one is
//! configured. Without a secret the claims are decoded unverified — the
//! relaxed fallback for deployments where a fronting gateway already
//! checked the signature. The relaxed mode is announced loudly at startup.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Claims carried by a caller's bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub admin: Option<bool>,
    pub exp: i64,
    #[serde(default)]
    pub iat: i64,
}

#[derive(Clone)]
pub struct JwtManager {
    decoding_key: Option<DecodingKey>,
}

impl JwtManager {
    pub fn new(secret: &str) -> Self {
        if secret.is_empty() {
            Self { decoding_key: None }
        } else {
            Self {
                decoding_key: Some(DecodingKey::from_secret(secret.as_bytes())),
            }
        }
    }

    pub fn verification_enabled(&self) -> bool {
        self.decoding_key.is_some()
    }

    /// Verify a token and extract its claims.
    ///
    /// Expiry is enforced in both modes; only the signature check is
    /// skipped in the relaxed fallback.
    pub fn verify(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        match &self.decoding_key {
            Some(key) => {
                let validation = Validation::new(Algorithm::HS256);
                decode::<Claims>(token, key, &validation).map(|data| data.claims)
            }
            None => {
                let mut validation = Validation::new(Algorithm::HS256);
                validation.insecure_disable_signature_validation();
                decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
                    .map(|data| data.claims)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use time::OffsetDateTime;

    fn token(secret: &str, claims: &Claims) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn claims() -> Claims {
        Claims {
            sub: Uuid::new_v4(),
            email: Some("vet@example.com".to_string()),
            role: Some("member".to_string()),
            admin: None,
            exp: OffsetDateTime::now_utc().unix_timestamp() + 3600,
            iat: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }

    #[test]
    fn verifies_with_configured_secret() {
        let manager = JwtManager::new("test-secret");
        let claims = claims();
        let verified = manager.verify(&token("test-secret", &claims)).unwrap();
        assert_eq!(verified.sub, claims.sub);
        assert_eq!(verified.email.as_deref(), Some("vet@example.com"));
    }

    #[test]
    fn rejects_wrong_signature_when_secret_configured() {
        let manager = JwtManager::new("test-secret");
        assert!(manager.verify(&token("other-secret", &claims())).is_err());
    }

    #[test]
    fn relaxed_mode_decodes_any_signature() {
        let manager = JwtManager::new("");
        assert!(!manager.verification_enabled());
        let claims = claims();
        let verified = manager.verify(&token("whatever", &claims)).unwrap();
        assert_eq!(verified.sub, claims.sub);
    }

    #[test]
    fn expired_token_is_rejected_in_both_modes() {
        let mut expired = claims();
        expired.exp = OffsetDateTime::now_utc().unix_timestamp() - 3600;

        assert!(JwtManager::new("test-secret")
            .verify(&token("test-secret", &expired))
            .is_err());
        assert!(JwtManager::new("").verify(&token("x", &expired)).is_err());
    }
}
