use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::User;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    #[serde(default)]
    pub roles: Vec<String>,
    pub exp: i64,
}

/// Turns a bearer credential into the user it was issued to.
pub trait AuthValidator: Send + Sync {
    fn validate(&self, token: &str) -> Result<User>;
}

#[derive(Clone)]
pub struct JwtValidator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn issue(&self, user: &User, ttl: Duration) -> Result<String> {
        let claims = Claims {
            sub: user.id,
            roles: user.roles.clone(),
            exp: (Utc::now() + ttl).timestamp(),
        };

        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?)
    }
}

impl AuthValidator for JwtValidator {
    fn validate(&self, token: &str) -> Result<User> {
        let token = token.strip_prefix("Bearer ").unwrap_or(token).trim();
        if token.is_empty() {
            return Err(Error::Unauthorized);
        }

        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)?;

        Ok(User {
            id: data.claims.sub,
            roles: data.claims.roles,
        })
    }
}

#[test]
fn issued_tokens_validate_with_or_without_bearer_prefix() {
    let validator = JwtValidator::new(b"secret");
    let user = User::new(Uuid::new_v4()).with_roles(["driver"]);

    let token = validator.issue(&user, Duration::minutes(5)).unwrap();

    assert_eq!(validator.validate(&token).unwrap(), user);
    assert_eq!(validator.validate(&format!("Bearer {token}")).unwrap(), user);
}

#[test]
fn rejects_foreign_and_expired_tokens() {
    let validator = JwtValidator::new(b"secret");
    let other = JwtValidator::new(b"other");
    let user = User::new(Uuid::new_v4());

    let foreign = other.issue(&user, Duration::minutes(5)).unwrap();
    assert!(matches!(validator.validate(&foreign), Err(Error::Unauthorized)));

    let expired = validator.issue(&user, Duration::hours(-1)).unwrap();
    assert!(matches!(validator.validate(&expired), Err(Error::Unauthorized)));

    assert!(matches!(validator.validate("Bearer "), Err(Error::Unauthorized)));
}
