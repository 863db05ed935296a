use std::sync::Arc;

use chrono::Duration;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};

use chime_types::UserId;
use chime_types::api::Claims;

use crate::clock::Clock;
use crate::error::{ServiceError, ServiceResult};

/// Signs and checks the HS256 session tokens handed out at login.
pub struct TokenIssuer {
    secret: String,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl TokenIssuer {
    pub fn new(secret: impl Into<String>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            secret: secret.into(),
            ttl,
            clock,
        }
    }

    pub fn issue(&self, user_id: UserId, username: &str) -> ServiceResult<String> {
        let claims = Claims {
            sub: user_id,
            username: username.to_string(),
            exp: (self.clock.now() + self.ttl).timestamp() as usize,
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(anyhow::Error::from)?;

        Ok(token)
    }

    pub fn verify(&self, token: &str) -> ServiceResult<Claims> {
        let mut validation = Validation::default();
        // Expiry is checked against the injected clock below.
        validation.validate_exp = false;

        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|_| ServiceError::auth("invalid session token"))?;

        if token_data.claims.exp as i64 <= self.clock.unix_now() {
            return Err(ServiceError::auth("session token expired"));
        }

        Ok(token_data.claims)
    }
}
