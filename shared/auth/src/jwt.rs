use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use wavechat_common::{AppError, JwtConfig};

/// Identity carried by both socket namespaces. Token issuance lives in the
/// user service; this crate only validates what arrives on a handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub exp: i64,
    pub iat: i64,
    pub iss: String,
}

impl Claims {
    pub fn user_id(&self) -> Result<Uuid, AppError> {
        Uuid::parse_str(&self.sub)
            .map_err(|e| AppError::Unauthenticated(format!("Invalid user id in token: {}", e)))
    }
}

#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
}

impl JwtService {
    pub fn new(config: &JwtConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_ref()),
            decoding_key: DecodingKey::from_secret(config.secret.as_ref()),
            validation,
            issuer: config.issuer.clone(),
        }
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, AppError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| AppError::Unauthenticated(format!("Invalid token: {}", e)))
    }

    /// Used by tests and local tooling; production tokens come from the user
    /// service.
    pub fn issue_token(&self, user_id: Uuid, username: &str, ttl_hours: i64) -> Result<String, AppError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            username: username.to_string(),
            exp: (now + Duration::hours(ttl_hours)).timestamp(),
            iat: now.timestamp(),
            iss: self.issuer.clone(),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AppError::Internal(format!("Failed to encode token: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_service() -> JwtService {
        JwtService::new(&JwtConfig {
            secret: "unit-test-secret".to_string(),
            issuer: "wavechat".to_string(),
        })
    }

    #[test]
    fn round_trips_claims() {
        let service = test_service();
        let user_id = Uuid::new_v4();

        let token = service.issue_token(user_id, "ana", 1).unwrap();
        let claims = service.validate_token(&token).unwrap();

        assert_eq!(claims.user_id().unwrap(), user_id);
        assert_eq!(claims.username, "ana");
    }

    #[test]
    fn rejects_garbage_tokens() {
        let service = test_service();
        let err = service.validate_token("not-a-token").unwrap_err();
        assert_eq!(err.error_code(), "UNAUTHENTICATED");
    }
}
