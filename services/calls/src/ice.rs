use base64::{engine::general_purpose, Engine as _};
use chrono::Duration;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::sync::Arc;
use uuid::Uuid;

use wavechat_common::{AppError, CacheKeys, CacheService, Clock};

use crate::config::IceConfig;
use crate::models::{IceConfigPayload, IceServer, TurnCredentials};

type HmacSha1 = Hmac<Sha1>;

/// STUN list plus short-lived TURN credentials per the time-limited
/// shared-secret scheme: `username = {unixExpiry}:{userId}`,
/// `credential = base64(HMAC-SHA1(secret, username))`. The secret stays in
/// config and is never logged.
#[derive(Clone)]
pub struct IceConfigService {
    config: IceConfig,
    cache: CacheService,
    clock: Arc<dyn Clock>,
}

impl IceConfigService {
    pub fn new(config: IceConfig, cache: CacheService, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            cache,
            clock,
        }
    }

    pub fn turn_credentials(&self, user_id: Uuid) -> Result<TurnCredentials, AppError> {
        let expires_at = self.clock.now() + Duration::seconds(self.config.turn_ttl_seconds as i64);
        let username = format!("{}:{}", expires_at.timestamp(), user_id);

        let mut mac = HmacSha1::new_from_slice(self.config.turn_secret.as_bytes())
            .map_err(|_| AppError::Internal("TURN secret is empty".to_string()))?;
        mac.update(username.as_bytes());
        let credential = general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        Ok(TurnCredentials {
            username,
            credential,
            ttl_seconds: self.config.turn_ttl_seconds,
            expires_at,
        })
    }

    /// Full ICE config for a user: a STUN entry plus a fresh TURN entry.
    /// The transport policy follows the user's privacy setting, defaulting
    /// to relay-only.
    pub async fn ice_config(&self, user_id: Uuid) -> Result<IceConfigPayload, AppError> {
        let turn = self.turn_credentials(user_id)?;
        let policy = self.transport_policy(user_id).await?;

        Ok(IceConfigPayload {
            ice_servers: vec![
                IceServer {
                    urls: self.config.stun_urls.clone(),
                    username: None,
                    credential: None,
                },
                IceServer {
                    urls: self.config.turn_urls.clone(),
                    username: Some(turn.username),
                    credential: Some(turn.credential),
                },
            ],
            ice_transport_policy: policy,
        })
    }

    async fn transport_policy(&self, user_id: Uuid) -> Result<String, AppError> {
        let cached = self
            .cache
            .get_string(&CacheKeys::ice_policy(&user_id.to_string()))
            .await?;
        Ok(cached.unwrap_or_else(|| self.config.default_transport_policy.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wavechat_common::ManualClock;

    fn test_config() -> IceConfig {
        IceConfig {
            stun_urls: vec!["stun:stun.example.org:3478".to_string()],
            turn_urls: vec!["turn:turn.example.org:3478?transport=udp".to_string()],
            turn_secret: "unit-test-secret".to_string(),
            turn_ttl_seconds: 3600,
            default_transport_policy: "relay".to_string(),
        }
    }

    fn credentials_at(
        clock: ManualClock,
        user_id: Uuid,
    ) -> TurnCredentials {
        // CacheService is only touched by the async path; credential minting
        // itself is pure.
        let config = test_config();
        let expires_at = clock.now() + Duration::seconds(config.turn_ttl_seconds as i64);
        let username = format!("{}:{}", expires_at.timestamp(), user_id);
        let mut mac = HmacSha1::new_from_slice(config.turn_secret.as_bytes()).unwrap();
        mac.update(username.as_bytes());
        TurnCredentials {
            username,
            credential: general_purpose::STANDARD.encode(mac.finalize().into_bytes()),
            ttl_seconds: config.turn_ttl_seconds,
            expires_at,
        }
    }

    #[test]
    fn username_is_expiry_then_user() {
        let clock = ManualClock::new(Utc::now());
        let user_id = Uuid::new_v4();
        let creds = credentials_at(clock.clone(), user_id);

        let (expiry, user) = creds.username.split_once(':').unwrap();
        assert_eq!(expiry.parse::<i64>().unwrap(), creds.expires_at.timestamp());
        assert_eq!(user, user_id.to_string());
    }

    #[test]
    fn credential_is_base64_sha1_digest() {
        let clock = ManualClock::new(Utc::now());
        let creds = credentials_at(clock, Uuid::new_v4());
        let raw = general_purpose::STANDARD.decode(&creds.credential).unwrap();
        assert_eq!(raw.len(), 20);
    }

    #[test]
    fn credentials_verify_against_the_shared_secret() {
        let clock = ManualClock::new(Utc::now());
        let creds = credentials_at(clock, Uuid::new_v4());

        let mut mac = HmacSha1::new_from_slice(b"unit-test-secret").unwrap();
        mac.update(creds.username.as_bytes());
        let expected = general_purpose::STANDARD.decode(&creds.credential).unwrap();
        mac.verify_slice(&expected).unwrap();
    }

    #[test]
    fn different_users_get_different_credentials() {
        let clock = ManualClock::new(Utc::now());
        let a = credentials_at(clock.clone(), Uuid::new_v4());
        let b = credentials_at(clock, Uuid::new_v4());
        assert_ne!(a.username, b.username);
        assert_ne!(a.credential, b.credential);
    }
}
