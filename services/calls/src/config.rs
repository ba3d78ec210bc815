use serde::{Deserialize, Serialize};

use wavechat_common::{DatabaseConfig, JwtConfig, RedisConfig, ServerConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallsConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub timing: CallTimingConfig,
    pub sfu: SfuConfig,
    pub ice: IceConfig,
}

/// Every timer and TTL the call subsystem relies on. Values live here, not
/// in code, so operations can retune without a rebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallTimingConfig {
    pub ringing_timeout_seconds: u64,
    pub ringing_ack_timeout_millis: u64,
    pub disconnect_grace_seconds: u64,
    pub ice_batch_window_millis: u64,
    pub session_ttl_seconds: usize,
    pub end_lock_ttl_millis: usize,
    pub end_result_ttl_seconds: usize,
    pub end_lock_wait_millis: u64,
    pub missed_viewed_ttl_seconds: usize,
    pub missed_count_ttl_seconds: usize,
    pub max_call_duration_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SfuConfig {
    pub base_url: String,
    pub api_key: String,
    pub domain: String,
    pub room_expiry_seconds: u64,
    pub token_ttl_seconds: u64,
    pub http_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
    pub turn_urls: Vec<String>,
    /// Shared secret for time-limited TURN credentials. Restricted scope:
    /// never logged, never serialized into responses.
    #[serde(skip_serializing)]
    pub turn_secret: String,
    pub turn_ttl_seconds: u32,
    pub default_transport_policy: String,
}

impl CallsConfig {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            server: ServerConfig::from_env("CALLS_PORT", 8004),
            database: DatabaseConfig::from_env(),
            redis: RedisConfig::from_env(),
            jwt: JwtConfig::from_env(),
            timing: CallTimingConfig {
                ringing_timeout_seconds: env_parse("CALL_RINGING_TIMEOUT_SECONDS", 30),
                ringing_ack_timeout_millis: env_parse("CALL_RINGING_ACK_TIMEOUT_MILLIS", 2000),
                disconnect_grace_seconds: env_parse("CALL_DISCONNECT_GRACE_SECONDS", 3),
                ice_batch_window_millis: env_parse("CALL_ICE_BATCH_WINDOW_MILLIS", 50),
                session_ttl_seconds: env_parse("CALL_SESSION_TTL_SECONDS", 300),
                end_lock_ttl_millis: env_parse("CALL_END_LOCK_TTL_MILLIS", 5000),
                end_result_ttl_seconds: env_parse("CALL_END_RESULT_TTL_SECONDS", 10),
                end_lock_wait_millis: env_parse("CALL_END_LOCK_WAIT_MILLIS", 3000),
                missed_viewed_ttl_seconds: env_parse("CALL_MISSED_VIEWED_TTL_SECONDS", 90 * 24 * 3600),
                missed_count_ttl_seconds: env_parse("CALL_MISSED_COUNT_TTL_SECONDS", 30),
                max_call_duration_seconds: env_parse("CALL_MAX_DURATION_SECONDS", 24 * 3600),
            },
            sfu: SfuConfig {
                base_url: std::env::var("SFU_BASE_URL")
                    .unwrap_or_else(|_| "https://api.daily.co/v1".to_string()),
                api_key: std::env::var("SFU_API_KEY").unwrap_or_default(),
                domain: std::env::var("SFU_DOMAIN")
                    .unwrap_or_else(|_| "wavechat.daily.co".to_string()),
                room_expiry_seconds: env_parse("SFU_ROOM_EXPIRY_SECONDS", 4 * 3600),
                token_ttl_seconds: env_parse("SFU_TOKEN_TTL_SECONDS", 3600),
                http_timeout_seconds: env_parse("SFU_HTTP_TIMEOUT_SECONDS", 10),
            },
            ice: IceConfig {
                stun_urls: std::env::var("ICE_STUN_URLS")
                    .unwrap_or_else(|_| "stun:stun.l.google.com:19302".to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect(),
                turn_urls: std::env::var("ICE_TURN_URLS")
                    .unwrap_or_else(|_| {
                        "turn:turn.wavechat.io:3478?transport=udp,turn:turn.wavechat.io:3478?transport=tcp"
                            .to_string()
                    })
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect(),
                turn_secret: std::env::var("TURN_STATIC_AUTH_SECRET")
                    .unwrap_or_else(|_| "dev-turn-secret".to_string()),
                turn_ttl_seconds: env_parse("TURN_TTL_SECONDS", 3600),
                default_transport_policy: std::env::var("ICE_DEFAULT_TRANSPORT_POLICY")
                    .unwrap_or_else(|_| "relay".to_string()),
            },
        })
    }
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = CallsConfig::from_env().unwrap();
        assert_eq!(config.timing.ringing_timeout_seconds, 30);
        assert_eq!(config.timing.ringing_ack_timeout_millis, 2000);
        assert_eq!(config.timing.disconnect_grace_seconds, 3);
        assert_eq!(config.timing.ice_batch_window_millis, 50);
        assert_eq!(config.timing.session_ttl_seconds, 300);
        assert_eq!(config.timing.end_lock_ttl_millis, 5000);
        assert_eq!(config.timing.end_result_ttl_seconds, 10);
        assert_eq!(config.timing.max_call_duration_seconds, 86400);
    }

    #[test]
    fn turn_secret_never_serializes() {
        let config = CallsConfig::from_env().unwrap();
        let json = serde_json::to_value(&config.ice).unwrap();
        assert!(json.get("turnSecret").is_none());
        assert!(json.get("turn_secret").is_none());
    }
}
