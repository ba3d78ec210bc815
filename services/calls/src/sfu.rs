use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use wavechat_common::AppError;

use crate::config::SfuConfig;
use crate::models::SfuRoom;

/// REST control plane for the SFU provider. Rooms are named `call-{callId}`
/// with a participant cap and absolute expiry; meeting tokens bind (room,
/// user, display name, owner flag) and expire in one hour.
#[derive(Clone)]
pub struct SfuClient {
    http: reqwest::Client,
    config: SfuConfig,
}

impl SfuClient {
    pub fn new(config: SfuConfig) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_seconds))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build SFU client: {}", e)))?;
        Ok(Self { http, config })
    }

    pub fn room_name(call_id: Uuid) -> String {
        format!("call-{}", call_id)
    }

    pub fn room_url(&self, room_name: &str) -> String {
        format!("https://{}/{}", self.config.domain, room_name)
    }

    pub async fn create_room(
        &self,
        call_id: Uuid,
        max_participants: usize,
    ) -> Result<SfuRoom, AppError> {
        let name = Self::room_name(call_id);
        let expiry = Utc::now().timestamp() + self.config.room_expiry_seconds as i64;

        let body = json!({
            "name": name,
            "privacy": "private",
            "properties": {
                "max_participants": max_participants,
                "exp": expiry,
                "eject_at_room_exp": true,
            }
        });

        let response = self
            .http
            .post(format!("{}/rooms", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::External(format!("SFU create room failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::External(format!(
                "SFU create room returned {}",
                response.status()
            )));
        }

        tracing::info!("Created SFU room {} (cap {})", name, max_participants);
        Ok(SfuRoom {
            url: self.room_url(&name),
            name,
        })
    }

    pub async fn create_meeting_token(
        &self,
        room_name: &str,
        user_id: Uuid,
        display_name: &str,
        is_owner: bool,
    ) -> Result<String, AppError> {
        let expiry = Utc::now().timestamp() + self.config.token_ttl_seconds as i64;

        let body = json!({
            "properties": {
                "room_name": room_name,
                "user_id": user_id.to_string(),
                "user_name": display_name,
                "is_owner": is_owner,
                "exp": expiry,
            }
        });

        let response = self
            .http
            .post(format!("{}/meeting-tokens", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::External(format!("SFU token request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::External(format!(
                "SFU token request returned {}",
                response.status()
            )));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AppError::External(format!("SFU token response unreadable: {}", e)))?;

        payload
            .get("token")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AppError::External("SFU token response missing token".to_string()))
    }

    /// Deletes a room. A 404 means it is already gone and counts as success.
    pub async fn delete_room(&self, room_name: &str) -> Result<(), AppError> {
        let response = self
            .http
            .delete(format!("{}/rooms/{}", self.config.base_url, room_name))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| AppError::External(format!("SFU delete room failed: {}", e)))?;

        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(AppError::External(format!(
                "SFU delete room returned {}",
                response.status()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_names_are_prefixed_with_call() {
        let call_id = Uuid::new_v4();
        assert_eq!(SfuClient::room_name(call_id), format!("call-{}", call_id));
    }

    #[test]
    fn room_url_uses_configured_domain() {
        let client = SfuClient::new(SfuConfig {
            base_url: "https://api.daily.co/v1".to_string(),
            api_key: "k".to_string(),
            domain: "wavechat.daily.co".to_string(),
            room_expiry_seconds: 3600,
            token_ttl_seconds: 3600,
            http_timeout_seconds: 10,
        })
        .unwrap();
        assert_eq!(
            client.room_url("call-abc"),
            "https://wavechat.daily.co/call-abc"
        );
    }
}
