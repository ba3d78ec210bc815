use redis::{aio::ConnectionManager, AsyncCommands, Client, Script};
use serde::{de::DeserializeOwned, Serialize};

use crate::{AppError, RedisConfig};

/// Key-value store used for live call sessions, per-user busy indices,
/// dedup sets, result caches and the end-of-call lock. The cache is the only
/// cross-process shared state for in-flight calls.
#[derive(Clone)]
pub struct CacheService {
    manager: ConnectionManager,
}

impl CacheService {
    pub async fn new(config: &RedisConfig) -> Result<Self, AppError> {
        let client = Client::open(config.connection_string()).map_err(AppError::Redis)?;

        let manager = ConnectionManager::new(client).await.map_err(AppError::Redis)?;

        // Test connection
        let mut conn = manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(AppError::Redis)?;

        tracing::info!("Redis connection established");

        Ok(Self { manager })
    }

    pub async fn get_string(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut conn = self.manager.clone();
        conn.get(key).await.map_err(AppError::Redis)
    }

    pub async fn set_string(&self, key: &str, value: &str, ttl_seconds: usize) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        conn.set_ex(key, value, ttl_seconds as u64).await.map_err(AppError::Redis)
    }

    pub async fn get_json<T>(&self, key: &str) -> Result<Option<T>, AppError>
    where
        T: DeserializeOwned,
    {
        let raw: Option<String> = self.get_string(key).await?;
        match raw {
            Some(data) => {
                let value = serde_json::from_str(&data)
                    .map_err(|e| AppError::Internal(format!("Cache deserialization error: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn set_json<T>(&self, key: &str, value: &T, ttl_seconds: usize) -> Result<(), AppError>
    where
        T: Serialize,
    {
        let serialized = serde_json::to_string(value)
            .map_err(|e| AppError::Internal(format!("Cache serialization error: {}", e)))?;
        self.set_string(key, &serialized, ttl_seconds).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        conn.del(key).await.map_err(AppError::Redis)
    }

    /// Refreshes a key's TTL. Returns false if the key no longer exists.
    pub async fn expire(&self, key: &str, ttl_seconds: usize) -> Result<bool, AppError> {
        let mut conn = self.manager.clone();
        conn.expire(key, ttl_seconds as i64).await.map_err(AppError::Redis)
    }

    /// Atomic SET NX PX. Returns true when this caller created the key.
    /// This is the acquisition primitive for the per-call end lock.
    pub async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_millis: usize,
    ) -> Result<bool, AppError> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis)
            .query_async(&mut conn)
            .await
            .map_err(AppError::Redis)?;
        Ok(reply.is_some())
    }

    /// Deletes the key only if its current value equals `expected`.
    /// Used to release the end lock without clobbering a successor's token.
    pub async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, AppError> {
        let script = Script::new(
            r"if redis.call('GET', KEYS[1]) == ARGV[1] then
                  return redis.call('DEL', KEYS[1])
              else
                  return 0
              end",
        );
        let mut conn = self.manager.clone();
        let deleted: i32 = script
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(AppError::Redis)?;
        Ok(deleted == 1)
    }

    // Set-member operations (block lists, active-conversation membership)

    pub async fn set_add(&self, key: &str, member: &str) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        conn.sadd(key, member).await.map_err(AppError::Redis)
    }

    pub async fn set_remove(&self, key: &str, member: &str) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        conn.srem(key, member).await.map_err(AppError::Redis)
    }

    pub async fn set_members(&self, key: &str) -> Result<Vec<String>, AppError> {
        let mut conn = self.manager.clone();
        conn.smembers(key).await.map_err(AppError::Redis)
    }

    pub async fn set_contains(&self, key: &str, member: &str) -> Result<bool, AppError> {
        let mut conn = self.manager.clone();
        conn.sismember(key, member).await.map_err(AppError::Redis)
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(AppError::Redis)?;
        Ok(())
    }
}

/// Cache key builders. Every live-call key is namespaced under `call:` so the
/// whole subsystem can be inspected with one SCAN pattern.
pub struct CacheKeys;

impl CacheKeys {
    pub fn call_session(call_id: &str) -> String {
        format!("call:session:{}", call_id)
    }

    pub fn user_current_call(user_id: &str) -> String {
        format!("call:user:{}:current", user_id)
    }

    pub fn end_lock(call_id: &str) -> String {
        format!("call:end_lock:{}", call_id)
    }

    pub fn end_result(call_id: &str) -> String {
        format!("call:result:{}", call_id)
    }

    pub fn missed_count(user_id: &str) -> String {
        format!("call:missed:count:{}", user_id)
    }

    pub fn missed_viewed_at(user_id: &str) -> String {
        format!("call:missed:viewed_at:{}", user_id)
    }

    pub fn block_set(user_id: &str) -> String {
        format!("block:{}", user_id)
    }

    pub fn ice_policy(user_id: &str) -> String {
        format!("privacy:ice_policy:{}", user_id)
    }

    pub fn conversation_active(conversation_id: &str) -> String {
        format!("conversation:active:{}", conversation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_match_wire_contract() {
        assert_eq!(CacheKeys::call_session("abc"), "call:session:abc");
        assert_eq!(CacheKeys::user_current_call("u1"), "call:user:u1:current");
        assert_eq!(CacheKeys::end_lock("abc"), "call:end_lock:abc");
        assert_eq!(CacheKeys::end_result("abc"), "call:result:abc");
        assert_eq!(CacheKeys::missed_count("u1"), "call:missed:count:u1");
        assert_eq!(CacheKeys::missed_viewed_at("u1"), "call:missed:viewed_at:u1");
    }
}
