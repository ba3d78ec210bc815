use std::collections::HashMap;

use serde_json::Value;

use wavechat_common::AppError;

/// Transformation applied to a raw event value. Upgrades move version N to
/// N+1, downgrades move N to N-1; both operate on JSON so producers and
/// consumers can evolve without lockstep deploys.
pub type TransformFn = fn(Value) -> Result<Value, AppError>;

/// Per-event-type version strategy: a ladder of single-step upgrades and
/// downgrades, walked one rung at a time.
pub struct VersionStrategy {
    event_type: &'static str,
    current_version: u32,
    upgrades: HashMap<u32, TransformFn>,
    downgrades: HashMap<u32, TransformFn>,
}

impl VersionStrategy {
    pub fn new(event_type: &'static str, current_version: u32) -> Self {
        Self {
            event_type,
            current_version,
            upgrades: HashMap::new(),
            downgrades: HashMap::new(),
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.event_type
    }

    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    /// Registers the handler that lifts version `from` to `from + 1`.
    pub fn with_upgrade(mut self, from: u32, transform: TransformFn) -> Self {
        self.upgrades.insert(from, transform);
        self
    }

    /// Registers the handler that lowers version `to + 1` to `to`.
    pub fn with_downgrade(mut self, to: u32, transform: TransformFn) -> Self {
        self.downgrades.insert(to, transform);
        self
    }

    /// Can this strategy consume the given raw event? True when the shape
    /// carries an `eventType` and its version does not exceed ours.
    pub fn can_consume(&self, raw: &Value) -> bool {
        let has_type = raw.get("eventType").and_then(Value::as_str).is_some();
        let version = raw.get("version").and_then(Value::as_u64).unwrap_or(0) as u32;
        has_type && version >= 1 && version <= self.current_version
    }

    pub fn upgrade_to_current(&self, mut raw: Value) -> Result<Value, AppError> {
        let mut version = event_version(&raw)?;
        if version > self.current_version {
            return Err(AppError::Validation(format!(
                "Event {} v{} is newer than supported v{}",
                self.event_type, version, self.current_version
            )));
        }
        while version < self.current_version {
            let transform = self.upgrades.get(&version).ok_or_else(|| {
                AppError::Internal(format!(
                    "No upgrade path for {} v{} -> v{}",
                    self.event_type,
                    version,
                    version + 1
                ))
            })?;
            raw = transform(raw)?;
            version = event_version(&raw)?;
        }
        Ok(raw)
    }

    pub fn downgrade_to(&self, mut raw: Value, target: u32) -> Result<Value, AppError> {
        let mut version = event_version(&raw)?;
        if target > version {
            return Err(AppError::BadInput(format!(
                "Cannot downgrade {} v{} to newer v{}",
                self.event_type, version, target
            )));
        }
        while version > target {
            let transform = self.downgrades.get(&(version - 1)).ok_or_else(|| {
                AppError::Internal(format!(
                    "No downgrade path for {} v{} -> v{}",
                    self.event_type,
                    version,
                    version - 1
                ))
            })?;
            raw = transform(raw)?;
            version = event_version(&raw)?;
        }
        Ok(raw)
    }
}

fn event_version(raw: &Value) -> Result<u32, AppError> {
    raw.get("version")
        .and_then(Value::as_u64)
        .map(|v| v as u32)
        .ok_or_else(|| AppError::Validation("Event is missing a numeric version".to_string()))
}

/// Process-wide registry of version strategies. Built once at startup and
/// only read afterwards; hot paths see an immutable map.
pub struct EventVersionRegistry {
    strategies: HashMap<&'static str, VersionStrategy>,
}

impl EventVersionRegistry {
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    pub fn register(mut self, strategy: VersionStrategy) -> Self {
        self.strategies.insert(strategy.event_type(), strategy);
        self
    }

    pub fn strategy(&self, event_type: &str) -> Option<&VersionStrategy> {
        self.strategies.get(event_type)
    }

    /// Lifts a raw event to the current version of its type. Types without a
    /// registered strategy pass through untouched.
    pub fn upgrade_to_current(&self, raw: Value) -> Result<Value, AppError> {
        let event_type = raw
            .get("eventType")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("Event is missing eventType".to_string()))?
            .to_string();

        match self.strategies.get(event_type.as_str()) {
            Some(strategy) => strategy.upgrade_to_current(raw),
            None => Ok(raw),
        }
    }

    pub fn compatible(&self, raw: &Value) -> bool {
        match raw.get("eventType").and_then(Value::as_str) {
            Some(event_type) => self
                .strategies
                .get(event_type)
                .map(|s| s.can_consume(raw))
                .unwrap_or(true),
            None => false,
        }
    }
}

impl Default for EventVersionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The strategies this deployment understands. `call.ended` moved to v2 when
/// group calls landed: v1 carried a single `peerId`, v2 carries
/// `receiverIds` plus the media `provider`.
pub fn default_registry() -> EventVersionRegistry {
    EventVersionRegistry::new()
        .register(
            VersionStrategy::new("call.ended", 2)
                .with_upgrade(1, upgrade_call_ended_v1)
                .with_downgrade(1, downgrade_call_ended_v2),
        )
        .register(VersionStrategy::new("call.initiated", 1))
        .register(VersionStrategy::new("media.uploaded", 1))
        .register(VersionStrategy::new("media.processed", 1))
        .register(VersionStrategy::new("media.failed", 1))
        .register(VersionStrategy::new("media.deleted", 1))
        .register(VersionStrategy::new("user.blocked", 1))
        .register(VersionStrategy::new("user.unblocked", 1))
        .register(VersionStrategy::new("friendship.created", 1))
        .register(VersionStrategy::new("friendship.removed", 1))
        .register(VersionStrategy::new("privacy.updated", 1))
}

fn upgrade_call_ended_v1(mut raw: Value) -> Result<Value, AppError> {
    let obj = raw
        .as_object_mut()
        .ok_or_else(|| AppError::Validation("call.ended event must be an object".to_string()))?;

    let peer = obj.remove("peerId");
    let receiver_ids = match peer {
        Some(peer_id) => Value::Array(vec![peer_id]),
        None => Value::Array(vec![]),
    };
    obj.insert("receiverIds".to_string(), receiver_ids);
    obj.entry("provider".to_string()).or_insert(Value::String("P2P".to_string()));
    obj.insert("version".to_string(), Value::from(2));
    Ok(raw)
}

fn downgrade_call_ended_v2(mut raw: Value) -> Result<Value, AppError> {
    let obj = raw
        .as_object_mut()
        .ok_or_else(|| AppError::Validation("call.ended event must be an object".to_string()))?;

    if let Some(Value::Array(receivers)) = obj.remove("receiverIds") {
        if let Some(first) = receivers.into_iter().next() {
            obj.insert("peerId".to_string(), first);
        }
    }
    obj.remove("provider");
    obj.insert("version".to_string(), Value::from(1));
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v1_call_ended() -> Value {
        json!({
            "eventId": "7b6fc2f0-66a4-4b9e-93a6-62fb70e5e7d1",
            "eventType": "call.ended",
            "version": 1,
            "timestamp": "2026-01-04T10:00:00Z",
            "source": "calls",
            "aggregateId": "call-1",
            "callId": "6e8bc430-9c3a-11d9-9669-0800200c9a66",
            "peerId": "f47ac10b-58cc-4372-a567-0e02b2c3d479",
            "status": "completed",
            "reason": "USER_HANGUP",
            "durationSeconds": 12
        })
    }

    #[test]
    fn upgrades_v1_to_v2() {
        let registry = default_registry();
        let upgraded = registry.upgrade_to_current(v1_call_ended()).unwrap();

        assert_eq!(upgraded["version"], 2);
        assert_eq!(upgraded["provider"], "P2P");
        assert_eq!(
            upgraded["receiverIds"],
            json!(["f47ac10b-58cc-4372-a567-0e02b2c3d479"])
        );
        assert!(upgraded.get("peerId").is_none());
    }

    #[test]
    fn downgrade_restores_single_peer_shape() {
        let registry = default_registry();
        let strategy = registry.strategy("call.ended").unwrap();

        let upgraded = strategy.upgrade_to_current(v1_call_ended()).unwrap();
        let downgraded = strategy.downgrade_to(upgraded, 1).unwrap();

        assert_eq!(downgraded["version"], 1);
        assert_eq!(downgraded["peerId"], "f47ac10b-58cc-4372-a567-0e02b2c3d479");
        assert!(downgraded.get("receiverIds").is_none());
        assert!(downgraded.get("provider").is_none());
    }

    #[test]
    fn rejects_events_from_the_future() {
        let registry = default_registry();
        let mut raw = v1_call_ended();
        raw["version"] = json!(9);

        assert!(!registry.compatible(&raw));
        assert!(registry.upgrade_to_current(raw).is_err());
    }

    #[test]
    fn compatibility_requires_event_type() {
        let registry = default_registry();
        assert!(!registry.compatible(&json!({"version": 1})));
    }
}
