use async_trait::async_trait;
use uuid::Uuid;

use wavechat_common::{AppError, CacheKeys, CacheService};

/// Privacy/block policy as a single predicate. Rule evaluation lives in the
/// user domain; the hub only asks whether a call may be placed.
#[async_trait]
pub trait CallPolicy: Send + Sync {
    async fn may_call(&self, caller_id: Uuid, callee_id: Uuid) -> Result<bool, AppError>;
}

/// Policy backed by the block sets the block listener maintains. A call is
/// refused when either side blocks the other.
pub struct CacheBackedCallPolicy {
    cache: CacheService,
}

impl CacheBackedCallPolicy {
    pub fn new(cache: CacheService) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl CallPolicy for CacheBackedCallPolicy {
    async fn may_call(&self, caller_id: Uuid, callee_id: Uuid) -> Result<bool, AppError> {
        let caller_blocked = self
            .cache
            .set_contains(
                &CacheKeys::block_set(&callee_id.to_string()),
                &caller_id.to_string(),
            )
            .await?;
        if caller_blocked {
            return Ok(false);
        }

        let callee_blocked = self
            .cache
            .set_contains(
                &CacheKeys::block_set(&caller_id.to_string()),
                &callee_id.to_string(),
            )
            .await?;
        Ok(!callee_blocked)
    }
}
