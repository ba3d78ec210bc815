pub mod config;
pub mod history;
pub mod hub;
pub mod ice;
pub mod listeners;
pub mod models;
pub mod policy;
pub mod routes;
pub mod sfu;
pub mod socket;
pub mod state_machine;

use std::sync::Arc;

use wavechat_auth::JwtService;
use wavechat_common::CacheService;

use crate::config::CallsConfig;
use crate::history::CallHistoryService;
use crate::hub::SignalingHub;

#[derive(Clone)]
pub struct AppState {
    pub config: CallsConfig,
    pub db_pool: sqlx::PgPool,
    pub cache: CacheService,
    pub jwt_service: JwtService,
    pub history: CallHistoryService,
    pub hub: Arc<SignalingHub>,
}
