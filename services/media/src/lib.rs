pub mod attachments;
pub mod config;
pub mod image_ops;
pub mod keys;
pub mod models;
pub mod progress;
pub mod queue;
pub mod routes;
pub mod storage;
pub mod sweeper;
pub mod upload;
pub mod validate;
pub mod video_ops;
pub mod worker;

use wavechat_auth::JwtService;
use wavechat_common::CacheService;

use crate::config::MediaConfig;
use crate::progress::ProgressNotifier;
use crate::upload::UploadService;

#[derive(Clone)]
pub struct AppState {
    pub config: MediaConfig,
    pub db_pool: sqlx::PgPool,
    pub cache: CacheService,
    pub jwt_service: JwtService,
    pub uploads: UploadService,
    pub progress: ProgressNotifier,
}
