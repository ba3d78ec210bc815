use serde::{Deserialize, Serialize};

use wavechat_common::{DatabaseConfig, JwtConfig, RedisConfig, ServerConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub storage: StorageConfig,
    pub limits: UploadLimitsConfig,
    pub processing: ProcessingConfig,
    pub queue: QueueConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub bucket_name: String,
    pub region: String,
    pub cdn_domain: Option<String>,
    pub presign_expiry_seconds: u64,
}

/// Per-type upload ceilings in bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadLimitsConfig {
    pub image_max_bytes: i64,
    pub video_max_bytes: i64,
    pub audio_max_bytes: i64,
    pub document_max_bytes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    pub thumbnail_size: u32,
    pub optimized_dimension: u32,
    pub hls_enabled: bool,
    pub hls_min_duration_seconds: f64,
    pub hls_min_width: u32,
    pub worker_concurrency: usize,
    pub fetch_retry_attempts: u32,
    pub fetch_retry_delay_millis: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// "redis" for the local broker, "sqs" for the remote long-poll queue.
    pub provider: String,
    pub sqs_queue_url: String,
    pub max_attempts: u32,
    pub retry_backoff_millis: u64,
    pub long_poll_seconds: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Soft-deleted attachments stay this long before physical deletion.
    pub deleted_grace_hours: i64,
    /// Pending uploads whose presigned URL lapsed get expired after this.
    pub pending_expiry_hours: i64,
    pub sweep_cron: String,
}

impl MediaConfig {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            server: ServerConfig::from_env("MEDIA_PORT", 8005),
            database: DatabaseConfig::from_env(),
            redis: RedisConfig::from_env(),
            jwt: JwtConfig::from_env(),
            storage: StorageConfig {
                bucket_name: std::env::var("S3_BUCKET")
                    .unwrap_or_else(|_| "wavechat-media".to_string()),
                region: std::env::var("S3_REGION").unwrap_or_else(|_| "ap-southeast-1".to_string()),
                cdn_domain: std::env::var("CDN_DOMAIN").ok().filter(|d| !d.is_empty()),
                presign_expiry_seconds: env_parse("UPLOAD_PRESIGN_EXPIRY_SECONDS", 900),
            },
            limits: UploadLimitsConfig {
                image_max_bytes: env_parse("UPLOAD_IMAGE_MAX_BYTES", 25 * 1024 * 1024),
                video_max_bytes: env_parse("UPLOAD_VIDEO_MAX_BYTES", 512 * 1024 * 1024),
                audio_max_bytes: env_parse("UPLOAD_AUDIO_MAX_BYTES", 50 * 1024 * 1024),
                document_max_bytes: env_parse("UPLOAD_DOCUMENT_MAX_BYTES", 100 * 1024 * 1024),
            },
            processing: ProcessingConfig {
                thumbnail_size: env_parse("MEDIA_THUMBNAIL_SIZE", 320),
                optimized_dimension: env_parse("MEDIA_OPTIMIZED_DIMENSION", 1600),
                hls_enabled: env_parse("MEDIA_HLS_ENABLED", false),
                hls_min_duration_seconds: env_parse("MEDIA_HLS_MIN_DURATION_SECONDS", 30.0),
                hls_min_width: env_parse("MEDIA_HLS_MIN_WIDTH", 1280),
                worker_concurrency: env_parse("MEDIA_WORKER_CONCURRENCY", 4),
                fetch_retry_attempts: env_parse("MEDIA_FETCH_RETRY_ATTEMPTS", 5),
                fetch_retry_delay_millis: env_parse("MEDIA_FETCH_RETRY_DELAY_MILLIS", 500),
            },
            queue: QueueConfig {
                provider: std::env::var("MEDIA_QUEUE_PROVIDER")
                    .unwrap_or_else(|_| "redis".to_string()),
                sqs_queue_url: std::env::var("MEDIA_SQS_QUEUE_URL").unwrap_or_default(),
                max_attempts: env_parse("MEDIA_QUEUE_MAX_ATTEMPTS", 3),
                retry_backoff_millis: env_parse("MEDIA_QUEUE_RETRY_BACKOFF_MILLIS", 2000),
                long_poll_seconds: env_parse("MEDIA_QUEUE_LONG_POLL_SECONDS", 20),
            },
            retention: RetentionConfig {
                deleted_grace_hours: env_parse("MEDIA_DELETED_GRACE_HOURS", 72),
                pending_expiry_hours: env_parse("MEDIA_PENDING_EXPIRY_HOURS", 24),
                sweep_cron: std::env::var("MEDIA_SWEEP_CRON")
                    .unwrap_or_else(|_| "0 0 * * * *".to_string()),
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
    fn defaults_are_sane() {
        let config = MediaConfig::from_env().unwrap();
        assert_eq!(config.queue.long_poll_seconds, 20);
        assert_eq!(config.processing.thumbnail_size, 320);
        assert!(config.limits.video_max_bytes > config.limits.image_max_bytes);
    }
}
