use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use redis::aio::ConnectionManager;

use wavechat_common::{AppError, RedisConfig};

use crate::config::QueueConfig;
use crate::models::{MediaJob, QueueStats};
use crate::worker::MediaWorker;

const IMAGE_QUEUE: &str = "media:queue:image";
const VIDEO_QUEUE: &str = "media:queue:video";
const FILE_QUEUE: &str = "media:queue:file";
const DEAD_QUEUE: &str = "media:queue:dead";

/// Capability set shared by both queue backends. Producers only ever see
/// this trait; the consumers differ in their polling loop and nothing else.
#[async_trait]
pub trait MediaQueue: Send + Sync {
    async fn enqueue_image(&self, job: MediaJob) -> Result<(), AppError>;
    async fn enqueue_video(&self, job: MediaJob) -> Result<(), AppError>;
    async fn enqueue_file(&self, job: MediaJob) -> Result<(), AppError>;
    async fn stats(&self) -> Result<QueueStats, AppError>;
}

fn encode_job(job: &MediaJob) -> Result<String, AppError> {
    serde_json::to_string(job)
        .map_err(|e| AppError::Internal(format!("Failed to serialize media job: {}", e)))
}

fn decode_job(raw: &str) -> Result<MediaJob, AppError> {
    serde_json::from_str(raw)
        .map_err(|e| AppError::Internal(format!("Malformed media job: {}", e)))
}

// Local broker backend (Redis lists)

/// List-backed broker for single-region deployments. Retries are explicit:
/// a failed job is re-pushed with an incremented attempt counter after a
/// linear backoff until the configured limit, then dead-lettered.
#[derive(Clone)]
pub struct RedisQueue {
    manager: ConnectionManager,
    config: QueueConfig,
}

impl RedisQueue {
    pub async fn new(redis: &RedisConfig, config: QueueConfig) -> Result<Self, AppError> {
        let client = redis::Client::open(redis.connection_string()).map_err(AppError::Redis)?;
        let manager = ConnectionManager::new(client).await.map_err(AppError::Redis)?;
        Ok(Self { manager, config })
    }

    async fn push(&self, queue: &str, job: &MediaJob) -> Result<(), AppError> {
        let payload = encode_job(job)?;
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("LPUSH")
            .arg(queue)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(AppError::Redis)?;
        Ok(())
    }

    async fn queue_len(&self, queue: &str) -> Result<u64, AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("LLEN")
            .arg(queue)
            .query_async(&mut conn)
            .await
            .map_err(AppError::Redis)
    }

    /// Blocking pop across all three job queues; None on poll timeout.
    async fn pop(&self, timeout_seconds: usize) -> Result<Option<MediaJob>, AppError> {
        let mut conn = self.manager.clone();
        let reply: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(IMAGE_QUEUE)
            .arg(VIDEO_QUEUE)
            .arg(FILE_QUEUE)
            .arg(timeout_seconds)
            .query_async(&mut conn)
            .await
            .map_err(AppError::Redis)?;

        match reply {
            Some((_queue, payload)) => decode_job(&payload).map(Some),
            None => Ok(None),
        }
    }

    async fn dead_letter(&self, job: &MediaJob) -> Result<(), AppError> {
        self.push(DEAD_QUEUE, job).await
    }
}

#[async_trait]
impl MediaQueue for RedisQueue {
    async fn enqueue_image(&self, job: MediaJob) -> Result<(), AppError> {
        self.push(IMAGE_QUEUE, &job).await
    }

    async fn enqueue_video(&self, job: MediaJob) -> Result<(), AppError> {
        self.push(VIDEO_QUEUE, &job).await
    }

    async fn enqueue_file(&self, job: MediaJob) -> Result<(), AppError> {
        self.push(FILE_QUEUE, &job).await
    }

    async fn stats(&self) -> Result<QueueStats, AppError> {
        let queued = self.queue_len(IMAGE_QUEUE).await?
            + self.queue_len(VIDEO_QUEUE).await?
            + self.queue_len(FILE_QUEUE).await?;
        Ok(QueueStats {
            queued,
            dead_lettered: self.queue_len(DEAD_QUEUE).await?,
        })
    }
}

/// Consumer loop for the local broker. Each worker task processes one
/// message at a time; media encoding concurrency is bounded by the number
/// of these tasks, not by anything inside the worker.
pub struct RedisQueueConsumer {
    queue: RedisQueue,
    worker: Arc<MediaWorker>,
}

impl RedisQueueConsumer {
    pub fn new(queue: RedisQueue, worker: Arc<MediaWorker>) -> Self {
        Self { queue, worker }
    }

    pub fn spawn(self, concurrency: usize) {
        let consumer = Arc::new(self);
        for worker_index in 0..concurrency {
            let consumer = consumer.clone();
            tokio::spawn(async move {
                tracing::info!("Media worker {} (redis) started", worker_index);
                consumer.run().await;
            });
        }
    }

    async fn run(&self) {
        loop {
            let job = match self.queue.pop(5).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!("Queue poll failed: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };

            let final_attempt = job.attempt + 1 >= self.queue.config.max_attempts;
            if let Err(e) = self.worker.process(&job, final_attempt).await {
                tracing::warn!(
                    "Job for attachment {} failed on attempt {}: {}",
                    job.attachment_id,
                    job.attempt + 1,
                    e
                );
                if final_attempt {
                    if let Err(dead_err) = self.queue.dead_letter(&job).await {
                        tracing::error!("Dead-letter push failed: {}", dead_err);
                    }
                } else {
                    let backoff = std::time::Duration::from_millis(
                        self.queue.config.retry_backoff_millis * (job.attempt as u64 + 1),
                    );
                    tokio::time::sleep(backoff).await;
                    let retry = MediaJob {
                        attempt: job.attempt + 1,
                        ..job
                    };
                    let target = match retry.media_type {
                        crate::models::MediaType::Image => IMAGE_QUEUE,
                        crate::models::MediaType::Video => VIDEO_QUEUE,
                        _ => FILE_QUEUE,
                    };
                    if let Err(push_err) = self.queue.push(target, &retry).await {
                        tracing::error!("Retry push failed: {}", push_err);
                    }
                }
            }
        }
    }
}

// Remote backend (SQS long polling)

/// Long-poll remote queue. Redelivery is the broker's: an unacked message
/// reappears after the visibility timeout, and the broker's max-receive
/// policy routes poison messages to the dead-letter queue.
#[derive(Clone)]
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    config: QueueConfig,
}

impl SqsQueue {
    pub async fn new(config: QueueConfig) -> Result<Self, AppError> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Ok(Self {
            client: aws_sdk_sqs::Client::new(&aws_config),
            config,
        })
    }

    async fn send(&self, job: &MediaJob) -> Result<(), AppError> {
        let payload = encode_job(job)?;
        self.client
            .send_message()
            .queue_url(&self.config.sqs_queue_url)
            .message_body(payload)
            .send()
            .await
            .map_err(|e| AppError::External(format!("SQS send failed: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl MediaQueue for SqsQueue {
    async fn enqueue_image(&self, job: MediaJob) -> Result<(), AppError> {
        self.send(&job).await
    }

    async fn enqueue_video(&self, job: MediaJob) -> Result<(), AppError> {
        self.send(&job).await
    }

    async fn enqueue_file(&self, job: MediaJob) -> Result<(), AppError> {
        self.send(&job).await
    }

    async fn stats(&self) -> Result<QueueStats, AppError> {
        let attributes = self
            .client
            .get_queue_attributes()
            .queue_url(&self.config.sqs_queue_url)
            .attribute_names(aws_sdk_sqs::types::QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|e| AppError::External(format!("SQS attributes failed: {}", e)))?;

        let queued = attributes
            .attributes()
            .and_then(|map| {
                map.get(&aws_sdk_sqs::types::QueueAttributeName::ApproximateNumberOfMessages)
            })
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);

        Ok(QueueStats {
            queued,
            dead_lettered: 0,
        })
    }
}

pub struct SqsQueueConsumer {
    queue: SqsQueue,
    worker: Arc<MediaWorker>,
}

impl SqsQueueConsumer {
    pub fn new(queue: SqsQueue, worker: Arc<MediaWorker>) -> Self {
        Self { queue, worker }
    }

    pub fn spawn(self, concurrency: usize) {
        let consumer = Arc::new(self);
        for worker_index in 0..concurrency {
            let consumer = consumer.clone();
            tokio::spawn(async move {
                tracing::info!("Media worker {} (sqs) started", worker_index);
                consumer.run().await;
            });
        }
    }

    async fn run(&self) {
        loop {
            let received = self
                .queue
                .client
                .receive_message()
                .queue_url(&self.queue.config.sqs_queue_url)
                .wait_time_seconds(self.queue.config.long_poll_seconds)
                .max_number_of_messages(1)
                .message_system_attribute_names(
                    aws_sdk_sqs::types::MessageSystemAttributeName::ApproximateReceiveCount,
                )
                .send()
                .await;

            let output = match received {
                Ok(output) => output,
                Err(e) => {
                    tracing::error!("SQS receive failed: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };

            for message in output.messages.unwrap_or_default() {
                let Some(body) = message.body() else { continue };
                let job = match decode_job(body) {
                    Ok(job) => job,
                    Err(e) => {
                        tracing::error!("Dropping malformed SQS message: {}", e);
                        self.delete(&message).await;
                        continue;
                    }
                };

                let receive_count: u32 = message
                    .attributes()
                    .and_then(|map| {
                        map.get(&aws_sdk_sqs::types::MessageSystemAttributeName::ApproximateReceiveCount)
                    })
                    .and_then(|raw| raw.parse().ok())
                    .unwrap_or(1);
                let final_attempt = receive_count >= self.queue.config.max_attempts;

                match self.worker.process(&job, final_attempt).await {
                    Ok(()) => self.delete(&message).await,
                    Err(e) => {
                        // Leave the message in place: visibility expiry
                        // redelivers it, and the broker's redrive policy
                        // dead-letters it past max receives.
                        tracing::warn!(
                            "Job for attachment {} failed (receive {}): {}",
                            job.attachment_id,
                            receive_count,
                            e
                        );
                    }
                }
            }
        }
    }

    async fn delete(&self, message: &aws_sdk_sqs::types::Message) {
        let Some(receipt) = message.receipt_handle() else {
            return;
        };
        if let Err(e) = self
            .queue
            .client
            .delete_message()
            .queue_url(&self.queue.config.sqs_queue_url)
            .receipt_handle(receipt)
            .send()
            .await
        {
            tracing::error!("SQS delete failed: {}", e);
        }
    }
}
