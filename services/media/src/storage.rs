use std::path::Path;
use std::time::Duration;

use aws_config::BehaviorVersion;
use aws_sdk_s3::{presigning::PresigningConfig, primitives::ByteStream, Client};

use wavechat_common::AppError;

use crate::config::StorageConfig;

/// Object-store facade: presigned uploads, existence probes that understand
/// in-flight multipart uploads, streamed downloads to scoped temp files, and
/// the copy+delete move that promotes a temp key.
#[derive(Clone)]
pub struct StorageService {
    client: Client,
    config: StorageConfig,
}

impl StorageService {
    pub async fn new(config: &StorageConfig) -> Result<Self, AppError> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        Ok(Self {
            client: Client::new(&aws_config),
            config: config.clone(),
        })
    }

    pub async fn presigned_put_url(&self, key: &str, mime_type: &str) -> Result<String, AppError> {
        let presigning = PresigningConfig::expires_in(Duration::from_secs(
            self.config.presign_expiry_seconds,
        ))
        .map_err(|e| AppError::Internal(format!("Failed to build presigning config: {}", e)))?;

        let request = self
            .client
            .put_object()
            .bucket(&self.config.bucket_name)
            .key(key)
            .content_type(mime_type)
            .presigned(presigning)
            .await
            .map_err(|e| AppError::External(format!("Failed to presign upload: {}", e)))?;

        Ok(request.uri().to_string())
    }

    pub async fn object_exists(&self, key: &str) -> Result<bool, AppError> {
        match self
            .client
            .head_object()
            .bucket(&self.config.bucket_name)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(AppError::External(format!("HEAD failed: {}", service_err)))
                }
            }
        }
    }

    /// A confirm can race the client's multipart upload; the caller keeps
    /// retrying while parts are still arriving.
    pub async fn multipart_in_progress(&self, key: &str) -> Result<bool, AppError> {
        let uploads = self
            .client
            .list_multipart_uploads()
            .bucket(&self.config.bucket_name)
            .prefix(key)
            .send()
            .await
            .map_err(|e| AppError::External(format!("ListMultipartUploads failed: {}", e)))?;

        Ok(uploads
            .uploads()
            .iter()
            .any(|upload| upload.key() == Some(key)))
    }

    /// Streams the object to `path` without buffering it in memory.
    pub async fn download_to_file(&self, key: &str, path: &Path) -> Result<(), AppError> {
        let object = self
            .client
            .get_object()
            .bucket(&self.config.bucket_name)
            .key(key)
            .send()
            .await
            .map_err(|e| AppError::External(format!("GET {} failed: {}", key, e)))?;

        let mut reader = object.body.into_async_read();
        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to create temp file: {}", e)))?;
        tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to stream object: {}", e)))?;
        Ok(())
    }

    pub async fn upload_file(&self, key: &str, path: &Path, mime_type: &str) -> Result<(), AppError> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to read upload body: {}", e)))?;

        self.client
            .put_object()
            .bucket(&self.config.bucket_name)
            .key(key)
            .content_type(mime_type)
            .body(body)
            .send()
            .await
            .map_err(|e| AppError::External(format!("PUT {} failed: {}", key, e)))?;
        Ok(())
    }

    /// Copy-then-delete move. The attachment row only adopts the new key
    /// after the copy succeeded, so a crash in between leaves the temp
    /// object for the sweeper instead of losing data.
    pub async fn move_object(&self, from_key: &str, to_key: &str) -> Result<(), AppError> {
        let copy_source = format!("{}/{}", self.config.bucket_name, from_key);
        self.client
            .copy_object()
            .bucket(&self.config.bucket_name)
            .key(to_key)
            .copy_source(&copy_source)
            .send()
            .await
            .map_err(|e| AppError::External(format!("COPY {} failed: {}", from_key, e)))?;

        self.client
            .delete_object()
            .bucket(&self.config.bucket_name)
            .key(from_key)
            .send()
            .await
            .map_err(|e| AppError::External(format!("DELETE {} failed: {}", from_key, e)))?;
        Ok(())
    }

    pub async fn delete_object(&self, key: &str) -> Result<(), AppError> {
        self.client
            .delete_object()
            .bucket(&self.config.bucket_name)
            .key(key)
            .send()
            .await
            .map_err(|e| AppError::External(format!("DELETE {} failed: {}", key, e)))?;
        Ok(())
    }

    pub fn public_url(&self, key: &str) -> String {
        match &self.config.cdn_domain {
            Some(domain) => format!("https://{}/{}", domain, key),
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                self.config.bucket_name, self.config.region, key
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(cdn: Option<&str>) -> StorageConfig {
        StorageConfig {
            bucket_name: "wavechat-media".to_string(),
            region: "ap-southeast-1".to_string(),
            cdn_domain: cdn.map(str::to_string),
            presign_expiry_seconds: 900,
        }
    }

    #[tokio::test]
    async fn public_url_prefers_cdn() {
        let storage = StorageService::new(&test_config(Some("cdn.wavechat.io")))
            .await
            .unwrap();
        assert_eq!(
            storage.public_url("permanent/2026/01/unlinked/abc.jpg"),
            "https://cdn.wavechat.io/permanent/2026/01/unlinked/abc.jpg"
        );
    }

    #[tokio::test]
    async fn public_url_falls_back_to_bucket() {
        let storage = StorageService::new(&test_config(None)).await.unwrap();
        assert_eq!(
            storage.public_url("k"),
            "https://wavechat-media.s3.ap-southeast-1.amazonaws.com/k"
        );
    }
}
