use chrono::Utc;
use image::ImageFormat;
use rand::Rng;
use sha2::{Digest, Sha256};
use shared::ScreeningCategory;
use std::sync::Arc;
use std::time::Duration;

use crate::config::UploadPolicy;
use crate::error::PipelineError;
use crate::model::StorageObjectRef;
use crate::storage::s3_service::{ObjectStore, ObjectStoreError};

/// Hard ceiling on upload attempts, whatever the configuration says.
pub const MAX_UPLOAD_ATTEMPTS: u32 = 3;

const MAX_LOGICAL_NAME_LEN: usize = 96;

pub const PDF_CONTENT_TYPE: &str = "application/pdf";

/// A key whose write may have reached the store. Dropping it unsettled, for
/// instance when the caller's future is cancelled mid-write, schedules a
/// best-effort delete on the current runtime.
struct PendingObject {
    store: Arc<dyn ObjectStore>,
    key: Option<String>,
    timeout: Duration,
}

impl PendingObject {
    fn new(store: Arc<dyn ObjectStore>, key: &str, timeout: Duration) -> Self {
        Self {
            store,
            key: Some(key.to_string()),
            timeout,
        }
    }

    fn settle(mut self) {
        self.key = None;
    }
}

impl Drop for PendingObject {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                let timeout = self.timeout;
                handle.spawn(async move { discard(store.as_ref(), &key, timeout).await });
            }
            Err(_) => log::warn!("No runtime to discard abandoned object {}", key),
        }
    }
}

/// Best-effort removal of an object whose write outcome is unknown.
async fn discard(store: &dyn ObjectStore, key: &str, timeout: Duration) {
    match tokio::time::timeout(timeout, store.delete_object(key)).await {
        Ok(Ok(())) => log::debug!("Discarded object {}", key),
        Ok(Err(e)) => log::warn!("Failed to discard object {}: {}", key, e),
        Err(_) => log::warn!("Timed out discarding object {}", key),
    }
}

#[derive(Clone)]
pub struct ObjectStoreUploader {
    store: Arc<dyn ObjectStore>,
    policy: UploadPolicy,
}

impl ObjectStoreUploader {
    pub fn new(store: Arc<dyn ObjectStore>, policy: UploadPolicy) -> Self {
        Self { store, policy }
    }

    pub fn max_bytes(&self) -> usize {
        self.policy.max_bytes
    }

    pub fn calculate_checksum(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    pub fn extract_file_extension(mime_type: &str) -> Result<&'static str, PipelineError> {
        match mime_type {
            "image/jpeg" => Ok("jpg"),
            "image/png" => Ok("png"),
            "image/webp" => Ok("webp"),
            "image/gif" => Ok("gif"),
            PDF_CONTENT_TYPE => Ok("pdf"),
            other => Err(PipelineError::Validation(format!(
                "content type '{}' is not accepted",
                other
            ))),
        }
    }

    pub fn is_image_type(mime_type: &str) -> bool {
        mime_type.starts_with("image/") && Self::extract_file_extension(mime_type).is_ok()
    }

    /// Checks the payload against the allow-list, size limit and magic bytes.
    pub fn validate_payload(&self, data: &[u8], mime_type: &str) -> Result<&'static str, PipelineError> {
        if data.is_empty() {
            return Err(PipelineError::Validation("payload is empty".to_string()));
        }
        if data.len() > self.policy.max_bytes {
            return Err(PipelineError::Validation(format!(
                "payload of {} bytes exceeds the {} byte limit",
                data.len(),
                self.policy.max_bytes
            )));
        }
        let extension = Self::extract_file_extension(mime_type)?;
        let sniffed = if mime_type == PDF_CONTENT_TYPE {
            data.starts_with(b"%PDF-").then_some(PDF_CONTENT_TYPE)
        } else {
            match image::guess_format(data) {
                Ok(ImageFormat::Jpeg) => Some("image/jpeg"),
                Ok(ImageFormat::Png) => Some("image/png"),
                Ok(ImageFormat::WebP) => Some("image/webp"),
                Ok(ImageFormat::Gif) => Some("image/gif"),
                _ => None,
            }
        };
        if sniffed != Some(mime_type) {
            return Err(PipelineError::Validation(format!(
                "payload content does not match declared type '{}'",
                mime_type
            )));
        }
        Ok(extension)
    }

    pub fn sanitize_logical_name(logical_name: &str, extension: &str) -> String {
        let lowered = logical_name.trim().to_ascii_lowercase();
        let stem = match lowered.rsplit_once('.') {
            Some((stem, ext))
                if !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
            {
                stem
            }
            _ => lowered.as_str(),
        };

        let mut sanitized = String::with_capacity(stem.len());
        for c in stem.chars() {
            let mapped = if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' };
            if mapped == '-' && sanitized.ends_with('-') {
                continue;
            }
            sanitized.push(mapped);
        }
        let mut sanitized: String = sanitized
            .trim_matches('-')
            .chars()
            .take(MAX_LOGICAL_NAME_LEN)
            .collect();
        if sanitized.is_empty() {
            sanitized.push_str("upload");
        }
        format!("{}.{}", sanitized, extension)
    }

    /// `{category}/{timestamp}-{nonce}-{name}`; a fresh key for every attempt.
    pub fn generate_key(category: &ScreeningCategory, sanitized_name: &str) -> String {
        let nonce: u32 = rand::rng().random();
        format!(
            "{}/{}-{:08x}-{}",
            category.as_str(),
            Utc::now().timestamp_millis(),
            nonce,
            sanitized_name
        )
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base_ms = self.policy.base_delay.as_millis() as u64;
        let capped = base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.policy.max_delay.as_millis() as u64);
        let jitter = if base_ms > 1 {
            rand::rng().random_range(0..=base_ms / 2)
        } else {
            0
        };
        Duration::from_millis(capped + jitter)
    }

    pub async fn upload(
        &self,
        data: &[u8],
        content_type: &str,
        category: &ScreeningCategory,
        logical_name: &str,
    ) -> Result<StorageObjectRef, PipelineError> {
        let extension = self.validate_payload(data, content_type)?;
        let sanitized_name = Self::sanitize_logical_name(logical_name, extension);
        let checksum = Self::calculate_checksum(data);
        let max_attempts = self.policy.max_attempts.clamp(1, MAX_UPLOAD_ATTEMPTS);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let key = Self::generate_key(category, &sanitized_name);
            log::info!(
                "Uploading {} bytes as {} (attempt {}/{})",
                data.len(),
                key,
                attempt,
                max_attempts
            );

            let pending = PendingObject::new(self.store.clone(), &key, self.policy.attempt_timeout);
            let outcome = tokio::time::timeout(
                self.policy.attempt_timeout,
                self.store.put_object(&key, data.to_vec(), content_type),
            )
            .await;

            let cause = match outcome {
                Ok(Ok(())) => {
                    pending.settle();
                    log::info!("Stored {} via {}", key, self.store.provider());
                    return Ok(StorageObjectRef {
                        provider: self.store.provider().to_string(),
                        url: self.store.public_url(&key),
                        key,
                        content_type: content_type.to_string(),
                        size: data.len() as u64,
                        sha256: checksum,
                    });
                }
                Ok(Err(e)) => {
                    pending.settle();
                    e
                }
                Err(_) => {
                    // The write may still land; delete it off the retry path.
                    drop(pending);
                    ObjectStoreError::TimedOut(self.policy.attempt_timeout.as_secs())
                }
            };

            if !cause.is_transient() || attempt >= max_attempts {
                log::error!("Upload of {} failed after {} attempt(s): {}", key, attempt, cause);
                return Err(PipelineError::Upload {
                    attempts: attempt,
                    cause,
                });
            }

            let delay = self.backoff_delay(attempt);
            log::warn!(
                "Transient upload failure for {} ({}); retrying in {:?}",
                key,
                cause,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}
