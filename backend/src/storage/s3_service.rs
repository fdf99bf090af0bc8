use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("transient storage error: {0}")]
    Transient(String),
    #[error("storage request rejected: {0}")]
    Rejected(String),
    #[error("storage attempt timed out after {0}s")]
    TimedOut(u64),
}

impl ObjectStoreError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, ObjectStoreError::Rejected(_))
    }
}

/// Blob storage backend used by the uploader.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn provider(&self) -> &str;

    fn public_url(&self, key: &str) -> String;

    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ObjectStoreError>;

    async fn delete_object(&self, key: &str) -> Result<(), ObjectStoreError>;
}

#[derive(Clone)]
pub struct S3Service {
    client: Client,
    bucket_name: String,
    public_base_url: String,
}

impl S3Service {
    pub fn new(client: Client, bucket_name: String, region: &str, public_base_url: Option<String>) -> Self {
        let public_base_url = public_base_url
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("https://{}.s3.{}.amazonaws.com", bucket_name, region));
        Self {
            client,
            bucket_name,
            public_base_url,
        }
    }

    fn classify<E>(err: SdkError<E, HttpResponse>) -> ObjectStoreError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match &err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
                ObjectStoreError::Transient(DisplayErrorContext(&err).to_string())
            }
            SdkError::ServiceError(service_err) => {
                let status = service_err.raw().status().as_u16();
                let message = service_err.err().to_string();
                if is_retryable_status(status) || message.contains("SlowDown") {
                    ObjectStoreError::Transient(message)
                } else {
                    ObjectStoreError::Rejected(message)
                }
            }
            _ => ObjectStoreError::Rejected(DisplayErrorContext(&err).to_string()),
        }
    }
}

fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

#[async_trait]
impl ObjectStore for S3Service {
    fn provider(&self) -> &str {
        "s3"
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }

    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        log::debug!("Putting s3://{}/{}", self.bucket_name, key);
        self.client
            .put_object()
            .bucket(&self.bucket_name)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(S3Service::classify)?;

        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket_name)
            .key(key)
            .send()
            .await
            .map_err(S3Service::classify)?;

        Ok(())
    }
}
