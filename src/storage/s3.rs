use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::Client;
use bytes::Bytes;
use secrecy::ExposeSecret;
use tracing::{debug, info, instrument};

use super::{ArtifactStore, StoreError, SyncArtifact};
use crate::config::StorageConfig;

/// Error codes that mean the credentials themselves are wrong.
const ACCESS_DENIED_CODES: &[&str] = &[
    "AccessDenied",
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
    "ExpiredToken",
    "InvalidToken",
];

/// Build an S3 client from explicit credentials.
///
/// Every operation (including retries) is bounded by `operation_timeout`.
pub async fn build_client(config: &StorageConfig, operation_timeout: Duration) -> Client {
    let credentials = aws_sdk_s3::config::Credentials::new(
        config.access_key_id.clone(),
        config.secret_access_key.expose_secret().to_string(),
        None,
        None,
        "partition-sync-environment",
    );
    let timeouts = aws_config::timeout::TimeoutConfig::builder()
        .operation_timeout(operation_timeout)
        .build();

    let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(config.region.clone()))
        .credentials_provider(credentials)
        .timeout_config(timeouts)
        .load()
        .await;

    let client = Client::new(&shared);
    info!(
        bucket = %config.bucket,
        region = %config.region,
        "S3 client initialised"
    );
    client
}

/// [`ArtifactStore`] over one S3 bucket.
pub struct S3ArtifactStore {
    client: Client,
    bucket: String,
}

impl S3ArtifactStore {
    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    /// Paginates `ListObjectsV2` until the continuation token runs out.
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn list(&self, prefix: &str) -> Result<Vec<SyncArtifact>, StoreError> {
        let mut artifacts = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(ref token) = continuation_token {
                req = req.continuation_token(token);
            }

            let resp = req.send().await.map_err(|e| classify(e, prefix))?;

            for obj in resp.contents() {
                let Some(key) = obj.key() else { continue };
                artifacts.push(SyncArtifact {
                    key: key.to_string(),
                    etag: obj.e_tag().map(|t| t.trim_matches('"').to_string()),
                    last_modified: obj
                        .last_modified()
                        .and_then(|t| chrono::DateTime::from_timestamp(t.secs(), t.subsec_nanos())),
                    size: obj.size().and_then(|s| u64::try_from(s).ok()),
                });
            }

            match resp.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        debug!(count = artifacts.len(), "listed objects");
        Ok(artifacts)
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn fetch(&self, key: &str) -> Result<Bytes, StoreError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .map_or(false, |e| e.is_no_such_key())
                {
                    StoreError::NotFound {
                        key: key.to_string(),
                    }
                } else {
                    classify(err, key)
                }
            })?;

        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Transient(format!("read body of {key}: {e}")))?
            .into_bytes();

        debug!(bytes = bytes.len(), "object fetched");
        Ok(bytes)
    }
}

/// Map an SDK error onto the store taxonomy.
fn classify<E, R>(err: SdkError<E, R>, subject: &str) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let code = err.code().map(str::to_string);
    let message = err.message().unwrap_or_default().to_string();
    match code.as_deref() {
        Some(c) if ACCESS_DENIED_CODES.contains(&c) => StoreError::AccessDenied {
            code: c.to_string(),
            message,
        },
        Some("NoSuchKey") | Some("NotFound") => StoreError::NotFound {
            key: subject.to_string(),
        },
        // A missing bucket is a deployment error; it stops the loop like bad
        // credentials do.
        Some("NoSuchBucket") => StoreError::AccessDenied {
            code: "NoSuchBucket".to_string(),
            message,
        },
        _ => StoreError::Transient(format!("{subject}: {}", DisplayErrorContext(&err))),
    }
}
