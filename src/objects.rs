//! Object storage access.
//!
//! Handlers talk to an [`ObjectStore`]; production uses S3 (or any
//! S3-compatible service) and hands clients pre-signed URLs so payload bytes
//! never pass through this server.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use chrono::{DateTime, TimeZone, Utc};
use futures_util::stream::{self, StreamExt};
use tracing::{debug, warn};

pub type SharedObjectStore = Arc<dyn ObjectStore>;

/// Most keys a single `DeleteObjects` request accepts.
pub const DELETE_BATCH: usize = 1000;

/// Concurrent listing or delete requests issued by one operation.
const FAN_OUT: usize = 8;

/// One object as reported by a listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Per-key outcome of a delete.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

impl DeleteReport {
    fn merge(&mut self, other: DeleteReport) {
        self.deleted.extend(other.deleted);
        self.failed.extend(other.failed);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid presign configuration: {0}")]
    Presign(String),
    #[error("object storage request failed: {0}")]
    Backend(String),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Lists every object whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, ObjectStoreError>;

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError>;

    /// Pre-signed URL the client can `PUT` the object body to.
    async fn presign_put(&self, key: &str, content_type: &str) -> Result<String, ObjectStoreError>;

    /// Pre-signed URL the client can `GET` the object from.
    async fn presign_get(&self, key: &str) -> Result<String, ObjectStoreError>;

    /// Writes a zero-byte object; used for folder markers.
    async fn put_empty(&self, key: &str) -> Result<(), ObjectStoreError>;

    /// Deletes at most [`DELETE_BATCH`] keys in one request. Keys the
    /// backend refused are reported in [`DeleteReport::failed`].
    async fn delete(&self, keys: &[String]) -> Result<DeleteReport, ObjectStoreError>;

    async fn copy(&self, from: &str, to: &str) -> Result<(), ObjectStoreError>;
}

/// Deletes `keys` in batches of [`DELETE_BATCH`], a few batches at a time.
/// A batch whose request fails is reported as failed as a whole.
pub async fn delete_all(store: &dyn ObjectStore, keys: &[String]) -> DeleteReport {
    let reports: Vec<DeleteReport> = stream::iter(keys.chunks(DELETE_BATCH).map(<[String]>::to_vec))
        .map(|batch| async move {
            match store.delete(&batch).await {
                Ok(report) => report,
                Err(err) => {
                    warn!(error = %err, count = batch.len(), "batch delete failed");
                    DeleteReport {
                        deleted: Vec::new(),
                        failed: batch.to_vec(),
                    }
                }
            }
        })
        .buffer_unordered(FAN_OUT)
        .collect()
        .await;

    let mut total = DeleteReport::default();
    for report in reports {
        total.merge(report);
    }
    total
}

/// Expands folder keys (ending in `/`) into every object below them.
/// File keys are passed through unchanged; duplicates are dropped.
pub async fn expand_keys(
    store: &dyn ObjectStore,
    keys: &[String],
) -> Result<Vec<String>, ObjectStoreError> {
    let listings: Vec<Result<Vec<String>, ObjectStoreError>> = stream::iter(keys.iter().cloned())
        .map(|key| async move {
            if !key.ends_with('/') {
                return Ok::<_, ObjectStoreError>(vec![key.clone()]);
            }
            let mut expanded: Vec<String> =
                store.list(&key).await?.into_iter().map(|e| e.key).collect();
            expanded.push(key.clone());
            Ok(expanded)
        })
        .buffered(FAN_OUT)
        .collect()
        .await;

    let mut seen = HashSet::new();
    let mut all = Vec::new();
    for listing in listings {
        for key in listing? {
            if seen.insert(key.clone()) {
                all.push(key);
            }
        }
    }
    Ok(all)
}

pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    presign_ttl: Duration,
}

impl S3ObjectStore {
    pub fn new(client: Client, bucket: impl Into<String>, presign_ttl: Duration) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            presign_ttl,
        }
    }

    fn presigning_config(&self) -> Result<PresigningConfig, ObjectStoreError> {
        PresigningConfig::expires_in(self.presign_ttl)
            .map_err(|err| ObjectStoreError::Presign(err.to_string()))
    }
}

/// Creates an S3 client, optionally against a custom S3-compatible endpoint.
pub async fn create_s3_client(endpoint_url: Option<&str>, region: &str) -> Client {
    let region = aws_config::Region::new(region.to_string());
    let mut config_loader =
        aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region);

    if let Some(endpoint) = endpoint_url {
        config_loader = config_loader.endpoint_url(endpoint);
    }

    let sdk_config = config_loader.load().await;

    // S3-compatible services generally need path-style addressing.
    let s3_config = if endpoint_url.is_some() {
        aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build()
    } else {
        aws_sdk_s3::config::Builder::from(&sdk_config).build()
    };

    Client::from_conf(s3_config)
}

fn backend_error<E: std::error::Error>(err: E) -> ObjectStoreError {
    ObjectStoreError::Backend(DisplayErrorContext(err).to_string())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, ObjectStoreError> {
        let mut entries = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .max_keys(1000);
            if let Some(token) = continuation_token {
                request = request.continuation_token(token);
            }

            let result = request.send().await.map_err(backend_error)?;
            for object in result.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                entries.push(ObjectEntry {
                    key: key.to_string(),
                    size: object.size().unwrap_or_default().max(0) as u64,
                    last_modified: object
                        .last_modified()
                        .and_then(|ts| Utc.timestamp_opt(ts.secs(), 0).single()),
                });
            }

            if result.is_truncated() == Some(true) {
                continuation_token = result.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }

        debug!(prefix, count = entries.len(), "listed objects");
        Ok(entries)
    }

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|service| service.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(backend_error(err))
                }
            }
        }
    }

    async fn presign_put(&self, key: &str, content_type: &str) -> Result<String, ObjectStoreError> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .presigned(self.presigning_config()?)
            .await
            .map_err(backend_error)?;
        Ok(request.uri().to_string())
    }

    async fn presign_get(&self, key: &str) -> Result<String, ObjectStoreError> {
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(self.presigning_config()?)
            .await
            .map_err(backend_error)?;
        Ok(request.uri().to_string())
    }

    async fn put_empty(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from_static(b""))
            .send()
            .await
            .map_err(backend_error)?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<DeleteReport, ObjectStoreError> {
        if keys.is_empty() {
            return Ok(DeleteReport::default());
        }
        let objects = keys
            .iter()
            .map(|key| ObjectIdentifier::builder().key(key).build().map_err(backend_error))
            .collect::<Result<Vec<_>, _>>()?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(false)
            .build()
            .map_err(backend_error)?;

        let output = self
            .client
            .delete_objects()
            .bucket(&self.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(backend_error)?;

        let failed: Vec<String> = output
            .errors()
            .iter()
            .filter_map(|error| {
                warn!(
                    key = error.key(),
                    code = error.code(),
                    message = error.message(),
                    "object delete refused"
                );
                error.key().map(str::to_string)
            })
            .collect();
        let deleted = keys
            .iter()
            .filter(|key| !failed.contains(key))
            .cloned()
            .collect();
        debug!(count = keys.len(), failed = failed.len(), "deleted objects");
        Ok(DeleteReport { deleted, failed })
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), ObjectStoreError> {
        let source = format!("{}/{}", self.bucket, urlencoding::encode(from));
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(source)
            .key(to)
            .send()
            .await
            .map_err(backend_error)?;
        Ok(())
    }
}
