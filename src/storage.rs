//! Staging storage: where composite images and Markdown parts are published.
//!
//! [`StorageBackend`] is the seam the pipeline writes through. Two
//! implementations ship with the crate:
//!
//! * [`S3Storage`]: AWS S3, or MinIO through the same S3 API (path-style).
//!   The target bucket is created on connect when it does not exist yet.
//! * [`LocalStorage`]: a plain directory with `file://` URLs, for offline
//!   CLI runs and tests.
//!
//! Page editing happens on a blocking thread, so the consolidator uploads
//! through [`BlockingUploader`], which drives the async backend on the
//! runtime that spawned the blocking task.

use crate::config::{StorageMode, StorageSettings};
use crate::error::Doc2MdError;
use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_sdk_s3::Client;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Failures reported by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Bucket name is not a valid object-store bucket name.
    #[error("Invalid bucket name '{0}': use 3-63 characters from a-z, 0-9 and '-'")]
    InvalidBucket(String),

    /// The remote store rejected the request or could not be reached.
    #[error("Storage request for '{key}' failed: {detail}")]
    Transport { key: String, detail: String },

    /// Local file could not be read or written.
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Destination for published artifacts.
///
/// Implementations must return a URL that dereferences to the stored object.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store `bytes` under `key` and return the object's URL.
    async fn upload_stream(&self, bytes: Vec<u8>, key: &str) -> Result<String, StorageError>;

    /// Store the file at `path` under `key` and return the object's URL.
    async fn upload_file(&self, path: &Path, key: &str) -> Result<String, StorageError> {
        let bytes = tokio::fs::read(path).await?;
        self.upload_stream(bytes, key).await
    }
}

/// Resolves a storage backend for a `(mode, bucket)` pair.
///
/// The HTTP surface receives the storage target with each request, so it
/// holds a connector rather than a backend.
#[async_trait]
pub trait StorageConnector: Send + Sync {
    async fn connect(
        &self,
        mode: StorageMode,
        bucket: &str,
    ) -> Result<Arc<dyn StorageBackend>, Doc2MdError>;
}

/// Connector that reads credentials from the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvStorageConnector;

#[async_trait]
impl StorageConnector for EnvStorageConnector {
    async fn connect(
        &self,
        mode: StorageMode,
        bucket: &str,
    ) -> Result<Arc<dyn StorageBackend>, Doc2MdError> {
        let settings = StorageSettings::from_env(mode, bucket)?;
        connect(&settings).await
    }
}

/// Build the backend described by `settings`.
pub async fn connect(settings: &StorageSettings) -> Result<Arc<dyn StorageBackend>, Doc2MdError> {
    match settings {
        StorageSettings::Local { root, bucket } => {
            Ok(Arc::new(LocalStorage::new(root.join(bucket)).await?))
        }
        _ => Ok(Arc::new(S3Storage::connect(settings).await?)),
    }
}

static BUCKET_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9-]{3,63}$").unwrap());

/// Lower-case `name`, replace `_` with `-` and validate the result.
pub fn normalize_bucket_name(name: &str) -> Result<String, StorageError> {
    let normalized = name.trim().to_lowercase().replace('_', "-");
    if BUCKET_NAME.is_match(&normalized) {
        Ok(normalized)
    } else {
        Err(StorageError::InvalidBucket(name.to_string()))
    }
}

fn content_type_for(key: &str) -> &'static str {
    let ext = Path::new(key)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("md") => "text/markdown; charset=utf-8",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

// ── S3 / MinIO ───────────────────────────────────────────────────────────

/// Object storage through the S3 API.
pub struct S3Storage {
    client: Client,
    bucket: String,
    url_base: String,
}

impl S3Storage {
    /// Connect and make sure the bucket exists.
    pub async fn connect(settings: &StorageSettings) -> Result<Self, StorageError> {
        let (client, bucket, region, url_base) = match settings {
            StorageSettings::S3 {
                bucket,
                region,
                access_key,
                secret_key,
            } => {
                let credentials = Credentials::new(access_key, secret_key, None, None, "doc2md-s3");
                let config = aws_sdk_s3::Config::builder()
                    .credentials_provider(credentials)
                    .region(Region::new(region.clone()))
                    .behavior_version_latest()
                    .build();
                (
                    Client::from_conf(config),
                    bucket.clone(),
                    region.clone(),
                    format!("https://{bucket}.s3.{region}.amazonaws.com"),
                )
            }
            StorageSettings::Minio {
                bucket,
                endpoint,
                access_key,
                secret_key,
                use_https,
            } => {
                let scheme = if *use_https { "https" } else { "http" };
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .trim_end_matches('/');
                let credentials =
                    Credentials::new(access_key, secret_key, None, None, "doc2md-minio");
                let config = aws_sdk_s3::Config::builder()
                    .credentials_provider(credentials)
                    .region(Region::new("us-east-1"))
                    .endpoint_url(format!("{scheme}://{host}"))
                    .force_path_style(true)
                    .behavior_version_latest()
                    .build();
                (
                    Client::from_conf(config),
                    bucket.clone(),
                    "us-east-1".to_string(),
                    format!("{scheme}://{host}/{bucket}"),
                )
            }
            StorageSettings::Local { bucket, .. } => {
                return Err(StorageError::Transport {
                    key: bucket.clone(),
                    detail: "local settings passed to the S3 backend".into(),
                })
            }
        };

        let storage = Self {
            client,
            bucket,
            url_base,
        };
        storage.ensure_bucket(&region).await?;
        Ok(storage)
    }

    async fn ensure_bucket(&self, region: &str) -> Result<(), StorageError> {
        let err = match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                debug!(bucket = %self.bucket, "bucket exists");
                return Ok(());
            }
            Err(err) => err,
        };

        let missing = err.as_service_error().is_some_and(|e| e.is_not_found())
            || err
                .raw_response()
                .is_some_and(|r| r.status().as_u16() == 404);
        if !missing {
            return Err(StorageError::Transport {
                key: self.bucket.clone(),
                detail: DisplayErrorContext(&err).to_string(),
            });
        }

        let mut request = self.client.create_bucket().bucket(&self.bucket);
        if region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }
        match request.send().await {
            Ok(_) => {
                info!(bucket = %self.bucket, region, "created bucket");
                Ok(())
            }
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_bucket_already_owned_by_you()) =>
            {
                Ok(())
            }
            Err(err) => Err(StorageError::Transport {
                key: self.bucket.clone(),
                detail: DisplayErrorContext(&err).to_string(),
            }),
        }
    }

    /// Public URL of `key` in this bucket.
    pub fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.url_base, key)
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    async fn upload_stream(&self, bytes: Vec<u8>, key: &str) -> Result<String, StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type_for(key))
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| StorageError::Transport {
                key: key.to_string(),
                detail: DisplayErrorContext(&e).to_string(),
            })?;
        debug!(bucket = %self.bucket, key, "uploaded object");
        Ok(self.public_url(key))
    }

    async fn upload_file(&self, path: &Path, key: &str) -> Result<String, StorageError> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StorageError::Transport {
                key: key.to_string(),
                detail: e.to_string(),
            })?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type_for(key))
            .body(body)
            .send()
            .await
            .map_err(|e| StorageError::Transport {
                key: key.to_string(),
                detail: DisplayErrorContext(&e).to_string(),
            })?;
        debug!(bucket = %self.bucket, key, path = %path.display(), "uploaded file");
        Ok(self.public_url(key))
    }
}

// ── Local directory ──────────────────────────────────────────────────────

/// Stores objects as files below a root directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Create `root` if needed. The root is made absolute so URLs resolve.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        let root = tokio::fs::canonicalize(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let escapes = relative.components().any(|c| {
            !matches!(c, std::path::Component::Normal(_))
        });
        if key.is_empty() || escapes {
            return Err(StorageError::Transport {
                key: key.to_string(),
                detail: "key must be a relative path without '..'".into(),
            });
        }
        Ok(self.root.join(relative))
    }

    fn url_for(path: &Path) -> String {
        format!("file://{}", path.display())
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn upload_stream(&self, bytes: Vec<u8>, key: &str) -> Result<String, StorageError> {
        let dest = self.object_path(key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&dest, bytes).await?;
        Ok(Self::url_for(&dest))
    }

    async fn upload_file(&self, path: &Path, key: &str) -> Result<String, StorageError> {
        let dest = self.object_path(key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(path, &dest).await?;
        Ok(Self::url_for(&dest))
    }
}

// ── Blocking bridge ──────────────────────────────────────────────────────

/// Synchronous facade over a [`StorageBackend`].
///
/// Must be used from a thread that is not driving the runtime, such as the
/// body of `tokio::task::spawn_blocking`.
#[derive(Clone)]
pub struct BlockingUploader {
    handle: tokio::runtime::Handle,
    backend: Arc<dyn StorageBackend>,
}

impl BlockingUploader {
    pub fn new(handle: tokio::runtime::Handle, backend: Arc<dyn StorageBackend>) -> Self {
        Self { handle, backend }
    }

    pub fn upload_file(&self, path: &Path, key: &str) -> Result<String, StorageError> {
        self.handle.block_on(self.backend.upload_file(path, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_names_are_normalised() {
        assert_eq!(normalize_bucket_name("My_Docs").unwrap(), "my-docs");
        assert_eq!(normalize_bucket_name(" reports-2024 ").unwrap(), "reports-2024");
    }

    #[test]
    fn invalid_bucket_names_are_rejected() {
        for bad in ["ab", "has space", "dots.not.allowed", &"x".repeat(64)] {
            assert!(
                matches!(normalize_bucket_name(bad), Err(StorageError::InvalidBucket(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn content_types_by_extension() {
        assert_eq!(content_type_for("images/a_g0.jpg"), "image/jpeg");
        assert_eq!(content_type_for("tmp_md/a_part_1.md"), "text/markdown; charset=utf-8");
        assert_eq!(content_type_for("blob"), "application/octet-stream");
    }

    #[tokio::test]
    async fn local_storage_writes_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStorage::new(dir.path().join("bucket")).await.unwrap();

        let url = store
            .upload_stream(b"# hi\n".to_vec(), "tmp_md/a_part_1.md")
            .await
            .unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("tmp_md/a_part_1.md"));
        let written = std::fs::read_to_string(store.root().join("tmp_md/a_part_1.md")).unwrap();
        assert_eq!(written, "# hi\n");
    }

    #[tokio::test]
    async fn local_storage_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStorage::new(dir.path()).await.unwrap();
        let err = store.upload_stream(vec![1], "../outside").await.unwrap_err();
        assert!(matches!(err, StorageError::Transport { .. }));
    }

    #[tokio::test]
    async fn local_connect_joins_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let settings = StorageSettings::Local {
            root: dir.path().to_path_buf(),
            bucket: "docs".into(),
        };
        let backend = connect(&settings).await.unwrap();
        let src = dir.path().join("src.jpg");
        std::fs::write(&src, [0xFF, 0xD8]).unwrap();
        let url = backend.upload_file(&src, "images/src.jpg").await.unwrap();
        assert!(url.contains("/docs/images/src.jpg"), "{url}");
    }

    #[test]
    fn blocking_uploader_runs_on_blocking_thread() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn StorageBackend> =
            Arc::new(rt.block_on(LocalStorage::new(dir.path())).unwrap());
        let src = dir.path().join("a.jpg");
        std::fs::write(&src, [1, 2, 3]).unwrap();

        let uploader = BlockingUploader::new(rt.handle().clone(), backend);
        let url = rt
            .block_on(rt.spawn_blocking(move || {
                uploader.upload_file(&src, "images/a.jpg")
            }))
            .unwrap()
            .unwrap();
        assert!(url.ends_with("images/a.jpg"));
    }
}
