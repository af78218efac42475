//! Configuration types for document conversion.
//!
//! Pipeline behaviour is controlled through [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`]. Where the pipeline talks to the outside world
//! (object storage, layout extraction) the connection details are resolved
//! separately from the environment into [`StorageSettings`] and
//! [`LayoutSettings`], because the HTTP surface chooses the storage target
//! per request while the pipeline knobs are fixed for the process.

use crate::error::Doc2MdError;
use crate::storage::normalize_bucket_name;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// Configuration shared by the conversion driver and the orchestrator.
///
/// # Example
/// ```rust
/// use edgequake_doc2md::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .work_dir("/tmp/doc2md")
///     .padding(8.0)
///     .build()
///     .unwrap();
/// assert_eq!(config.md_root, std::path::PathBuf::from("/tmp/doc2md/md"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Adjacency tolerance, in page units, used when clustering image
    /// regions. Default: 5.0.
    pub padding: f32,

    /// Font size of the inserted `![name](url)` annotation. Default: 10.0.
    pub annotation_font_size: f32,

    /// JPEG quality (1–100) for composite images. Default: 75.
    pub jpeg_quality: u8,

    /// Staging Markdown parts: `{md_root}/{base}_part_{n}.md`.
    pub md_root: PathBuf,

    /// Split single-page documents: `{split_root}/{base}_page_{n}.pdf`.
    pub split_root: PathBuf,

    /// Composite images before upload.
    pub img_root: PathBuf,

    /// Original uploads received by the HTTP surface.
    pub upload_root: PathBuf,

    /// Parent of the per-page scratch directories holding extracted rasters.
    pub scratch_root: PathBuf,

    /// Remote key prefix for composite images. Default: `images/`.
    pub image_key_prefix: String,

    /// Remote key prefix for staging Markdown parts. Default: `tmp_md/`.
    pub markdown_key_prefix: String,

    /// User password for encrypted PDFs.
    #[serde(skip_serializing)]
    pub password: Option<String>,

    /// Largest request body accepted by `POST /process-files`. Default: 256 MiB.
    pub max_upload_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let work = Path::new("work");
        Self {
            padding: 5.0,
            annotation_font_size: 10.0,
            jpeg_quality: 75,
            md_root: work.join("md"),
            split_root: work.join("split"),
            img_root: work.join("img"),
            upload_root: work.join("uploads"),
            scratch_root: work.join("scratch"),
            image_key_prefix: "images/".into(),
            markdown_key_prefix: "tmp_md/".into(),
            password: None,
            max_upload_bytes: 256 * 1024 * 1024,
        }
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Create every working directory that does not exist yet.
    pub fn ensure_roots(&self) -> Result<(), Doc2MdError> {
        for dir in [
            &self.md_root,
            &self.split_root,
            &self.img_root,
            &self.upload_root,
            &self.scratch_root,
        ] {
            std::fs::create_dir_all(dir).map_err(|source| Doc2MdError::WorkDirFailed {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Copy of this config with every working directory moved to `{root}/{scope}`.
    pub fn scoped(&self, scope: &str) -> PipelineConfig {
        PipelineConfig {
            md_root: self.md_root.join(scope),
            split_root: self.split_root.join(scope),
            img_root: self.img_root.join(scope),
            upload_root: self.upload_root.join(scope),
            scratch_root: self.scratch_root.join(scope),
            ..self.clone()
        }
    }

    /// Remote key for a composite image file name.
    pub fn image_key(&self, file_name: &str) -> String {
        format!("{}{}", self.image_key_prefix, file_name)
    }

    /// Remote key for a staging Markdown file name.
    pub fn markdown_key(&self, file_name: &str) -> String {
        format!("{}{}", self.markdown_key_prefix, file_name)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn padding(mut self, padding: f32) -> Self {
        self.config.padding = padding;
        self
    }

    pub fn annotation_font_size(mut self, size: f32) -> Self {
        self.config.annotation_font_size = size;
        self
    }

    pub fn jpeg_quality(mut self, quality: u8) -> Self {
        self.config.jpeg_quality = quality;
        self
    }

    /// Place all five roots under `dir` using the default sub-directory names.
    pub fn work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        self.config.md_root = dir.join("md");
        self.config.split_root = dir.join("split");
        self.config.img_root = dir.join("img");
        self.config.upload_root = dir.join("uploads");
        self.config.scratch_root = dir.join("scratch");
        self
    }

    pub fn md_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.md_root = dir.into();
        self
    }

    pub fn split_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.split_root = dir.into();
        self
    }

    pub fn img_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.img_root = dir.into();
        self
    }

    pub fn upload_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.upload_root = dir.into();
        self
    }

    pub fn scratch_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.scratch_root = dir.into();
        self
    }

    pub fn image_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.image_key_prefix = prefix.into();
        self
    }

    pub fn markdown_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.markdown_key_prefix = prefix.into();
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn max_upload_bytes(mut self, n: usize) -> Self {
        self.config.max_upload_bytes = n;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, Doc2MdError> {
        let c = &self.config;
        if !c.padding.is_finite() || c.padding < 0.0 {
            return Err(Doc2MdError::InvalidConfig(format!(
                "padding must be a finite value >= 0, got {}",
                c.padding
            )));
        }
        if !c.annotation_font_size.is_finite() || c.annotation_font_size <= 0.0 {
            return Err(Doc2MdError::InvalidConfig(format!(
                "annotation font size must be > 0, got {}",
                c.annotation_font_size
            )));
        }
        if !(1..=100).contains(&c.jpeg_quality) {
            return Err(Doc2MdError::InvalidConfig(format!(
                "JPEG quality must be 1-100, got {}",
                c.jpeg_quality
            )));
        }
        if c.max_upload_bytes == 0 {
            return Err(Doc2MdError::InvalidConfig(
                "max upload size must be > 0".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Storage ──────────────────────────────────────────────────────────────

/// Storage target selected per batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    S3,
    Minio,
    /// A local directory; only offered by the CLI.
    Local,
}

impl FromStr for StorageMode {
    type Err = Doc2MdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s3" => Ok(StorageMode::S3),
            "minio" => Ok(StorageMode::Minio),
            "local" => Ok(StorageMode::Local),
            other => Err(Doc2MdError::InvalidConfig(format!(
                "unknown storage mode '{other}', expected s3, minio or local"
            ))),
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StorageMode::S3 => "s3",
            StorageMode::Minio => "minio",
            StorageMode::Local => "local",
        })
    }
}

/// Fully resolved connection details for one storage target.
#[derive(Clone, PartialEq)]
pub enum StorageSettings {
    S3 {
        bucket: String,
        region: String,
        access_key: String,
        secret_key: String,
    },
    Minio {
        bucket: String,
        endpoint: String,
        access_key: String,
        secret_key: String,
        use_https: bool,
    },
    Local {
        root: PathBuf,
        bucket: String,
    },
}

impl fmt::Debug for StorageSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageSettings::S3 { bucket, region, .. } => f
                .debug_struct("S3")
                .field("bucket", bucket)
                .field("region", region)
                .finish_non_exhaustive(),
            StorageSettings::Minio {
                bucket,
                endpoint,
                use_https,
                ..
            } => f
                .debug_struct("Minio")
                .field("bucket", bucket)
                .field("endpoint", endpoint)
                .field("use_https", use_https)
                .finish_non_exhaustive(),
            StorageSettings::Local { root, bucket } => f
                .debug_struct("Local")
                .field("root", root)
                .field("bucket", bucket)
                .finish(),
        }
    }
}

impl StorageSettings {
    /// Resolve settings for `mode` from the process environment.
    ///
    /// | Mode | Variables |
    /// |------|-----------|
    /// | s3 | `AWS_ACCESS_KEY`, `AWS_SECRET_ACCESS_KEY`, `REGION_NAME` |
    /// | minio | `MINIO_ENDPOINT`, `MINIO_ACCESS_KEY`, `MINIO_SECRET_KEY`, `MINIO_USE_HTTPS` |
    /// | local | `DOC2MD_STORAGE_DIR` (default `work/storage`) |
    pub fn from_env(mode: StorageMode, bucket: &str) -> Result<Self, Doc2MdError> {
        Self::from_lookup(mode, bucket, |key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable lookup.
    pub fn from_lookup(
        mode: StorageMode,
        bucket: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, Doc2MdError> {
        let required = |key: &str| -> Result<String, Doc2MdError> {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Doc2MdError::MissingEnv(key.to_string()))
        };

        match mode {
            StorageMode::S3 => Ok(StorageSettings::S3 {
                bucket: normalize_bucket_name(bucket)?,
                region: lookup("REGION_NAME")
                    .filter(|v| !v.trim().is_empty())
                    .unwrap_or_else(|| "us-east-1".into()),
                access_key: required("AWS_ACCESS_KEY")?,
                secret_key: required("AWS_SECRET_ACCESS_KEY")?,
            }),
            StorageMode::Minio => {
                let use_https = lookup("MINIO_USE_HTTPS")
                    .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                    .unwrap_or(false);
                Ok(StorageSettings::Minio {
                    bucket: normalize_bucket_name(bucket)?,
                    endpoint: required("MINIO_ENDPOINT")?,
                    access_key: required("MINIO_ACCESS_KEY")?,
                    secret_key: required("MINIO_SECRET_KEY")?,
                    use_https,
                })
            }
            StorageMode::Local => {
                let bucket = bucket.trim();
                if bucket.is_empty() || bucket.contains(['/', '\\']) || bucket == ".." {
                    return Err(Doc2MdError::InvalidConfig(format!(
                        "invalid local bucket name '{bucket}'"
                    )));
                }
                Ok(StorageSettings::Local {
                    root: lookup("DOC2MD_STORAGE_DIR")
                        .map(PathBuf::from)
                        .unwrap_or_else(|| PathBuf::from("work/storage")),
                    bucket: bucket.to_string(),
                })
            }
        }
    }

    pub fn bucket(&self) -> &str {
        match self {
            StorageSettings::S3 { bucket, .. }
            | StorageSettings::Minio { bucket, .. }
            | StorageSettings::Local { bucket, .. } => bucket,
        }
    }
}

// ── Layout extraction ────────────────────────────────────────────────────

/// Which layout-extraction service turns a cleaned page into Markdown.
#[derive(Debug, Clone)]
pub enum LayoutSettings {
    /// Azure AI Document Intelligence, `prebuilt-layout` model.
    Azure { endpoint: String, api_key: String },
    /// A vision LLM reading a rendered image of the page.
    Vision(VisionConfig),
}

impl fmt::Display for LayoutSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutSettings::Azure { endpoint, .. } => write!(f, "azure ({endpoint})"),
            LayoutSettings::Vision(v) => write!(
                f,
                "vision ({})",
                v.provider_name.as_deref().unwrap_or("auto")
            ),
        }
    }
}

impl LayoutSettings {
    /// Azure when `AZURE_AI_INTELLIGENCE_ENDPOINT` and
    /// `AZURE_AI_INTELLIGENCE_API_KEY` are both set, otherwise `fallback`.
    pub fn from_env(fallback: VisionConfig) -> Self {
        Self::from_lookup(fallback, |key| std::env::var(key).ok())
    }

    pub fn from_lookup(fallback: VisionConfig, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        match (
            get("AZURE_AI_INTELLIGENCE_ENDPOINT"),
            get("AZURE_AI_INTELLIGENCE_API_KEY"),
        ) {
            (Some(endpoint), Some(api_key)) => LayoutSettings::Azure {
                endpoint: endpoint.trim().trim_end_matches('/').to_string(),
                api_key: api_key.trim().to_string(),
            },
            _ => LayoutSettings::Vision(fallback),
        }
    }
}

/// Settings for the vision-LLM layout extractor.
#[derive(Clone)]
pub struct VisionConfig {
    /// Longest side of the rendered page, in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// LLM model identifier. If None, uses the provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "ollama").
    /// If None along with `provider`, uses `ProviderFactory::from_env()`.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens generated per page. Default: 4096.
    pub max_tokens: usize,

    /// Retries after a failed call. Default: 3.
    pub max_retries: u32,

    /// Initial retry delay, doubled after each attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Custom system prompt. If None, uses the built-in layout prompt.
    pub system_prompt: Option<String>,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            max_rendered_pixels: 2000,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 4096,
            max_retries: 3,
            retry_backoff_ms: 500,
            system_prompt: None,
        }
    }
}

impl fmt::Debug for VisionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisionConfig")
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .finish()
    }
}
