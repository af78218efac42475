//! # edgequake-doc2md
//!
//! Convert uploaded documents to Markdown, one unit at a time, and publish
//! every unit to object storage as soon as it is ready.
//!
//! ## Why this crate?
//!
//! Layout-extraction services read a PDF page well, but pages built from
//! many small image fragments (scanned figures cut into strips, charts made
//! of tiles) come back as a scatter of broken image references. Before a
//! page is analysed this crate groups touching image regions, merges each
//! group into one composite JPEG, uploads it, and writes `![name](url)` in
//! its place, so the extracted Markdown links to one picture per figure.
//!
//! ## Pipeline Overview
//!
//! ```text
//! upload(s)
//!  │
//!  ├─ 1. Orchestrate  files in order, snapshot after every change   (stream)
//!  ├─ 2. Dispatch     converter by extension, one status per unit   (convert)
//!  ├─ 3. Split        PDF page → single-page document               (pipeline::document)
//!  ├─ 4. Consolidate  cluster images → composite → upload → annotate (pipeline::consolidate)
//!  ├─ 5. Extract      Azure layout model or vision LLM              (pipeline::layout)
//!  ├─ 6. Polish       Markdown cleanup rules                        (pipeline::postprocess)
//!  └─ 7. Stage        {base}_part_{n}.md → tmp_md/ in the bucket    (storage)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_doc2md::{
//!     build_extractor, run_batch, ConversionDriver, LayoutSettings, LocalStorage,
//!     NoopProgress, PdfiumBackend, PipelineConfig, UploadedFile, VisionConfig,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(PipelineConfig::builder().work_dir("work").build()?);
//!     config.ensure_roots()?;
//!
//!     let documents = Arc::new(PdfiumBackend::from_env(None));
//!     let layout = LayoutSettings::from_env(VisionConfig::default());
//!     let extractor = build_extractor(&layout, documents.clone())?;
//!     let storage = Arc::new(LocalStorage::new("work/storage/docs").await?);
//!
//!     let driver = ConversionDriver::new(config, storage, extractor, documents);
//!     let files = [UploadedFile::new("report.pdf", "work/uploads/report.pdf")];
//!     let done = run_batch(&driver, &files, &NoopProgress).await;
//!     for file in &done.files {
//!         println!("{}: {:?} {:?}", file.filename, file.state, file.urls);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `server` | on | HTTP surface: `POST /process-files` streaming server-sent events (axum) |
//! | `cli`    | on | Enables the `doc2md` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable both when using only the library:
//! ```toml
//! edgequake-doc2md = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cluster;
pub mod config;
pub mod convert;
pub mod error;
pub mod geometry;
pub mod output;
pub mod pipeline;
pub mod progress;
#[cfg(feature = "server")]
pub mod server;
pub mod storage;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    LayoutSettings, PipelineConfig, PipelineConfigBuilder, StorageMode, StorageSettings,
    VisionConfig,
};
pub use convert::{ConversionDriver, FileKind};
pub use error::{Doc2MdError, UnitError};
pub use geometry::{union_bounding_box, MergeDirection, Rect};
pub use output::{
    BatchSnapshot, BatchState, FileState, FileStatus, PageResult, UnitOutcome, UnitStatus,
};
pub use pipeline::document::{DocumentBackend, PdfiumBackend};
pub use pipeline::layout::{build_extractor, LayoutExtractor};
pub use progress::{BatchProgress, ChannelProgress, NoopProgress};
pub use storage::{
    EnvStorageConnector, LocalStorage, S3Storage, StorageBackend, StorageConnector, StorageError,
};
pub use stream::{run_batch, BatchWorkspace, UploadedFile};
