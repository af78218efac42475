//! Error types for the edgequake-doc2md library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`Doc2MdError`]: **Fatal** for the call that returns it: the pipeline
//!   cannot be assembled at all (bad configuration, pdfium cannot be bound,
//!   storage cannot be reached at construction time) or a caller broke a
//!   contract (e.g. an empty rectangle set handed to the geometry helpers).
//!
//! * [`UnitError`]: **Non-fatal**: one cluster, page, sheet or file-unit
//!   failed. It is carried inside [`crate::output::UnitStatus`] and
//!   [`crate::output::PageResult`] so a batch always runs to completion and
//!   every failure reaches the caller as a status record.

use crate::storage::StorageError;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-doc2md library.
///
/// Per-unit failures use [`UnitError`] and are reported through status
/// records rather than propagated here.
#[derive(Debug, Error)]
pub enum Doc2MdError {
    // ── Contract errors ───────────────────────────────────────────────────
    /// A caller passed input that violates an operation's contract.
    #[error("Invalid input '{input}'")]
    InvalidInput { input: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A required environment variable is missing or empty.
    #[error("Missing environment variable: {0}")]
    MissingEnv(String),

    /// The layout-extraction provider could not be initialised.
    #[error("Layout provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium (file or containing directory),\n\
or install pdfium where the system loader can find it.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Storage errors ────────────────────────────────────────────────────
    /// The storage backend could not be constructed.
    #[error("Storage backend unavailable: {0}")]
    Storage(#[from] StorageError),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create one of the working directories.
    #[error("Failed to prepare directory '{path}': {source}")]
    WorkDirFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error isolated to one cluster, page or file-unit.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitError {
    /// No converter is registered for the file extension.
    #[error("Unsupported file type: '{extension}'")]
    UnsupportedType { extension: String },

    /// Raster, cluster or composite step failed, or the document could not be read.
    #[error("Extraction failed: {detail}")]
    ExtractionFailure { detail: String },

    /// The storage backend rejected a write.
    #[error("Upload of '{key}' failed: {detail}")]
    UploadFailure { key: String, detail: String },

    /// Writing a staging Markdown part failed.
    #[error("Failed to persist '{path}': {detail}")]
    PersistenceFailure { path: PathBuf, detail: String },

    /// The layout-extraction service failed or returned an unusable answer.
    #[error("Layout service failed: {detail}")]
    ExternalServiceFailure { detail: String },
}

impl UnitError {
    /// Shorthand for [`UnitError::ExtractionFailure`], for custom document backends.
    pub fn extraction(detail: impl Into<String>) -> Self {
        UnitError::ExtractionFailure {
            detail: detail.into(),
        }
    }

    /// Shorthand for [`UnitError::ExternalServiceFailure`], for custom extractors.
    pub fn service(detail: impl Into<String>) -> Self {
        UnitError::ExternalServiceFailure {
            detail: detail.into(),
        }
    }

    pub(crate) fn upload(key: impl Into<String>, err: &StorageError) -> Self {
        UnitError::UploadFailure {
            key: key.into(),
            detail: err.to_string(),
        }
    }
}
