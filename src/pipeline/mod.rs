//! Pipeline stages behind [`crate::convert::ConversionDriver`].
//!
//! Each submodule implements one transformation step and can be tested on
//! its own through the trait seams in [`document`] and [`layout`].
//!
//! ## Data Flow
//!
//! ```text
//! document ──▶ consolidate ──▶ layout / vision ──▶ postprocess
//! (split page)  (merge images)  (page → Markdown)   (cleanup)
//!
//! tabular ─────────────────────────────────────────▶ (Markdown as-is)
//! ```
//!
//! 1. [`document`]: page count, single-page rewrite and rendering through
//!    pdfium; blocking, always called from `spawn_blocking`
//! 2. [`consolidate`]: cluster a page's images, publish one composite per
//!    cluster and annotate the page with its URL
//! 3. [`layout`]: external layout extraction (Azure Document Intelligence),
//!    or [`vision`] when only an LLM provider is configured
//! 4. [`postprocess`]: deterministic cleanup of the returned Markdown
//! 5. [`tabular`]: direct converters for text, CSV, spreadsheets and Word

pub mod consolidate;
pub mod document;
pub mod layout;
pub mod postprocess;
pub mod tabular;
pub mod vision;
