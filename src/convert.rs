//! Per-unit conversion driver.
//!
//! [`ConversionDriver::process_file`] picks a converter from the file
//! extension and yields one [`UnitStatus`] per unit as soon as that unit is
//! finished:
//!
//! ```text
//! PDF ──▶ per page: split ─▶ consolidate images ─▶ layout extraction ─▶ cleanup ─┐
//! image ──▶ layout extraction ─▶ cleanup ────────────────────────────────────────┤
//! txt / csv / docx ──▶ direct conversion ────────────────────────────────────────┼─▶ stage part ─▶ UnitStatus
//! xlsx / xls / ods ──▶ one table per non-empty sheet ────────────────────────────┘
//! ```
//!
//! Every unit is staged at `{md_root}/{base}_part_{n}.md` and uploaded under
//! the Markdown key prefix. A failing unit yields an `Error` status and the
//! loop moves on to the next unit.

use crate::config::PipelineConfig;
use crate::error::UnitError;
use crate::output::{PageResult, UnitStatus};
use crate::pipeline::consolidate::{ConsolidationReport, PageConsolidator};
use crate::pipeline::document::{DocumentBackend, PageSurface};
use crate::pipeline::layout::LayoutExtractor;
use crate::pipeline::{postprocess, tabular};
use crate::storage::{BlockingUploader, StorageBackend};
use futures::Stream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Converter family selected by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Multi-page page-description document (`.pdf`).
    Pdf,
    /// `.jpg`, `.jpeg`, `.png`: sent whole to layout extraction.
    Image,
    Text,
    Csv,
    /// `.xlsx`, `.xls`, `.ods`.
    Spreadsheet,
    /// `.docx`.
    WordDocument,
}

impl FileKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(FileKind::Pdf),
            "jpg" | "jpeg" | "png" => Some(FileKind::Image),
            "txt" => Some(FileKind::Text),
            "csv" => Some(FileKind::Csv),
            "xlsx" | "xls" | "ods" => Some(FileKind::Spreadsheet),
            "docx" => Some(FileKind::WordDocument),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, UnitError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        Self::from_extension(ext).ok_or_else(|| UnitError::UnsupportedType {
            extension: if ext.is_empty() {
                "(none)".to_string()
            } else {
                format!(".{ext}")
            },
        })
    }
}

/// File stem used to name every artifact derived from `path`.
pub fn base_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "document".to_string())
}

/// Staging Markdown file name of unit `n`.
pub fn part_file_name(base: &str, n: usize) -> String {
    format!("{base}_part_{n}.md")
}

/// Split single-page document name of page `n`.
pub fn split_file_name(base: &str, n: usize) -> String {
    format!("{base}_page_{n}.pdf")
}

/// Converts files unit by unit.
pub struct ConversionDriver {
    config: Arc<PipelineConfig>,
    storage: Arc<dyn StorageBackend>,
    extractor: Arc<dyn LayoutExtractor>,
    documents: Arc<dyn DocumentBackend>,
}

impl ConversionDriver {
    pub fn new(
        config: Arc<PipelineConfig>,
        storage: Arc<dyn StorageBackend>,
        extractor: Arc<dyn LayoutExtractor>,
        documents: Arc<dyn DocumentBackend>,
    ) -> Self {
        Self {
            config,
            storage,
            extractor,
            documents,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Convert `path`, yielding one status per unit in unit order.
    ///
    /// An unsupported extension, or a document that cannot be opened, yields
    /// a single `Error` status for unit 1.
    pub fn process_file<'a>(&'a self, path: &'a Path) -> impl Stream<Item = UnitStatus> + Send + 'a {
        async_stream::stream! {
            let base = base_name(path);
            match FileKind::from_path(path) {
                Err(e) => {
                    warn!(file = %path.display(), "{e}");
                    yield UnitStatus::failure(1, e);
                }
                Ok(FileKind::Pdf) => match self.page_count(path).await {
                    Err(e) => {
                        yield UnitStatus::failure(1, e);
                    }
                    Ok(pages) => {
                        info!(file = %path.display(), pages, "converting document");
                        for index in 0..pages {
                            let result = self.convert_pdf_page(path, &base, index).await;
                            yield self.finish_unit(&base, index + 1, result).await;
                        }
                    }
                },
                Ok(FileKind::Image) => {
                    let result = self.extract_layout(path).await.map(|markdown| PageResult {
                        page_index: 1,
                        markdown,
                        ..Default::default()
                    });
                    yield self.finish_unit(&base, 1, result).await;
                }
                Ok(FileKind::Spreadsheet) => {
                    let owned = path.to_path_buf();
                    match run_blocking(move || tabular::spreadsheet_to_markdown(&owned)).await {
                        Err(e) => {
                            yield UnitStatus::failure(1, e);
                        }
                        Ok(sheets) => {
                            if sheets.is_empty() {
                                warn!(file = %path.display(), "workbook has no non-empty sheet");
                            }
                            for (i, (sheet, converted)) in sheets.into_iter().enumerate() {
                                debug!(sheet = %sheet, ok = converted.is_ok(), "converted sheet");
                                let result = converted.map(|markdown| PageResult {
                                    page_index: i + 1,
                                    markdown,
                                    ..Default::default()
                                });
                                yield self.finish_unit(&base, i + 1, result).await;
                            }
                        }
                    }
                }
                Ok(kind) => {
                    let owned = path.to_path_buf();
                    let result = run_blocking(move || match kind {
                        FileKind::Csv => tabular::csv_to_markdown(&owned),
                        FileKind::WordDocument => tabular::docx_to_markdown(&owned),
                        _ => tabular::text_to_markdown(&owned),
                    })
                    .await
                    .map(|markdown| PageResult {
                        page_index: 1,
                        markdown,
                        ..Default::default()
                    });
                    yield self.finish_unit(&base, 1, result).await;
                }
            }
        }
    }

    async fn page_count(&self, path: &Path) -> Result<usize, UnitError> {
        let documents = Arc::clone(&self.documents);
        let source = path.to_path_buf();
        run_blocking(move || documents.page_count(&source)).await
    }

    /// Split page `index` (0-based) out of `source`, consolidate its images
    /// and extract its Markdown.
    ///
    /// The page's scratch directory is removed before this returns.
    pub async fn convert_pdf_page(
        &self,
        source: &Path,
        base: &str,
        index: usize,
    ) -> Result<PageResult, UnitError> {
        let n = index + 1;
        let page_base = format!("{base}_page_{n}");
        let split_path = self.config.split_root.join(split_file_name(base, n));

        let scratch = tempfile::Builder::new()
            .prefix("page-")
            .tempdir_in(&self.config.scratch_root)
            .map_err(|e| UnitError::extraction(format!("scratch directory: {e}")))?;
        let uploader = BlockingUploader::new(
            tokio::runtime::Handle::current(),
            Arc::clone(&self.storage),
        );
        let config = Arc::clone(&self.config);
        let documents = Arc::clone(&self.documents);
        let source_path = source.to_path_buf();
        let dest = split_path.clone();

        let report = run_blocking(move || {
            let consolidator = PageConsolidator::new(&config, &uploader);
            let mut report = ConsolidationReport::default();
            documents.rewrite_page(&source_path, index, &dest, &mut |surface: &mut dyn PageSurface| {
                report = consolidator.consolidate(surface, &page_base, scratch.path());
            })?;
            drop(scratch);
            Ok(report)
        })
        .await?;

        let markdown = self.extract_layout(&split_path).await?;
        Ok(PageResult {
            page_index: n,
            markdown,
            image_urls: report.image_urls,
            warnings: report.unresolved,
        })
    }

    async fn extract_layout(&self, path: &Path) -> Result<String, UnitError> {
        let raw = self.extractor.analyze(path).await?;
        Ok(postprocess::clean_markdown(&raw))
    }

    async fn finish_unit(
        &self,
        base: &str,
        n: usize,
        result: Result<PageResult, UnitError>,
    ) -> UnitStatus {
        let page = match result {
            Ok(page) => page,
            Err(e) => {
                warn!(unit = n, "{e}");
                return UnitStatus::failure(n, e);
            }
        };

        match self.persist(base, n, &page.markdown).await {
            Ok(url) => {
                let mut message = format!("Page {n} processed");
                if !page.warnings.is_empty() {
                    message.push_str(&format!(
                        " ({} image group(s) left unmerged)",
                        page.warnings.len()
                    ));
                }
                let mut status = UnitStatus::success(n, message, url);
                status.image_urls = page.image_urls;
                status
            }
            Err(e) => {
                warn!(unit = n, "{e}");
                let mut status = UnitStatus::failure(n, e);
                status.image_urls = page.image_urls;
                status
            }
        }
    }

    /// Write unit `n` to staging storage and publish it.
    async fn persist(&self, base: &str, n: usize, markdown: &str) -> Result<String, UnitError> {
        let name = part_file_name(base, n);
        let local: PathBuf = self.config.md_root.join(&name);
        tokio::fs::write(&local, markdown)
            .await
            .map_err(|e| UnitError::PersistenceFailure {
                path: local.clone(),
                detail: e.to_string(),
            })?;

        let key = self.config.markdown_key(&name);
        self.storage
            .upload_file(&local, &key)
            .await
            .map_err(|e| UnitError::upload(&key, &e))
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, UnitError>
where
    F: FnOnce() -> Result<T, UnitError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| UnitError::extraction(format!("worker task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;
    use async_trait::async_trait;
    use futures::StreamExt;
    use image::DynamicImage;

    struct EchoExtractor;

    #[async_trait]
    impl LayoutExtractor for EchoExtractor {
        async fn analyze(&self, path: &Path) -> Result<String, UnitError> {
            Ok(format!("# {}\n", path.file_name().unwrap().to_string_lossy()))
        }
    }

    struct NoDocuments;

    impl DocumentBackend for NoDocuments {
        fn page_count(&self, _source: &Path) -> Result<usize, UnitError> {
            Err(UnitError::extraction("not a PDF"))
        }
        fn rewrite_page(
            &self,
            _source: &Path,
            _page_index: usize,
            _dest: &Path,
            _edit: &mut dyn FnMut(&mut dyn PageSurface),
        ) -> Result<(), UnitError> {
            unreachable!()
        }
        fn render_first_page(&self, _source: &Path, _max: u32) -> Result<DynamicImage, UnitError> {
            unreachable!()
        }
    }

    async fn driver(dir: &Path) -> ConversionDriver {
        let config = PipelineConfig::builder().work_dir(dir.join("work")).build().unwrap();
        config.ensure_roots().unwrap();
        let storage = LocalStorage::new(dir.join("store")).await.unwrap();
        ConversionDriver::new(
            Arc::new(config),
            Arc::new(storage),
            Arc::new(EchoExtractor),
            Arc::new(NoDocuments),
        )
    }

    #[test]
    fn kinds_by_extension() {
        assert_eq!(FileKind::from_path(Path::new("a.PDF")).unwrap(), FileKind::Pdf);
        assert_eq!(FileKind::from_path(Path::new("a.jpeg")).unwrap(), FileKind::Image);
        assert_eq!(FileKind::from_path(Path::new("a.ods")).unwrap(), FileKind::Spreadsheet);
        assert!(matches!(
            FileKind::from_path(Path::new("a.xyz")),
            Err(UnitError::UnsupportedType { ref extension }) if extension == ".xyz"
        ));
        assert!(FileKind::from_path(Path::new("Makefile")).is_err());
    }

    #[test]
    fn artifact_names() {
        assert_eq!(base_name(Path::new("/up/report.v2.pdf")), "report.v2");
        assert_eq!(part_file_name("r", 3), "r_part_3.md");
        assert_eq!(split_file_name("r", 3), "r_page_3.pdf");
    }

    #[tokio::test]
    async fn text_file_is_one_unit() {
        let dir = tempfile::tempdir().unwrap();
        let d = driver(dir.path()).await;
        let input = dir.path().join("notes.txt");
        std::fs::write(&input, "hello").unwrap();

        let units: Vec<UnitStatus> = d.process_file(&input).collect().await;

        assert_eq!(units.len(), 1);
        assert!(units[0].is_success(), "{:?}", units[0]);
        assert_eq!(units[0].message, "Page 1 processed");
        assert!(units[0].artifact_url.as_deref().unwrap().ends_with("tmp_md/notes_part_1.md"));
        let staged = d.config().md_root.join("notes_part_1.md");
        assert_eq!(std::fs::read_to_string(staged).unwrap(), "hello");
    }

    #[tokio::test]
    async fn image_goes_through_layout_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let d = driver(dir.path()).await;
        let input = dir.path().join("scan.png");
        std::fs::write(&input, b"png").unwrap();

        let units: Vec<UnitStatus> = d.process_file(&input).collect().await;

        assert!(units[0].is_success());
        let staged = std::fs::read_to_string(d.config().md_root.join("scan_part_1.md")).unwrap();
        assert_eq!(staged, "# scan.png\n");
    }

    #[tokio::test]
    async fn unsupported_extension_is_single_error_unit() {
        let dir = tempfile::tempdir().unwrap();
        let d = driver(dir.path()).await;
        let input = dir.path().join("blob.xyz");
        std::fs::write(&input, b"?").unwrap();

        let units: Vec<UnitStatus> = d.process_file(&input).collect().await;

        assert_eq!(units.len(), 1);
        assert!(!units[0].is_success());
        assert!(matches!(units[0].error, Some(UnitError::UnsupportedType { .. })));
    }

    #[tokio::test]
    async fn unreadable_document_is_single_error_unit() {
        let dir = tempfile::tempdir().unwrap();
        let d = driver(dir.path()).await;
        let input = dir.path().join("broken.pdf");
        std::fs::write(&input, b"not a pdf").unwrap();

        let units: Vec<UnitStatus> = d.process_file(&input).collect().await;

        assert_eq!(units.len(), 1);
        assert!(matches!(units[0].error, Some(UnitError::ExtractionFailure { .. })));
    }

    #[tokio::test]
    async fn persistence_failure_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let d = driver(dir.path()).await;
        std::fs::remove_dir_all(&d.config().md_root).unwrap();
        let input = dir.path().join("a.txt");
        std::fs::write(&input, "x").unwrap();

        let units: Vec<UnitStatus> = d.process_file(&input).collect().await;

        assert!(matches!(units[0].error, Some(UnitError::PersistenceFailure { .. })));
    }
}
