//! Page-description documents: split, inspect, edit and render pages.
//!
//! The consolidator never touches pdfium directly. It sees one page through
//! [`PageSurface`] (list embedded images, delete an object, write text) and
//! the driver reaches the file through [`DocumentBackend`]. [`PdfiumBackend`]
//! is the production implementation; tests substitute in-memory fakes.
//!
//! ## Threading
//!
//! pdfium keeps thread-local state and every call blocks, so all methods here
//! are synchronous and callers run them inside `tokio::task::spawn_blocking`.
//! Each call binds the library afresh, which keeps [`PdfiumBackend`] a plain
//! `Send + Sync` value.
//!
//! ## Coordinates
//!
//! pdfium reports positions with the origin at the bottom-left corner. The
//! surface converts to the top-left, y-down space of [`Rect`].

use crate::error::{Doc2MdError, UnitError};
use crate::geometry::Rect;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Opaque reference to an object in a page's object table.
///
/// Valid only for the [`PageSurface`] that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle(pub usize);

/// An image placed on a page.
#[derive(Debug, Clone)]
pub struct EmbeddedImage {
    /// Placement rectangle in top-left page coordinates.
    pub rect: Rect,
    pub handle: ObjectHandle,
    /// Decoded pixels, or why they could not be decoded.
    pub raster: Result<DynamicImage, String>,
}

/// Editing view of a single page.
pub trait PageSurface {
    /// Every image object on the page, in object-table order.
    fn embedded_images(&mut self) -> Vec<EmbeddedImage>;

    /// Remove an object from the page.
    fn remove_object(&mut self, handle: ObjectHandle) -> Result<(), String>;

    /// Write `text` on the page with its top-left corner at `rect`.
    fn insert_text(&mut self, rect: Rect, text: &str, font_size: f32) -> Result<(), String>;
}

/// Access to multi-page documents on disk.
pub trait DocumentBackend: Send + Sync {
    /// Number of pages in the document.
    fn page_count(&self, source: &Path) -> Result<usize, UnitError>;

    /// Copy page `page_index` (0-based) of `source` into a new single-page
    /// document, let `edit` modify it, and save the result to `dest`.
    fn rewrite_page(
        &self,
        source: &Path,
        page_index: usize,
        dest: &Path,
        edit: &mut dyn FnMut(&mut dyn PageSurface),
    ) -> Result<(), UnitError>;

    /// Render the first page of `source` with its longest side at most
    /// `max_pixels`.
    fn render_first_page(&self, source: &Path, max_pixels: u32) -> Result<DynamicImage, UnitError>;
}

/// [`DocumentBackend`] over the pdfium C library.
#[derive(Debug, Clone, Default)]
pub struct PdfiumBackend {
    /// Library file or the directory containing it. `None` uses the system loader.
    library_path: Option<PathBuf>,
    password: Option<String>,
}

impl PdfiumBackend {
    pub fn new(library_path: Option<PathBuf>, password: Option<String>) -> Self {
        Self {
            library_path,
            password,
        }
    }

    /// Library location from `PDFIUM_LIB_PATH`, if set.
    pub fn from_env(password: Option<String>) -> Self {
        let library_path = std::env::var_os("PDFIUM_LIB_PATH")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        Self::new(library_path, password)
    }

    /// Bind the library once to fail fast on a broken installation.
    pub fn check(&self) -> Result<(), Doc2MdError> {
        self.bind().map(|_| ())
    }

    fn bind(&self) -> Result<Pdfium, Doc2MdError> {
        let bindings = match &self.library_path {
            Some(path) if path.is_dir() => {
                Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(path))
            }
            Some(path) => Pdfium::bind_to_library(path),
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|e| Doc2MdError::PdfiumBindingFailed(format!("{e:?}")))?;
        Ok(Pdfium::new(bindings))
    }

    fn bind_for_unit(&self) -> Result<Pdfium, UnitError> {
        self.bind().map_err(|e| UnitError::extraction(e.to_string()))
    }

    fn open<'a>(&'a self, pdfium: &'a Pdfium, path: &Path) -> Result<PdfDocument<'a>, UnitError> {
        pdfium
            .load_pdf_from_file(path, self.password.as_deref())
            .map_err(|e| {
                UnitError::extraction(format!("cannot open '{}': {e:?}", path.display()))
            })
    }
}

impl DocumentBackend for PdfiumBackend {
    fn page_count(&self, source: &Path) -> Result<usize, UnitError> {
        let pdfium = self.bind_for_unit()?;
        let document = self.open(&pdfium, source)?;
        Ok(document.pages().len() as usize)
    }

    fn rewrite_page(
        &self,
        source: &Path,
        page_index: usize,
        dest: &Path,
        edit: &mut dyn FnMut(&mut dyn PageSurface),
    ) -> Result<(), UnitError> {
        let pdfium = self.bind_for_unit()?;
        let src = self.open(&pdfium, source)?;
        let index = u16::try_from(page_index)
            .map_err(|_| UnitError::extraction(format!("page index {page_index} out of range")))?;

        let mut single = pdfium
            .create_new_pdf()
            .map_err(|e| UnitError::extraction(format!("cannot create document: {e:?}")))?;
        single
            .pages_mut()
            .copy_page_from_document(&src, index, 0)
            .map_err(|e| UnitError::extraction(format!("cannot copy page {}: {e:?}", page_index + 1)))?;
        let font = single.fonts_mut().helvetica();

        {
            let page = single
                .pages()
                .get(0)
                .map_err(|e| UnitError::extraction(format!("copied page missing: {e:?}")))?;
            let mut surface = PdfiumSurface {
                page_height: page.height().value,
                page,
                font,
                removals: Vec::new(),
                inserts: Vec::new(),
            };
            edit(&mut surface);
            surface.commit();
        }

        // Default pdfium save: no garbage-collection or deflate flags are exposed.
        single.save_to_file(dest).map_err(|e| {
            UnitError::extraction(format!("cannot save '{}': {e:?}", dest.display()))
        })?;
        debug!(page = page_index + 1, dest = %dest.display(), "wrote single-page document");
        Ok(())
    }

    fn render_first_page(&self, source: &Path, max_pixels: u32) -> Result<DynamicImage, UnitError> {
        let pdfium = self.bind_for_unit()?;
        let document = self.open(&pdfium, source)?;
        let page = document
            .pages()
            .get(0)
            .map_err(|e| UnitError::extraction(format!("document has no pages: {e:?}")))?;

        let render_config = PdfRenderConfig::new()
            .set_target_width(max_pixels as i32)
            .set_maximum_height(max_pixels as i32);
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| UnitError::extraction(format!("render failed: {e:?}")))?;
        let image = bitmap.as_image();
        debug!("Rendered {} → {}x{} px", source.display(), image.width(), image.height());
        Ok(image)
    }
}

/// Page edits are queued and applied in [`commit`](PdfiumSurface::commit)
/// so handles keep pointing at the objects they were issued for.
struct PdfiumSurface<'a> {
    page: PdfPage<'a>,
    page_height: f32,
    font: PdfFontToken,
    removals: Vec<usize>,
    inserts: Vec<(Rect, String, f32)>,
}

impl PdfiumSurface<'_> {
    fn commit(mut self) {
        self.removals.sort_unstable();
        self.removals.dedup();
        for &index in self.removals.iter().rev() {
            if let Err(e) = self.page.objects_mut().remove_object_at_index(index) {
                warn!(object = index, "could not remove image object: {e:?}");
            }
        }

        for (rect, text, size) in std::mem::take(&mut self.inserts) {
            let x = PdfPoints::new(rect.x0);
            let y = PdfPoints::new(self.page_height - rect.y0 - size);
            if let Err(e) = self.page.objects_mut().create_text_object(
                x,
                y,
                &text,
                self.font,
                PdfPoints::new(size),
            ) {
                warn!("could not write annotation '{text}': {e:?}");
            }
        }
    }
}

impl PageSurface for PdfiumSurface<'_> {
    fn embedded_images(&mut self) -> Vec<EmbeddedImage> {
        let mut images = Vec::new();
        for (index, object) in self.page.objects().iter().enumerate() {
            let Some(image_object) = object.as_image_object() else {
                continue;
            };
            let bounds = match object.bounds() {
                Ok(b) => b,
                Err(e) => {
                    warn!(object = index, "image object without bounds: {e:?}");
                    continue;
                }
            };
            let rect = Rect::new(
                bounds.left().value,
                self.page_height - bounds.top().value,
                bounds.right().value,
                self.page_height - bounds.bottom().value,
            );
            let raster = image_object
                .get_raw_image()
                .map_err(|e| format!("cannot decode image object {index}: {e:?}"));
            images.push(EmbeddedImage {
                rect,
                handle: ObjectHandle(index),
                raster,
            });
        }
        images
    }

    fn remove_object(&mut self, handle: ObjectHandle) -> Result<(), String> {
        let count = self.page.objects().len();
        if handle.0 >= count {
            return Err(format!("object {} out of range ({count} objects)", handle.0));
        }
        self.removals.push(handle.0);
        Ok(())
    }

    fn insert_text(&mut self, rect: Rect, text: &str, font_size: f32) -> Result<(), String> {
        if text.is_empty() {
            return Err("empty annotation".into());
        }
        self.inserts.push((rect, text.to_string(), font_size));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_library_path_is_kept() {
        let backend = PdfiumBackend::new(Some(PathBuf::from("/opt/pdfium")), None);
        assert_eq!(backend.library_path.as_deref(), Some(Path::new("/opt/pdfium")));
    }

    #[test]
    fn missing_library_is_a_binding_error() {
        let backend = PdfiumBackend::new(
            Some(PathBuf::from("/nonexistent/libpdfium-does-not-exist.so")),
            None,
        );
        assert!(matches!(
            backend.check(),
            Err(Doc2MdError::PdfiumBindingFailed(_))
        ));
    }

    #[test]
    fn unit_calls_surface_binding_failure_as_extraction_error() {
        let backend = PdfiumBackend::new(
            Some(PathBuf::from("/nonexistent/libpdfium-does-not-exist.so")),
            None,
        );
        let err = backend.page_count(Path::new("x.pdf")).unwrap_err();
        assert!(matches!(err, UnitError::ExtractionFailure { .. }));
    }
}
