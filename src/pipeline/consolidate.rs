//! Page image consolidation.
//!
//! Scattered pictures on a page (a figure cut into tiles, a logo next to a
//! chart) confuse layout extraction. For each cluster of adjacent images the
//! consolidator builds one composite, publishes it, deletes the originals from
//! the page and writes `![name](url)` where they used to be. The layout
//! extractor then reads the reference as ordinary page text.
//!
//! A cluster that cannot be merged or published is left untouched on the page
//! and reported in [`ConsolidationReport::unresolved`]; the remaining clusters
//! are still processed.

use crate::cluster::{build_clusters, Cluster, ImageRegion};
use crate::config::PipelineConfig;
use crate::error::UnitError;
use crate::geometry::{compose_raster, union_bounding_box, MergeDirection};
use crate::pipeline::document::PageSurface;
use crate::storage::BlockingUploader;
use image::codecs::jpeg::JpegEncoder;
use image::ImageFormat;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tracing::{debug, info, warn};

/// Outcome of consolidating one page.
#[derive(Debug, Default)]
pub struct ConsolidationReport {
    /// Published composite URLs, in cluster order.
    pub image_urls: Vec<String>,
    /// One entry per cluster that was left as it was.
    pub unresolved: Vec<UnitError>,
}

/// A published composite image.
#[derive(Debug, Clone)]
pub struct CompositeArtifact {
    pub name: String,
    pub remote_url: String,
    pub direction: MergeDirection,
}

/// Rewrites the images of a page. Runs on a blocking thread.
pub struct PageConsolidator<'a> {
    config: &'a PipelineConfig,
    uploader: &'a BlockingUploader,
}

impl<'a> PageConsolidator<'a> {
    pub fn new(config: &'a PipelineConfig, uploader: &'a BlockingUploader) -> Self {
        Self { config, uploader }
    }

    /// Consolidate the images on `surface`.
    ///
    /// `base_name` prefixes composite file names (`{base_name}_g{i}.jpg`).
    /// Extracted rasters are written to `scratch` and deleted once their
    /// cluster is done; the caller owns and removes `scratch` itself.
    pub fn consolidate(
        &self,
        surface: &mut dyn PageSurface,
        base_name: &str,
        scratch: &Path,
    ) -> ConsolidationReport {
        let mut report = ConsolidationReport::default();

        let regions: Vec<ImageRegion> = surface
            .embedded_images()
            .into_iter()
            .enumerate()
            .map(|(i, image)| {
                let raster = image.raster.and_then(|img| {
                    let path = scratch.join(format!("img_{i}.png"));
                    img.save_with_format(&path, ImageFormat::Png)
                        .map(|_| path)
                        .map_err(|e| format!("cannot write raster {i}: {e}"))
                });
                ImageRegion {
                    rect: image.rect,
                    source: image.handle,
                    raster,
                }
            })
            .collect();

        if regions.is_empty() {
            debug!(page = base_name, "no embedded images");
            return report;
        }

        let clusters = build_clusters(regions, self.config.padding);
        info!(
            page = base_name,
            clusters = clusters.len(),
            "consolidating embedded images"
        );

        for (index, cluster) in clusters.iter().enumerate() {
            match self.publish_composite(cluster, base_name, index) {
                Ok(artifact) => {
                    self.replace_members(surface, cluster, &artifact, &mut report);
                    report.image_urls.push(artifact.remote_url);
                }
                Err(e) => {
                    warn!(page = base_name, cluster = index, "cluster left unresolved: {e}");
                    report.unresolved.push(e);
                }
            }
            release_rasters(cluster);
        }
        report
    }

    fn publish_composite(
        &self,
        cluster: &Cluster,
        base_name: &str,
        index: usize,
    ) -> Result<CompositeArtifact, UnitError> {
        let frames = cluster
            .members
            .iter()
            .map(|m| match &m.raster {
                Ok(path) => image::open(path)
                    .map_err(|e| UnitError::extraction(format!("{}: {e}", path.display()))),
                Err(detail) => Err(UnitError::extraction(detail.clone())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let direction = cluster.direction();
        let canvas = compose_raster(&frames, direction)
            .map_err(|e| UnitError::extraction(e.to_string()))?;

        let name = format!("{base_name}_g{index}.jpg");
        let local_path = self.config.img_root.join(&name);
        write_jpeg(&canvas, &local_path, self.config.jpeg_quality)?;

        let key = self.config.image_key(&name);
        let uploaded = self.uploader.upload_file(&local_path, &key);
        if let Err(e) = std::fs::remove_file(&local_path) {
            warn!(path = %local_path.display(), "could not remove composite: {e}");
        }
        let remote_url = uploaded.map_err(|e| UnitError::upload(&key, &e))?;
        debug!(key, members = cluster.members.len(), ?direction, "published composite");

        Ok(CompositeArtifact {
            name,
            remote_url,
            direction,
        })
    }

    fn replace_members(
        &self,
        surface: &mut dyn PageSurface,
        cluster: &Cluster,
        artifact: &CompositeArtifact,
        report: &mut ConsolidationReport,
    ) {
        for member in &cluster.members {
            if let Err(e) = surface.remove_object(member.source) {
                warn!(object = member.source.0, "could not remove image object: {e}");
            }
        }

        let annotation = format!("![{}]({})", artifact.name, artifact.remote_url);
        let placed = union_bounding_box(&cluster.rects())
            .map_err(|e| e.to_string())
            .and_then(|bbox| {
                surface.insert_text(bbox, &annotation, self.config.annotation_font_size)
            });
        if let Err(e) = placed {
            report
                .unresolved
                .push(UnitError::extraction(format!("cannot annotate {}: {e}", artifact.name)));
        }
    }
}

fn write_jpeg(canvas: &image::RgbImage, path: &Path, quality: u8) -> Result<(), UnitError> {
    let file = File::create(path)
        .map_err(|e| UnitError::extraction(format!("{}: {e}", path.display())))?;
    let mut writer = BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, quality)
        .encode_image(canvas)
        .map_err(|e| UnitError::extraction(format!("{}: {e}", path.display())))
}

fn release_rasters(cluster: &Cluster) {
    for member in &cluster.members {
        if let Ok(path) = &member.raster {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), "could not remove raster: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;
    use crate::pipeline::document::{EmbeddedImage, ObjectHandle};
    use crate::storage::{StorageBackend, StorageError};
    use async_trait::async_trait;
    use image::{DynamicImage, Rgb, RgbImage};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingStore {
        keys: Mutex<Vec<String>>,
        fail_all: bool,
    }

    #[async_trait]
    impl StorageBackend for RecordingStore {
        async fn upload_stream(&self, _bytes: Vec<u8>, key: &str) -> Result<String, StorageError> {
            if self.fail_all {
                return Err(StorageError::Transport {
                    key: key.into(),
                    detail: "denied".into(),
                });
            }
            self.keys.lock().unwrap().push(key.to_string());
            Ok(format!("https://cdn.test/{key}"))
        }
    }

    struct FakePage {
        images: Vec<EmbeddedImage>,
        removed: Vec<ObjectHandle>,
        texts: Vec<(Rect, String)>,
    }

    impl FakePage {
        fn new(images: Vec<EmbeddedImage>) -> Self {
            Self {
                images,
                removed: Vec::new(),
                texts: Vec::new(),
            }
        }
    }

    impl PageSurface for FakePage {
        fn embedded_images(&mut self) -> Vec<EmbeddedImage> {
            self.images.clone()
        }
        fn remove_object(&mut self, handle: ObjectHandle) -> Result<(), String> {
            self.removed.push(handle);
            Ok(())
        }
        fn insert_text(&mut self, rect: Rect, text: &str, _size: f32) -> Result<(), String> {
            self.texts.push((rect, text.to_string()));
            Ok(())
        }
    }

    fn image_at(i: usize, rect: Rect) -> EmbeddedImage {
        EmbeddedImage {
            rect,
            handle: ObjectHandle(i),
            raster: Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 6, Rgb([9, 9, 9])))),
        }
    }

    struct Fixture {
        _rt: tokio::runtime::Runtime,
        dir: tempfile::TempDir,
        config: PipelineConfig,
        uploader: BlockingUploader,
        store: Arc<RecordingStore>,
    }

    fn fixture(fail_all: bool) -> Fixture {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::builder().work_dir(dir.path()).build().unwrap();
        config.ensure_roots().unwrap();
        let store = Arc::new(RecordingStore {
            fail_all,
            ..Default::default()
        });
        let uploader = BlockingUploader::new(rt.handle().clone(), store.clone());
        Fixture {
            _rt: rt,
            dir,
            config,
            uploader,
            store,
        }
    }

    #[test]
    fn adjacent_images_become_one_annotation() {
        let fx = fixture(false);
        let mut page = FakePage::new(vec![
            image_at(0, Rect::new(0.0, 0.0, 10.0, 10.0)),
            image_at(1, Rect::new(12.0, 0.0, 20.0, 10.0)),
            image_at(2, Rect::new(300.0, 300.0, 310.0, 320.0)),
        ]);
        let scratch = tempfile::tempdir_in(fx.dir.path()).unwrap();

        let report = PageConsolidator::new(&fx.config, &fx.uploader).consolidate(
            &mut page,
            "doc_page_1",
            scratch.path(),
        );

        assert!(report.unresolved.is_empty(), "{:?}", report.unresolved);
        assert_eq!(
            report.image_urls,
            vec![
                "https://cdn.test/images/doc_page_1_g0.jpg",
                "https://cdn.test/images/doc_page_1_g1.jpg"
            ]
        );
        assert_eq!(page.removed, vec![ObjectHandle(0), ObjectHandle(1), ObjectHandle(2)]);
        assert_eq!(page.texts.len(), 2);
        assert_eq!(
            page.texts[0].1,
            "![doc_page_1_g0.jpg](https://cdn.test/images/doc_page_1_g0.jpg)"
        );
        // union (0,0,20,10) shifted down by 5
        assert_eq!(page.texts[0].0, Rect::new(0.0, 5.0, 20.0, 15.0));
        assert_eq!(fx.store.keys.lock().unwrap().len(), 2);
    }

    #[test]
    fn scratch_and_composites_are_released() {
        let fx = fixture(false);
        let mut page = FakePage::new(vec![image_at(0, Rect::new(0.0, 0.0, 10.0, 10.0))]);
        let scratch = tempfile::tempdir_in(fx.dir.path()).unwrap();

        PageConsolidator::new(&fx.config, &fx.uploader).consolidate(&mut page, "d", scratch.path());

        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(&fx.config.img_root).unwrap().count(), 0);
    }

    #[test]
    fn upload_failure_leaves_cluster_untouched() {
        let fx = fixture(true);
        let mut page = FakePage::new(vec![image_at(0, Rect::new(0.0, 0.0, 10.0, 10.0))]);
        let scratch = tempfile::tempdir_in(fx.dir.path()).unwrap();

        let report = PageConsolidator::new(&fx.config, &fx.uploader).consolidate(
            &mut page,
            "d",
            scratch.path(),
        );

        assert!(report.image_urls.is_empty());
        assert!(matches!(
            report.unresolved.as_slice(),
            [UnitError::UploadFailure { key, .. }] if key == "images/d_g0.jpg"
        ));
        assert!(page.removed.is_empty());
        assert!(page.texts.is_empty());
    }

    #[test]
    fn undecodable_image_fails_only_its_cluster() {
        let fx = fixture(false);
        let mut broken = image_at(0, Rect::new(0.0, 0.0, 10.0, 10.0));
        broken.raster = Err("unsupported filter".into());
        let mut page = FakePage::new(vec![broken, image_at(1, Rect::new(200.0, 0.0, 210.0, 10.0))]);
        let scratch = tempfile::tempdir_in(fx.dir.path()).unwrap();

        let report = PageConsolidator::new(&fx.config, &fx.uploader).consolidate(
            &mut page,
            "d",
            scratch.path(),
        );

        assert_eq!(report.unresolved.len(), 1);
        assert_eq!(report.image_urls, vec!["https://cdn.test/images/d_g1.jpg"]);
        assert_eq!(page.removed, vec![ObjectHandle(1)]);
    }

    #[test]
    fn page_without_images_is_untouched() {
        let fx = fixture(false);
        let mut page = FakePage::new(vec![]);
        let scratch = tempfile::tempdir_in(fx.dir.path()).unwrap();
        let report = PageConsolidator::new(&fx.config, &fx.uploader).consolidate(
            &mut page,
            "d",
            scratch.path(),
        );
        assert!(report.image_urls.is_empty());
        assert!(report.unresolved.is_empty());
        assert!(page.texts.is_empty());
    }
}
