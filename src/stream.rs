//! Multi-file streaming orchestrator.
//!
//! [`run_batch`] converts uploaded files strictly one after another and keeps
//! a [`FileStatus`] per file in an explicit [`BatchContext`]. After every
//! state change the full batch is published to the [`BatchProgress`] sink:
//!
//! ```text
//! queued ─▶ file start ─▶ unit … unit ─▶ file complete ─▶ next file … ─▶ done
//! ```
//!
//! Each file's staging parts, split pages, leftover composites and the
//! upload itself are deleted once its units are processed, whatever the
//! outcome. A deletion that fails is logged and the rest continue.
//!
//! Cleanup matches artifacts by base name, so batches that may run side by
//! side each get a [`BatchWorkspace`]: private subdirectories under every
//! working root, removed when the workspace is dropped.

use crate::config::PipelineConfig;
use crate::convert::{base_name, ConversionDriver};
use crate::error::Doc2MdError;
use crate::output::{BatchSnapshot, BatchState, FileState, FileStatus, UnitStatus};
use crate::progress::BatchProgress;
use futures::StreamExt;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Private working directories of one batch.
///
/// The unique `batch-*` name is claimed in `upload_root` and reused under
/// every other root of the base config.
#[derive(Debug)]
pub struct BatchWorkspace {
    config: Arc<PipelineConfig>,
    claim: TempDir,
}

impl BatchWorkspace {
    pub fn create(base: &PipelineConfig) -> Result<Self, Doc2MdError> {
        base.ensure_roots()?;
        let claim = tempfile::Builder::new()
            .prefix("batch-")
            .tempdir_in(&base.upload_root)
            .map_err(|source| Doc2MdError::WorkDirFailed {
                path: base.upload_root.clone(),
                source,
            })?;
        let scope = claim
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Doc2MdError::Internal("batch directory has no name".into()))?;

        let config = base.scoped(&scope);
        config.ensure_roots()?;
        debug!(scope, "created batch workspace");
        Ok(Self {
            config: Arc::new(config),
            claim,
        })
    }

    /// Config whose roots point into this workspace.
    pub fn config(&self) -> Arc<PipelineConfig> {
        Arc::clone(&self.config)
    }

    /// Directory uploads of this batch are written to.
    pub fn upload_dir(&self) -> &Path {
        self.claim.path()
    }
}

impl Drop for BatchWorkspace {
    fn drop(&mut self) {
        // upload_root is the claim itself and goes with the TempDir.
        for dir in [
            &self.config.md_root,
            &self.config.split_root,
            &self.config.img_root,
            &self.config.scratch_root,
        ] {
            match std::fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(dir = %dir.display(), "could not remove batch directory: {e}"),
            }
        }
    }
}

/// A file handed to the orchestrator.
///
/// The batch takes ownership of `path`: it is deleted during cleanup.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    /// Name reported in status records.
    pub filename: String,
    pub path: PathBuf,
}

impl UploadedFile {
    pub fn new(filename: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            filename: filename.into(),
            path: path.into(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct UnitTally {
    succeeded: usize,
    failed: usize,
}

/// Mutable state of one batch, in submission order.
#[derive(Debug)]
pub struct BatchContext {
    files: Vec<FileStatus>,
    tallies: Vec<UnitTally>,
    last_errors: Vec<Option<String>>,
}

impl BatchContext {
    pub fn new(files: &[UploadedFile]) -> Self {
        Self {
            files: files.iter().map(|f| FileStatus::queued(&f.filename)).collect(),
            tallies: vec![UnitTally::default(); files.len()],
            last_errors: vec![None; files.len()],
        }
    }

    pub fn snapshot(&self, status: BatchState) -> BatchSnapshot {
        BatchSnapshot {
            status,
            files: self.files.clone(),
        }
    }

    pub fn file(&self, index: usize) -> &FileStatus {
        &self.files[index]
    }

    fn start(&mut self, index: usize) {
        let file = &mut self.files[index];
        file.state = FileState::Processing;
        file.message = "Processing".into();
    }

    fn apply_unit(&mut self, index: usize, unit: &UnitStatus) {
        let file = &mut self.files[index];
        file.current_unit = Some(unit.unit_index);
        file.message = unit.message.clone();
        if unit.is_success() {
            self.tallies[index].succeeded += 1;
            if let Some(url) = &unit.artifact_url {
                file.urls.push(url.clone());
            }
        } else {
            self.tallies[index].failed += 1;
            self.last_errors[index] = Some(unit.message.clone());
        }
    }

    /// Success when at least one unit succeeded, Error otherwise.
    fn finish(&mut self, index: usize) {
        let tally = self.tallies[index];
        let file = &mut self.files[index];
        if tally.succeeded > 0 {
            file.state = FileState::Success;
            file.message = if tally.failed == 0 {
                format!("Processed {} unit(s)", tally.succeeded)
            } else {
                format!(
                    "Processed {} of {} unit(s); last error: {}",
                    tally.succeeded,
                    tally.succeeded + tally.failed,
                    self.last_errors[index].as_deref().unwrap_or("unknown")
                )
            };
        } else {
            file.state = FileState::Error;
            file.message = self.last_errors[index]
                .clone()
                .unwrap_or_else(|| "No content could be extracted".into());
        }
    }
}

/// Convert `files` in order, publishing snapshots to `progress`.
///
/// Always returns the final `done` snapshot; per-file failures are part of it.
pub async fn run_batch(
    driver: &ConversionDriver,
    files: &[UploadedFile],
    progress: &dyn BatchProgress,
) -> BatchSnapshot {
    let mut ctx = BatchContext::new(files);
    info!(files = files.len(), "batch started");
    progress.on_batch_start(files.len());
    progress.on_snapshot(&ctx.snapshot(BatchState::Running));

    for (index, file) in files.iter().enumerate() {
        ctx.start(index);
        progress.on_file_start(index, &file.filename);
        progress.on_snapshot(&ctx.snapshot(BatchState::Running));

        let units = driver.process_file(&file.path);
        futures::pin_mut!(units);
        while let Some(unit) = units.next().await {
            ctx.apply_unit(index, &unit);
            progress.on_unit(index, &unit);
            progress.on_snapshot(&ctx.snapshot(BatchState::Running));
        }

        cleanup_artifacts(driver.config(), file).await;

        ctx.finish(index);
        info!(file = %file.filename, state = ?ctx.file(index).state, "file finished");
        progress.on_file_complete(index, ctx.file(index));
        progress.on_snapshot(&ctx.snapshot(BatchState::Running));
    }

    let done = ctx.snapshot(BatchState::Done);
    progress.on_snapshot(&done);
    progress.on_batch_complete(&done);
    done
}

/// Delete every local artifact derived from `file`. Returns how many were removed.
pub async fn cleanup_artifacts(config: &PipelineConfig, file: &UploadedFile) -> usize {
    let base = regex::escape(&base_name(&file.path));
    let patterns = [
        (&config.md_root, format!(r"^{base}_part_\d+\.md$")),
        (&config.split_root, format!(r"^{base}_page_\d+\.pdf$")),
        (&config.img_root, format!(r"^{base}_page_\d+_g\d+\.jpg$")),
    ];

    let mut removed = 0;
    for (dir, pattern) in patterns {
        let Ok(re) = Regex::new(&pattern) else {
            warn!(pattern, "invalid cleanup pattern");
            continue;
        };
        removed += remove_matching(dir, &re).await;
    }

    match tokio::fs::remove_file(&file.path).await {
        Ok(()) => removed += 1,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %file.path.display(), "could not remove upload: {e}"),
    }
    debug!(file = %file.filename, removed, "cleaned up artifacts");
    removed
}

async fn remove_matching(dir: &Path, re: &Regex) -> usize {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), "could not list directory: {e}");
            return 0;
        }
    };

    let mut removed = 0;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!(dir = %dir.display(), "could not read directory entry: {e}");
                break;
            }
        };
        let name = entry.file_name();
        if !re.is_match(&name.to_string_lossy()) {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %entry.path().display(), "could not remove artifact: {e}"),
        }
    }
    removed
}
