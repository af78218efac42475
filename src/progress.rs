//! Progress sink for batch conversion events.
//!
//! The orchestrator owns the batch state and publishes it only through a
//! [`BatchProgress`] passed to [`crate::stream::run_batch`]. The HTTP surface
//! forwards snapshots into a channel ([`ChannelProgress`]); the CLI drives a
//! terminal progress bar.
//!
//! # Example
//!
//! ```rust
//! use edgequake_doc2md::{BatchProgress, BatchSnapshot};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct CountingProgress {
//!     snapshots: AtomicUsize,
//! }
//!
//! impl BatchProgress for CountingProgress {
//!     fn on_snapshot(&self, _snapshot: &BatchSnapshot) {
//!         self.snapshots.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//! ```

use crate::output::{BatchSnapshot, FileStatus, UnitStatus};
use tokio::sync::mpsc::UnboundedSender;

/// Receives batch events. All methods default to no-ops.
///
/// Events arrive in order from a single task. `on_snapshot` follows every
/// state change, after the more specific event that caused it.
pub trait BatchProgress: Send + Sync {
    /// Full batch state after a change.
    fn on_snapshot(&self, snapshot: &BatchSnapshot) {
        let _ = snapshot;
    }

    /// Called once with the number of queued files.
    fn on_batch_start(&self, total_files: usize) {
        let _ = total_files;
    }

    /// A file (0-based position in the batch) starts processing.
    fn on_file_start(&self, file_index: usize, filename: &str) {
        let _ = (file_index, filename);
    }

    /// A unit of the current file has been processed.
    fn on_unit(&self, file_index: usize, unit: &UnitStatus) {
        let _ = (file_index, unit);
    }

    /// A file reached its terminal state.
    fn on_file_complete(&self, file_index: usize, status: &FileStatus) {
        let _ = (file_index, status);
    }

    /// Called once after the final snapshot.
    fn on_batch_complete(&self, snapshot: &BatchSnapshot) {
        let _ = snapshot;
    }
}

/// Ignores every event.
pub struct NoopProgress;

impl BatchProgress for NoopProgress {}

/// Forwards every snapshot into an unbounded channel.
///
/// A closed receiver is ignored: the batch still runs to completion and
/// cleans up after itself.
pub struct ChannelProgress {
    tx: UnboundedSender<BatchSnapshot>,
}

impl ChannelProgress {
    pub fn new(tx: UnboundedSender<BatchSnapshot>) -> Self {
        Self { tx }
    }
}

impl BatchProgress for ChannelProgress {
    fn on_snapshot(&self, snapshot: &BatchSnapshot) {
        let _ = self.tx.send(snapshot.clone());
    }
}
