//! Result and status records produced by the pipeline.
//!
//! [`UnitStatus`] is what the conversion driver yields per unit.
//! [`FileStatus`] and [`BatchSnapshot`] are what the orchestrator publishes;
//! their JSON shape is the wire format of the HTTP event stream:
//!
//! ```json
//! {"status":"running","files":[{"filename":"a.pdf","status":"processing",
//!   "message":"Page 1 processed","urls":["https://…/tmp_md/a_part_1.md"],
//!   "current_page":1}]}
//! ```

use crate::error::UnitError;
use serde::{Deserialize, Serialize};

/// Markdown produced for one unit (page, sheet, or whole file).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
    /// 1-based unit number.
    pub page_index: usize,
    pub markdown: String,
    /// Composite image URLs referenced from `markdown`, in cluster order.
    pub image_urls: Vec<String>,
    /// Clusters that were left unresolved on this page.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<UnitError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitOutcome {
    Success,
    Error,
}

/// Status of one processed unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitStatus {
    /// 1-based unit number.
    pub unit_index: usize,
    pub outcome: UnitOutcome,
    /// Human-readable summary, e.g. `Page 2 processed`.
    pub message: String,
    /// URL of the staged Markdown part on success.
    pub artifact_url: Option<String>,
    /// Composite image URLs published while converting this unit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<UnitError>,
}

impl UnitStatus {
    pub fn success(unit_index: usize, message: impl Into<String>, artifact_url: String) -> Self {
        Self {
            unit_index,
            outcome: UnitOutcome::Success,
            message: message.into(),
            artifact_url: Some(artifact_url),
            image_urls: Vec::new(),
            error: None,
        }
    }

    pub fn failure(unit_index: usize, error: UnitError) -> Self {
        Self {
            unit_index,
            outcome: UnitOutcome::Error,
            message: error.to_string(),
            artifact_url: None,
            image_urls: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == UnitOutcome::Success
    }
}

/// Lifecycle of one file in a batch. `Success` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    Queued,
    Processing,
    Success,
    Error,
}

impl FileState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FileState::Success | FileState::Error)
    }
}

/// Live status of one file in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStatus {
    pub filename: String,
    #[serde(rename = "status")]
    pub state: FileState,
    pub message: String,
    /// Staged Markdown URLs of the successful units, in unit order.
    pub urls: Vec<String>,
    /// Unit most recently reported, 1-based.
    #[serde(rename = "current_page")]
    pub current_unit: Option<usize>,
}

impl FileStatus {
    pub fn queued(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            state: FileState::Queued,
            message: "Queued".into(),
            urls: Vec::new(),
            current_unit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchState {
    Running,
    Done,
}

/// Full-batch view published after every state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub status: BatchState,
    pub files: Vec<FileStatus>,
}

impl BatchSnapshot {
    pub fn is_done(&self) -> bool {
        self.status == BatchState::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_wire_format() {
        let snap = BatchSnapshot {
            status: BatchState::Running,
            files: vec![FileStatus {
                filename: "a.pdf".into(),
                state: FileState::Processing,
                message: "Page 1 processed".into(),
                urls: vec!["u1".into()],
                current_unit: Some(1),
            }],
        };
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["files"][0]["status"], "processing");
        assert_eq!(json["files"][0]["current_page"], 1);
        assert_eq!(json["files"][0]["urls"][0], "u1");
    }

    #[test]
    fn failure_status_carries_message() {
        let s = UnitStatus::failure(
            1,
            UnitError::UnsupportedType {
                extension: ".xyz".into(),
            },
        );
        assert!(!s.is_success());
        assert!(s.message.contains(".xyz"));
        assert!(s.artifact_url.is_none());
    }

    #[test]
    fn terminal_states() {
        assert!(FileState::Success.is_terminal());
        assert!(FileState::Error.is_terminal());
        assert!(!FileState::Processing.is_terminal());
    }
}
