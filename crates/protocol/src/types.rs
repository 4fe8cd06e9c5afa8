use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of one file upload task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "hashing")]
    Hashing,
    #[serde(rename = "uploading")]
    Uploading,
    #[serde(rename = "merging")]
    Merging,
    /// All chunks acknowledged, waiting for a manual merge trigger.
    #[serde(rename = "awaiting_merge")]
    AwaitingMerge,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl TaskStatus {
    /// Returns `true` for states no scheduled work can leave on its own.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns `true` while the task still owns (or will own) scheduled work.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Hashing | Self::Uploading | Self::Merging
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Hashing => "hashing",
            Self::Uploading => "uploading",
            Self::Merging => "merging",
            Self::AwaitingMerge => "awaiting-merge",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A fully stored file on the server side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub file_id: String,
    pub fingerprint: String,
    pub file_name: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Server-side state of a chunk session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    #[serde(rename = "uploading")]
    Uploading,
    #[serde(rename = "merged")]
    Merged,
}

/// Projection of one task, as shown to observers of the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatusEntry {
    pub task_id: String,
    pub file_name: String,
    /// 0–100, never decreasing while the task is neither cancelled nor failed.
    pub progress_percent: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status_message: String,
    pub lifecycle_status: TaskStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl QueueStatusEntry {
    /// Creates the initial entry for a freshly enqueued task.
    pub fn pending(task_id: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            file_name: file_name.into(),
            progress_percent: 0.0,
            status_message: "waiting".into(),
            lifecycle_status: TaskStatus::Pending,
            error: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_serialization() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::AwaitingMerge).unwrap(),
            "\"awaiting_merge\""
        );
        assert_eq!(
            serde_json::to_string(&TaskStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
        let parsed: TaskStatus = serde_json::from_str("\"hashing\"").unwrap();
        assert_eq!(parsed, TaskStatus::Hashing);
    }

    #[test]
    fn task_status_classification() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::AwaitingMerge.is_terminal());
        assert!(!TaskStatus::AwaitingMerge.is_active());
        assert!(TaskStatus::Hashing.is_active());
        assert!(!TaskStatus::Failed.is_active());
    }

    #[test]
    fn file_record_field_names() {
        let json = r#"{"fileId":"f1","fingerprint":"abc","fileName":"a.bin","sizeBytes":12}"#;
        let record: FileRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.file_id, "f1");
        assert_eq!(record.size_bytes, 12);
        assert!(record.path.is_empty());
        assert!(record.created_at.is_none());
    }

    #[test]
    fn queue_entry_omits_empty_error() {
        let entry = QueueStatusEntry::pending("t1", "a.bin");
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"lifecycleStatus\":\"pending\""));
        assert!(!json.contains("error"));
    }
}
