use crate::error::{ArgusError, ArgusResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Per-file processing lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Parsing,
    Parsed,
    Aggregating,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub const ALL: [ProcessingStatus; 6] = [
        Self::Pending,
        Self::Parsing,
        Self::Parsed,
        Self::Aggregating,
        Self::Completed,
        Self::Failed,
    ];

    pub fn allowed_transitions(&self) -> &'static [ProcessingStatus] {
        match self {
            Self::Pending => &[Self::Parsing, Self::Failed],
            Self::Parsing => &[Self::Parsed, Self::Failed],
            Self::Parsed => &[Self::Aggregating, Self::Failed],
            Self::Aggregating => &[Self::Completed, Self::Failed],
            Self::Completed | Self::Failed => &[],
        }
    }

    pub fn can_transition_to(&self, target: ProcessingStatus) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Parsing => "parsing",
            Self::Parsed => "parsed",
            Self::Aggregating => "aggregating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Invalid processing status: {s}"))
    }
}

/// One uploaded file. Persisted on its own; the owning batch only tracks a count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: Uuid,
    pub batch_id: Uuid,
    /// System-assigned object name
    pub filename: String,
    pub original_filename: String,
    pub file_size: i64,
    pub file_type: String,
    pub upload_time: DateTime<Utc>,
    pub storage_path: String,
    pub storage_etag: String,
    pub processing_status: ProcessingStatus,
    pub parse_duration_ms: Option<i64>,
    pub record_count: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn new(batch_id: Uuid, original_filename: &str, file_size: i64) -> ArgusResult<Self> {
        if batch_id.is_nil() {
            return Err(ArgusError::validation("batch_id must not be nil"));
        }
        if original_filename.trim().is_empty() {
            return Err(ArgusError::validation("original_filename must not be empty"));
        }
        if file_size < 0 {
            return Err(ArgusError::validation("file_size must not be negative"));
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let file_type = original_filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();

        Ok(Self {
            id,
            batch_id,
            filename: format!("{id}-{original_filename}"),
            original_filename: original_filename.to_string(),
            file_size,
            file_type,
            upload_time: now,
            storage_path: String::new(),
            storage_etag: String::new(),
            processing_status: ProcessingStatus::Pending,
            parse_duration_ms: None,
            record_count: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_storage(mut self, path: &str, etag: &str) -> Self {
        self.storage_path = path.to_string();
        self.storage_etag = etag.to_string();
        self
    }

    pub fn transition_to(&mut self, target: ProcessingStatus) -> ArgusResult<()> {
        if !self.processing_status.can_transition_to(target) {
            return Err(ArgusError::invalid_state(format!(
                "file {} cannot move from {} to {}",
                self.id, self.processing_status, target
            )));
        }
        self.processing_status = target;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> ArgusResult<()> {
        self.transition_to(ProcessingStatus::Failed)?;
        self.error_message = Some(reason.into());
        Ok(())
    }
}
