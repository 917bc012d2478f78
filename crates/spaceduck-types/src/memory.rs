use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Memory kind - what shape of knowledge a write represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Episode,
    Fact,
    Preference,
    Insight,
}

/// Visibility scope of a memory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryScope {
    Global,
    Conversation,
    Channel,
}

/// Provenance of a memory write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySource {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl MemorySource {
    pub fn system_task(task_id: impl Into<String>) -> Self {
        Self {
            source_type: "system".to_string(),
            task_id: Some(task_id.into()),
        }
    }
}

/// Request to store a memory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryWriteInput {
    pub kind: MemoryKind,
    pub title: String,
    pub content: String,
    pub scope: MemoryScope,
    pub source: MemorySource,
    #[serde(default)]
    pub tags: Vec<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryWriteResult {
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_task_source_carries_provenance() {
        let source = MemorySource::system_task("t-1");
        let raw = serde_json::to_value(&source).expect("serialize");
        assert_eq!(raw["type"], "system");
        assert_eq!(raw["taskId"], "t-1");
    }
}
