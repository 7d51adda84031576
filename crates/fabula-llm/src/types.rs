//! Request and response types for generation calls.

use serde::{Deserialize, Serialize};

/// Which pipeline task a generation request serves. Partitioned tasks carry
/// their partition identity so logs and scripted test backends can tell
/// sibling calls apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskKind {
    Summary,
    World,
    FlatGraph,
    ActOutline,
    ChapterPlanning { act_id: String },
    SceneGeneration { chapter_id: String },
    ContentBatch { index: usize },
    Enrichment,
}

impl TaskKind {
    /// Short label for logs and progress output.
    pub fn label(&self) -> String {
        match self {
            TaskKind::Summary => "summary".into(),
            TaskKind::World => "world".into(),
            TaskKind::FlatGraph => "graph".into(),
            TaskKind::ActOutline => "acts".into(),
            TaskKind::ChapterPlanning { act_id } => format!("chapters[{act_id}]"),
            TaskKind::SceneGeneration { chapter_id } => format!("scenes[{chapter_id}]"),
            TaskKind::ContentBatch { index } => format!("content[batch-{index:03}]"),
            TaskKind::Enrichment => "enrichment".into(),
        }
    }
}

/// A single generation call. `system` frames the model's role; `prompt`
/// carries the task description and any embedded context JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub kind: TaskKind,
    pub system: String,
    pub prompt: String,
}

impl GenerationRequest {
    pub fn new(kind: TaskKind, system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            kind,
            system: system.into(),
            prompt: prompt.into(),
        }
    }
}

/// Token usage reported by the backend for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// The parsed result of a generation call. `json` is the payload the model
/// produced, after fence stripping and JSON parsing.
#[derive(Debug, Clone)]
pub struct GenerationResponse {
    pub json: serde_json::Value,
    pub model: String,
    pub usage: Usage,
}
