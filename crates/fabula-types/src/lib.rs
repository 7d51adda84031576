//! Shared types, errors, and story data model for the Fabula generation pipeline.
//!
//! This crate provides the foundational types used across all other Fabula crates:
//! - `FabulaError` — unified error taxonomy
//! - `SourceBook` — pre-segmented input text
//! - `StoryNode` / `StoryGraph` — the generated interactive story graph
//! - `WorldModel` — locations, characters, objects, items, and flags
//! - `StoryArtifact` — the final playable output
//! - `ValidationReport` — structural defects found and repaired

use serde::{Deserialize, Serialize};

/// Unified error type for all Fabula subsystems.
#[derive(Debug, thiserror::Error)]
pub enum FabulaError {
    // === Generation backend ===
    #[error("Rate limited by generation backend, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Network error talking to generation backend: {message}")]
    Network { message: String },

    #[error("Malformed generation output: {message}")]
    MalformedOutput { message: String },

    #[error("Authentication failed: {message}")]
    Auth { message: String },

    // === Cache ===
    #[error("Cache corruption: {detail}")]
    CacheCorruption { detail: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl FabulaError {
    /// Returns `true` if the error is transient and the operation may succeed
    /// on retry. Only rate limits qualify: malformed output and network
    /// failures are fatal to the task that hit them.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FabulaError::RateLimited { .. })
    }
}

/// A convenience alias for `Result<T, FabulaError>`.
pub type Result<T> = std::result::Result<T, FabulaError>;

// ---------------------------------------------------------------------------
// SourceBook — pre-segmented input text
// ---------------------------------------------------------------------------

/// A book that has already been split into ordered chapters by an external
/// extraction step. This is the sole input to the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceBook {
    pub title: String,
    pub author: String,
    pub chapters: Vec<BookChapter>,
}

/// One chapter of the source text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookChapter {
    pub id: String,
    pub number: u32,
    pub title: String,
    pub text: String,
}

// ---------------------------------------------------------------------------
// Story graph — nodes, interactions, and the closed kind sets
// ---------------------------------------------------------------------------

/// Kind of a story node. `Choice` and `Waypoint` nodes act as hubs that
/// backtracking edges point into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    Passage,
    Choice,
    Ending,
    Waypoint,
}

impl NodeKind {
    pub const ALL: [NodeKind; 4] = [
        NodeKind::Passage,
        NodeKind::Choice,
        NodeKind::Ending,
        NodeKind::Waypoint,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Passage => "passage",
            NodeKind::Choice => "choice",
            NodeKind::Ending => "ending",
            NodeKind::Waypoint => "waypoint",
        }
    }
}

/// Kind of a player interaction. This set is closed: the playback
/// interpreter understands exactly these and nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InteractionKind {
    Move,
    Examine,
    Take,
    Use,
    Talk,
    Choice,
    OnEnter,
}

impl InteractionKind {
    pub const ALL: [InteractionKind; 7] = [
        InteractionKind::Move,
        InteractionKind::Examine,
        InteractionKind::Take,
        InteractionKind::Use,
        InteractionKind::Talk,
        InteractionKind::Choice,
        InteractionKind::OnEnter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionKind::Move => "move",
            InteractionKind::Examine => "examine",
            InteractionKind::Take => "take",
            InteractionKind::Use => "use",
            InteractionKind::Talk => "talk",
            InteractionKind::Choice => "choice",
            InteractionKind::OnEnter => "onEnter",
        }
    }
}

/// Kind of a gating condition on an interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConditionKind {
    HasItem,
    MissingItem,
    FlagSet,
    FlagClear,
    Visited,
}

impl ConditionKind {
    pub const ALL: [ConditionKind; 5] = [
        ConditionKind::HasItem,
        ConditionKind::MissingItem,
        ConditionKind::FlagSet,
        ConditionKind::FlagClear,
        ConditionKind::Visited,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionKind::HasItem => "hasItem",
            ConditionKind::MissingItem => "missingItem",
            ConditionKind::FlagSet => "flagSet",
            ConditionKind::FlagClear => "flagClear",
            ConditionKind::Visited => "visited",
        }
    }
}

/// Kind of a state effect applied when an interaction fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EffectKind {
    SetFlag,
    ClearFlag,
    GiveItem,
    TakeItem,
}

impl EffectKind {
    pub const ALL: [EffectKind; 4] = [
        EffectKind::SetFlag,
        EffectKind::ClearFlag,
        EffectKind::GiveItem,
        EffectKind::TakeItem,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EffectKind::SetFlag => "setFlag",
            EffectKind::ClearFlag => "clearFlag",
            EffectKind::GiveItem => "giveItem",
            EffectKind::TakeItem => "takeItem",
        }
    }
}

/// A gate on an interaction. `key` names the item, flag, or node the
/// condition inspects, depending on `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub kind: ConditionKind,
    pub key: String,
}

/// A state mutation applied when an interaction fires. `key` names the flag
/// or item affected, depending on `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Effect {
    pub kind: EffectKind,
    pub key: String,
}

/// One thing the player can do at a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    pub id: String,
    pub kind: InteractionKind,
    pub label: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub effects: Vec<Effect>,
    /// Destination node for navigating interactions; `None` for purely
    /// local ones (examining an object, flipping a flag, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl Interaction {
    /// The node this interaction navigates to, if it navigates at all.
    /// Any kind may carry a target; an `onEnter` target is an automatic
    /// redirect and still counts as an edge.
    pub fn traversal_target(&self) -> Option<&str> {
        self.target.as_deref()
    }
}

/// A node of the story graph.
///
/// Connection entries are node ids after merge; during hierarchical
/// generation they may temporarily be symbolic port names, which the
/// connection resolver replaces exactly once. `narrative` and
/// `interactions` start empty and are filled in by the content stage,
/// then touched only by the validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryNode {
    pub id: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter: Option<String>,
    #[serde(default)]
    pub connections: Vec<String>,
    #[serde(default)]
    pub back_connections: Vec<String>,
    #[serde(default)]
    pub hints: Vec<String>,
    #[serde(default)]
    pub narrative: String,
    #[serde(default)]
    pub interactions: Vec<Interaction>,
}

impl StoryNode {
    /// Hubs are the nodes backtracking edges point into.
    pub fn is_hub(&self) -> bool {
        matches!(self.kind, NodeKind::Choice | NodeKind::Waypoint)
    }

    pub fn is_ending(&self) -> bool {
        self.kind == NodeKind::Ending
    }
}

// ---------------------------------------------------------------------------
// Plans — intermediate partition records for hierarchical generation
// ---------------------------------------------------------------------------

/// One act of the planned story arc. Produced by a single outline call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActPlan {
    pub id: String,
    pub number: u32,
    pub title: String,
    #[serde(default)]
    pub summary: String,
}

/// One chapter within an act. Each chapter is generated independently and
/// attaches to its neighbours only through the declared ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterPlan {
    pub id: String,
    pub act_id: String,
    pub number: u32,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub target_nodes: usize,
    /// Port names other chapters may connect *into*; each resolves to this
    /// chapter's first node.
    #[serde(default)]
    pub entry_ports: Vec<String>,
    /// Port names this chapter's nodes may connect *out* through.
    #[serde(default)]
    pub exit_ports: Vec<String>,
}

// ---------------------------------------------------------------------------
// World — summary and world model stages
// ---------------------------------------------------------------------------

/// Output of the summary stage: a compressed view of the source text that
/// later prompts build on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorySummary {
    pub synopsis: String,
    #[serde(default)]
    pub themes: Vec<String>,
    #[serde(default)]
    pub key_events: Vec<String>,
}

/// A place nodes can be set in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// A person the player can encounter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Character {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// A fixed scenery object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldObject {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// A portable item the player can carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// A named boolean flag with its starting value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDefinition {
    pub name: String,
    #[serde(default)]
    pub initial: bool,
    #[serde(default)]
    pub description: String,
}

/// Output of the world stage: everything the story graph refers to by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldModel {
    #[serde(default)]
    pub locations: Vec<Location>,
    #[serde(default)]
    pub characters: Vec<Character>,
    #[serde(default)]
    pub objects: Vec<WorldObject>,
    #[serde(default)]
    pub items: Vec<Item>,
    #[serde(default)]
    pub variable_definitions: Vec<VariableDefinition>,
    #[serde(default)]
    pub initial_inventory: Vec<String>,
}

// ---------------------------------------------------------------------------
// StoryGraph — merged graph plus act/chapter grouping
// ---------------------------------------------------------------------------

/// Chapter grouping inside the final graph. Purely organisational; playback
/// never consults it, but repair scoring and tooling do.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterGroup {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub node_ids: Vec<String>,
}

/// Act grouping inside the final graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActGroup {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub chapters: Vec<ChapterGroup>,
}

/// The assembled story graph. Flat generation produces a single synthetic
/// act and chapter; hierarchical generation produces the real structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryGraph {
    pub start_node_id: String,
    pub nodes: Vec<StoryNode>,
    #[serde(default)]
    pub acts: Vec<ActGroup>,
}

impl StoryGraph {
    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&StoryNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

// ---------------------------------------------------------------------------
// StoryArtifact — the final playable output
// ---------------------------------------------------------------------------

/// Provenance header of the artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMeta {
    pub title: String,
    pub author: String,
    pub version: String,
    pub target_node_count: usize,
    /// Taken from the cache manifest's creation time so that a warm re-run
    /// reproduces the artifact byte for byte.
    pub generated_at: chrono::DateTime<chrono::Utc>,
}

/// Player state at the very first node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialState {
    pub start_node_id: String,
    #[serde(default)]
    pub inventory: Vec<String>,
    #[serde(default)]
    pub flags: std::collections::BTreeMap<String, bool>,
}

/// The complete generated story, ready for a playback interpreter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryArtifact {
    pub meta: ArtifactMeta,
    pub initial_state: InitialState,
    pub nodes: Vec<StoryNode>,
    #[serde(default)]
    pub locations: Vec<Location>,
    #[serde(default)]
    pub objects: Vec<WorldObject>,
    #[serde(default)]
    pub characters: Vec<Character>,
    #[serde(default)]
    pub items: Vec<Item>,
    #[serde(default)]
    pub variable_definitions: Vec<VariableDefinition>,
}

// ---------------------------------------------------------------------------
// ValidationReport — accumulated defects, repairs, and coverage
// ---------------------------------------------------------------------------

/// One finding of the validator: a defect, an anomaly, or an applied repair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub rule: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

/// Coverage tallies over the closed interaction, condition, and effect
/// kind sets, plus aggregate graph counts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageStats {
    pub node_count: usize,
    pub ending_count: usize,
    pub hub_count: usize,
    pub interaction_count: usize,
    #[serde(default)]
    pub interaction_kinds: std::collections::BTreeMap<String, usize>,
    #[serde(default)]
    pub condition_kinds: std::collections::BTreeMap<String, usize>,
    #[serde(default)]
    pub effect_kinds: std::collections::BTreeMap<String, usize>,
}

/// What the validator found and did. Errors are defects it could not
/// repair; fixes are repairs it applied; warnings are advisory. The report
/// is recomputed every run and never treated as persistent state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub fixes: Vec<ValidationIssue>,
    pub stats: CoverageStats,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(&mut self, rule: &str, message: impl Into<String>, node_id: Option<&str>) {
        self.errors.push(ValidationIssue {
            rule: rule.to_string(),
            message: message.into(),
            node_id: node_id.map(String::from),
        });
    }

    pub fn warning(&mut self, rule: &str, message: impl Into<String>, node_id: Option<&str>) {
        self.warnings.push(ValidationIssue {
            rule: rule.to_string(),
            message: message.into(),
            node_id: node_id.map(String::from),
        });
    }

    pub fn fix(&mut self, rule: &str, message: impl Into<String>, node_id: Option<&str>) {
        self.fixes.push(ValidationIssue {
            rule: rule.to_string(),
            message: message.into(),
            node_id: node_id.map(String::from),
        });
    }

    /// `true` when no unrepairable defects remain.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}
