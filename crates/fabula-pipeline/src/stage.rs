//! Stage identifiers and cache keys.
//!
//! The pipeline runs a fixed sequence of stages; the hierarchical graph
//! sub-stages sit between `World` and `Graph` so that downstream
//! invalidation can treat them uniformly.  Declaration order *is* the
//! invalidation order: writing a stage wipes everything strictly after it.

use std::fmt;

/// One step of the generation pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Summary,
    World,
    Acts,
    Chapters,
    Scenes,
    Graph,
    Content,
    Enrichment,
    Validation,
}

impl Stage {
    /// Every stage, in pipeline order.
    pub const ORDER: [Stage; 9] = [
        Stage::Summary,
        Stage::World,
        Stage::Acts,
        Stage::Chapters,
        Stage::Scenes,
        Stage::Graph,
        Stage::Content,
        Stage::Enrichment,
        Stage::Validation,
    ];

    /// Manifest and file-name identifier for this stage.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Summary => "summary",
            Stage::World => "world",
            Stage::Acts => "acts",
            Stage::Chapters => "chapters",
            Stage::Scenes => "scenes",
            Stage::Graph => "graph",
            Stage::Content => "content",
            Stage::Enrichment => "enrichment",
            Stage::Validation => "validation",
        }
    }

    /// Stages strictly after this one in pipeline order.
    pub fn later_stages(self) -> impl Iterator<Item = Stage> {
        Stage::ORDER.into_iter().filter(move |stage| *stage > self)
    }

    /// Cache key for a single-valued stage artifact.
    pub fn key(self) -> StageKey {
        StageKey::Single(self)
    }

    /// Cache key for one partition of a partitioned stage.
    pub fn partition(self, partition: impl Into<String>) -> StageKey {
        StageKey::Partitioned(self, partition.into())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifies one cached artifact: a whole stage, or one partition of a
/// partitioned stage (per act, per chapter, per content batch).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StageKey {
    Single(Stage),
    Partitioned(Stage, String),
}

impl StageKey {
    pub fn stage(&self) -> Stage {
        match self {
            StageKey::Single(stage) => *stage,
            StageKey::Partitioned(stage, _) => *stage,
        }
    }

    pub fn partition(&self) -> Option<&str> {
        match self {
            StageKey::Single(_) => None,
            StageKey::Partitioned(_, partition) => Some(partition),
        }
    }

    /// File name of the backing artifact, e.g. `world.data` or
    /// `scenes_ch-2.data`.  Partition names are sanitized so a generated id
    /// can never escape the cache directory.
    pub fn file_name(&self) -> String {
        match self {
            StageKey::Single(stage) => format!("{}.data", stage.name()),
            StageKey::Partitioned(stage, partition) => {
                format!("{}_{}.data", stage.name(), sanitize(partition))
            }
        }
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKey::Single(stage) => f.write_str(stage.name()),
            StageKey::Partitioned(stage, partition) => {
                write!(f, "{}[{}]", stage.name(), partition)
            }
        }
    }
}

fn sanitize(partition: &str) -> String {
    partition
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declaration_order_is_invalidation_order() {
        assert!(Stage::Summary < Stage::World);
        assert!(Stage::World < Stage::Acts);
        assert!(Stage::Acts < Stage::Chapters);
        assert!(Stage::Chapters < Stage::Scenes);
        assert!(Stage::Scenes < Stage::Graph);
        assert!(Stage::Graph < Stage::Content);
        assert!(Stage::Content < Stage::Enrichment);
        assert!(Stage::Enrichment < Stage::Validation);
    }

    #[test]
    fn later_stages_excludes_self_and_earlier() {
        let later: Vec<Stage> = Stage::World.later_stages().collect();
        assert_eq!(later.first(), Some(&Stage::Acts));
        assert_eq!(later.last(), Some(&Stage::Validation));
        assert!(!later.contains(&Stage::Summary));
        assert!(!later.contains(&Stage::World));

        assert_eq!(Stage::Validation.later_stages().count(), 0);
    }

    #[test]
    fn file_names() {
        assert_eq!(Stage::World.key().file_name(), "world.data");
        assert_eq!(
            Stage::Scenes.partition("ch-2").file_name(),
            "scenes_ch-2.data"
        );
        assert_eq!(
            Stage::Content.partition("batch-000").file_name(),
            "content_batch-000.data"
        );
    }

    #[test]
    fn partition_names_are_sanitized() {
        let key = Stage::Scenes.partition("../evil chapter");
        assert_eq!(key.file_name(), "scenes_---evil-chapter.data");
    }

    #[test]
    fn display_forms() {
        assert_eq!(Stage::Summary.key().to_string(), "summary");
        assert_eq!(
            Stage::Chapters.partition("act-1").to_string(),
            "chapters[act-1]"
        );
    }

    #[test]
    fn key_accessors() {
        let key = Stage::Content.partition("batch-003");
        assert_eq!(key.stage(), Stage::Content);
        assert_eq!(key.partition(), Some("batch-003"));
        assert_eq!(Stage::Graph.key().partition(), None);
    }
}
