//! Merge independently generated chapter sub-graphs into one navigable
//! graph.
//!
//! Chapters are produced in parallel and out of order, connected only by
//! symbolic port names.  The resolver flattens them in chapter order,
//! renames id collisions, resolves every port reference exactly once, and
//! injects backtracking edges toward hubs.  It is pure: same inputs, same
//! graph.  The engine therefore recomputes it on every run instead of
//! caching it, so a merge fix never forces regeneration of the expensive
//! upstream sub-graphs.

use std::collections::{HashMap, HashSet};

use fabula_types::{ActGroup, ActPlan, ChapterGroup, ChapterPlan, StoryGraph, StoryNode};

/// The port the first playable node is published under.  Declared by the
/// opening chapter; if nobody declared it, the first merged node starts.
pub const START_PORT: &str = "game-start";

/// What happened during a merge.  Resolution is total: problems are
/// reported here and left for the validator, never thrown.
#[derive(Debug, Clone, Default)]
pub struct ResolveReport {
    /// Port names declared by more than one chapter.  The first declaration
    /// won; later ones were ignored.
    pub duplicate_ports: Vec<String>,
    /// Connection entries (`"<node> -> <entry>"`) matching neither a node id
    /// nor a declared port.
    pub unresolved: Vec<String>,
    /// Nodes renamed to keep ids unique, as `(old, new)` pairs.
    pub renamed: Vec<(String, String)>,
    /// Backtracking edges injected toward hubs.
    pub injected_back_edges: usize,
}

/// Merge per-chapter node lists into a single [`StoryGraph`].
///
/// `chapter_nodes` pairs each chapter id with its generated nodes, in
/// chapter order.
pub fn resolve(
    acts: &[ActPlan],
    chapters: &[ChapterPlan],
    chapter_nodes: &[(String, Vec<StoryNode>)],
) -> (StoryGraph, ResolveReport) {
    let mut report = ResolveReport::default();

    // 1. Flatten in chapter order, renaming colliding ids and tagging
    //    chapter membership.  References between siblings in the renaming
    //    chapter follow the rename; the earlier claimant keeps the id.
    let mut seen: HashSet<String> = HashSet::new();
    let mut merged: Vec<StoryNode> = Vec::new();
    let mut first_node_of: HashMap<String, String> = HashMap::new();

    for (chapter_id, nodes) in chapter_nodes {
        let mut renames: HashMap<String, String> = HashMap::new();
        let mut chapter_merged: Vec<StoryNode> = Vec::with_capacity(nodes.len());

        for node in nodes {
            let mut node = node.clone();
            if seen.contains(&node.id) {
                let mut suffix = 2;
                let mut candidate = format!("{}-dup{suffix}", node.id);
                while seen.contains(&candidate) {
                    suffix += 1;
                    candidate = format!("{}-dup{suffix}", node.id);
                }
                report.renamed.push((node.id.clone(), candidate.clone()));
                renames.insert(node.id.clone(), candidate.clone());
                node.id = candidate;
            }
            seen.insert(node.id.clone());
            node.chapter = Some(chapter_id.clone());
            chapter_merged.push(node);
        }

        if !renames.is_empty() {
            for node in &mut chapter_merged {
                for entry in node.connections.iter_mut().chain(node.back_connections.iter_mut()) {
                    if let Some(renamed) = renames.get(entry) {
                        *entry = renamed.clone();
                    }
                }
            }
        }

        if let Some(first) = chapter_merged.first() {
            first_node_of.insert(chapter_id.clone(), first.id.clone());
        }
        merged.extend(chapter_merged);
    }

    // 2. Port map: each chapter's entry ports resolve to its first node.
    //    First declaration wins; duplicates are reported.
    let mut ports: HashMap<String, String> = HashMap::new();
    for chapter in chapters {
        let Some(first) = first_node_of.get(&chapter.id) else {
            continue;
        };
        for port in &chapter.entry_ports {
            if ports.contains_key(port) {
                report.duplicate_ports.push(port.clone());
                tracing::warn!(
                    port = %port,
                    chapter = %chapter.id,
                    "Duplicate entry port, keeping the first declaration"
                );
            } else {
                ports.insert(port.clone(), first.clone());
            }
        }
    }

    // 3. Rewrite connection entries: ids stay, ports resolve, anything else
    //    is left in place for the validator to scrub.
    let ids: HashSet<String> = merged.iter().map(|n| n.id.clone()).collect();
    for node in &mut merged {
        let node_id = node.id.clone();
        for entry in node.connections.iter_mut().chain(node.back_connections.iter_mut()) {
            if ids.contains(entry.as_str()) {
                continue;
            }
            match ports.get(entry) {
                Some(target) => *entry = target.clone(),
                None => report.unresolved.push(format!("{node_id} -> {entry}")),
            }
        }
    }

    // 4. Backtracking: every non-ending, non-hub node with no way back gets
    //    one edge toward a hub, preferring one in its own location.
    let hubs: Vec<(String, String)> = merged
        .iter()
        .filter(|n| n.is_hub())
        .map(|n| (n.id.clone(), n.location.clone()))
        .collect();
    for node in &mut merged {
        if node.is_ending() || node.is_hub() || !node.back_connections.is_empty() {
            continue;
        }
        let hub = hubs
            .iter()
            .find(|(_, location)| !node.location.is_empty() && *location == node.location)
            .or_else(|| hubs.first());
        if let Some((hub_id, _)) = hub {
            node.back_connections.push(hub_id.clone());
            report.injected_back_edges += 1;
        }
    }

    // 5. Start node, then the act/chapter grouping.
    let start_node_id = ports
        .get(START_PORT)
        .cloned()
        .or_else(|| merged.first().map(|n| n.id.clone()))
        .unwrap_or_default();

    let act_groups: Vec<ActGroup> = acts
        .iter()
        .map(|act| ActGroup {
            id: act.id.clone(),
            title: act.title.clone(),
            chapters: chapters
                .iter()
                .filter(|c| c.act_id == act.id)
                .map(|c| ChapterGroup {
                    id: c.id.clone(),
                    title: c.title.clone(),
                    node_ids: merged
                        .iter()
                        .filter(|n| n.chapter.as_deref() == Some(c.id.as_str()))
                        .map(|n| n.id.clone())
                        .collect(),
                })
                .collect(),
        })
        .collect();

    let graph = StoryGraph { start_node_id, nodes: merged, acts: act_groups };
    (graph, report)
}
