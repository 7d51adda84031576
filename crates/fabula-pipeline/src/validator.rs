//! Structural validation and deterministic repair of the merged graph.
//!
//! Upstream generation is non-deterministic and unreliable, so the graph
//! that reaches this point may contain dangling references, declared edges
//! with no interaction behind them, and unreachable regions.  Pass A fixes
//! what has a safe deterministic repair and downgrades the rest to
//! warnings; pass B tallies feature coverage without fixing anything.
//! Repair converges: a second run over repaired output applies zero fixes.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use fabula_types::{
    ConditionKind, CoverageStats, EffectKind, Interaction, InteractionKind, StoryGraph,
    StoryNode, ValidationReport,
};

/// A node already carrying this many outgoing traversal interactions is not
/// asked to absorb reconnected orphans.
pub const MAX_OUTGOING_TRAVERSALS: usize = 6;

/// Validate `graph` in place, repairing what can be repaired.
///
/// Unrepairable defects (an empty graph, a missing start node) are recorded
/// as errors and abort the pass; everything else lands in the returned
/// report as a fix or a warning.
pub fn validate_and_repair(graph: &mut StoryGraph) -> ValidationReport {
    let mut report = ValidationReport::new();

    if graph.nodes.is_empty() {
        report.error("empty-graph", "graph has no nodes", None);
        return report;
    }
    let ids: HashSet<String> = graph.nodes.iter().map(|n| n.id.clone()).collect();
    if !ids.contains(&graph.start_node_id) {
        report.error(
            "missing-start",
            format!("start node '{}' does not exist", graph.start_node_id),
            None,
        );
        return report;
    }

    scrub_connections(graph, &ids, &mut report);
    retarget_dangling_interactions(graph, &ids, &mut report);
    synthesize_traversals(graph, &mut report);
    reconnect_orphans(graph, &mut report);
    tally_coverage(graph, &mut report);

    report
}

// ---------------------------------------------------------------------------
// Pass A — structural repairs, in deterministic node order
// ---------------------------------------------------------------------------

/// Drop connection entries that name no existing node.  The resolver leaves
/// unresolvable entries in place; this is where they are dropped and
/// reported.
fn scrub_connections(graph: &mut StoryGraph, ids: &HashSet<String>, report: &mut ValidationReport) {
    for node in &mut graph.nodes {
        let node_id = node.id.clone();
        for (label, list) in [
            ("connection", &mut node.connections),
            ("back-connection", &mut node.back_connections),
        ] {
            list.retain(|entry| {
                if ids.contains(entry) {
                    true
                } else {
                    report.fix(
                        "dangling-connection",
                        format!("dropped {label} to missing '{entry}'"),
                        Some(&node_id),
                    );
                    false
                }
            });
        }
    }
}

/// Rewrite interaction targets that name no existing node to the first
/// ending node; without any ending to fall back on, warn and leave them.
fn retarget_dangling_interactions(
    graph: &mut StoryGraph,
    ids: &HashSet<String>,
    report: &mut ValidationReport,
) {
    let fallback = graph.nodes.iter().find(|n| n.is_ending()).map(|n| n.id.clone());
    for node in &mut graph.nodes {
        let node_id = node.id.clone();
        for interaction in &mut node.interactions {
            let Some(target) = interaction.target.clone() else {
                continue;
            };
            if ids.contains(&target) {
                continue;
            }
            match &fallback {
                Some(ending) => {
                    report.fix(
                        "dangling-interaction",
                        format!(
                            "retargeted '{}' from missing '{target}' to ending '{ending}'",
                            interaction.id
                        ),
                        Some(&node_id),
                    );
                    interaction.target = Some(ending.clone());
                }
                None => report.warning(
                    "dangling-interaction",
                    format!(
                        "interaction '{}' targets missing '{target}' and no ending exists",
                        interaction.id
                    ),
                    Some(&node_id),
                ),
            }
        }
    }
}

/// Ensure every declared edge (forward and back) has an interaction a
/// player can actually take.  Edges covered by any existing interaction
/// targeting the same node are left alone.
fn synthesize_traversals(graph: &mut StoryGraph, report: &mut ValidationReport) {
    for node in &mut graph.nodes {
        let node_id = node.id.clone();
        let edges: Vec<(String, &'static str)> = node
            .connections
            .iter()
            .map(|t| (t.clone(), "Continue"))
            .chain(node.back_connections.iter().map(|t| (t.clone(), "Go back")))
            .collect();
        for (target, label) in edges {
            let covered = node
                .interactions
                .iter()
                .any(|i| i.traversal_target() == Some(target.as_str()));
            if covered {
                continue;
            }
            node.interactions.push(Interaction {
                id: format!("{node_id}-go-{target}"),
                kind: InteractionKind::Move,
                label: label.to_string(),
                conditions: vec![],
                effects: vec![],
                target: Some(target.clone()),
            });
            report.fix(
                "missing-traversal",
                format!("added a move interaction for the declared edge to '{target}'"),
                Some(&node_id),
            );
        }
    }
}

/// Reconnect nodes nothing navigates into.  Runs after synthesis, so every
/// declared edge is already an interaction and orphanhood is judged purely
/// on incoming interaction targets (self-loops excluded).
fn reconnect_orphans(graph: &mut StoryGraph, report: &mut ValidationReport) {
    let reachable = reachable_from_start(graph);

    let orphan_ids: Vec<String> = {
        let mut incoming: HashMap<String, usize> = HashMap::new();
        for node in &graph.nodes {
            for interaction in &node.interactions {
                if let Some(target) = interaction.traversal_target() {
                    if target != node.id {
                        *incoming.entry(target.to_string()).or_insert(0) += 1;
                    }
                }
            }
        }
        graph
            .nodes
            .iter()
            .filter(|n| n.id != graph.start_node_id)
            .filter(|n| incoming.get(n.id.as_str()).copied().unwrap_or(0) == 0)
            .map(|n| n.id.clone())
            .collect()
    };

    for orphan_id in orphan_ids {
        let Some(orphan) = graph.node(&orphan_id).cloned() else {
            continue;
        };
        let mut best: Option<(i32, usize)> = None;
        for (index, candidate) in graph.nodes.iter().enumerate() {
            if candidate.id == orphan_id || candidate.is_ending() {
                continue;
            }
            let outgoing = candidate
                .interactions
                .iter()
                .filter(|i| i.traversal_target().is_some())
                .count();
            if outgoing >= MAX_OUTGOING_TRAVERSALS {
                continue;
            }
            let score = reconnection_score(candidate, &orphan, &reachable);
            // Strict > keeps the earliest node on ties.
            let better = match best {
                None => true,
                Some((best_score, _)) => score > best_score,
            };
            if better {
                best = Some((score, index));
            }
        }
        match best {
            Some((_, index)) => {
                let source_id = graph.nodes[index].id.clone();
                graph.nodes[index].interactions.push(Interaction {
                    id: format!("{source_id}-go-{orphan_id}"),
                    kind: InteractionKind::Move,
                    label: "Continue".to_string(),
                    conditions: vec![],
                    effects: vec![],
                    target: Some(orphan_id.clone()),
                });
                if !graph.nodes[index].connections.contains(&orphan_id) {
                    graph.nodes[index].connections.push(orphan_id.clone());
                }
                report.fix(
                    "orphan-reconnected",
                    format!("connected unreachable '{orphan_id}' from '{source_id}'"),
                    Some(&orphan_id),
                );
            }
            None => report.warning(
                "orphan-unreachable",
                format!("no eligible node can reach '{orphan_id}'"),
                Some(&orphan_id),
            ),
        }
    }
}

/// Score a candidate predecessor for adopting an orphan.  Pure, so
/// tie-break behavior is reproducible and directly testable.
pub fn reconnection_score(
    candidate: &StoryNode,
    orphan: &StoryNode,
    reachable: &HashSet<String>,
) -> i32 {
    let mut score = 0;
    if candidate.chapter.is_some() && candidate.chapter == orphan.chapter {
        score += 10;
    }
    if !candidate.location.is_empty() && candidate.location == orphan.location {
        score += 5;
    }
    let candidate_targets: HashSet<&str> = candidate
        .interactions
        .iter()
        .filter_map(|i| i.traversal_target())
        .collect();
    let orphan_targets: HashSet<&str> = orphan
        .interactions
        .iter()
        .filter_map(|i| i.traversal_target())
        .collect();
    score += 3 * candidate_targets.intersection(&orphan_targets).count() as i32;
    if reachable.contains(candidate.id.as_str()) {
        score += 2;
    }
    score
}

/// Node ids reachable from the start by following interaction targets.
/// Computed once, before any orphan edits.
fn reachable_from_start(graph: &StoryGraph) -> HashSet<String> {
    let by_id: HashMap<&str, &StoryNode> =
        graph.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    let mut seen: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    if by_id.contains_key(graph.start_node_id.as_str()) {
        seen.insert(graph.start_node_id.clone());
        queue.push_back(graph.start_node_id.as_str());
    }
    while let Some(id) = queue.pop_front() {
        let Some(node) = by_id.get(id) else {
            continue;
        };
        for interaction in &node.interactions {
            if let Some(target) = interaction.traversal_target() {
                if by_id.contains_key(target) && seen.insert(target.to_string()) {
                    queue.push_back(target);
                }
            }
        }
    }
    seen
}

// ---------------------------------------------------------------------------
// Pass B — coverage bookkeeping, non-fixing
// ---------------------------------------------------------------------------

fn tally_coverage(graph: &StoryGraph, report: &mut ValidationReport) {
    let mut interaction_kinds: BTreeMap<String, usize> =
        InteractionKind::ALL.iter().map(|k| (k.as_str().to_string(), 0)).collect();
    let mut condition_kinds: BTreeMap<String, usize> =
        ConditionKind::ALL.iter().map(|k| (k.as_str().to_string(), 0)).collect();
    let mut effect_kinds: BTreeMap<String, usize> =
        EffectKind::ALL.iter().map(|k| (k.as_str().to_string(), 0)).collect();

    let mut interaction_count = 0usize;
    for node in &graph.nodes {
        for interaction in &node.interactions {
            interaction_count += 1;
            if let Some(count) = interaction_kinds.get_mut(interaction.kind.as_str()) {
                *count += 1;
            }
            for condition in &interaction.conditions {
                if let Some(count) = condition_kinds.get_mut(condition.kind.as_str()) {
                    *count += 1;
                }
            }
            for effect in &interaction.effects {
                if let Some(count) = effect_kinds.get_mut(effect.kind.as_str()) {
                    *count += 1;
                }
            }
        }
    }

    for (kind, count) in &interaction_kinds {
        if *count == 0 {
            report.warning("coverage", format!("no {kind} interactions generated"), None);
        }
    }
    for (kind, count) in &condition_kinds {
        if *count == 0 {
            report.warning("coverage", format!("no {kind} conditions used"), None);
        }
    }
    for (kind, count) in &effect_kinds {
        if *count == 0 {
            report.warning("coverage", format!("no {kind} effects used"), None);
        }
    }

    let ending_count = graph.nodes.iter().filter(|n| n.is_ending()).count();
    if ending_count == 0 {
        report.warning("coverage", "graph has no ending nodes", None);
    }

    report.stats = CoverageStats {
        node_count: graph.nodes.len(),
        ending_count,
        hub_count: graph.nodes.iter().filter(|n| n.is_hub()).count(),
        interaction_count,
        interaction_kinds,
        condition_kinds,
        effect_kinds,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabula_types::NodeKind;

    fn node(id: &str, kind: NodeKind, location: &str) -> StoryNode {
        StoryNode {
            id: id.into(),
            kind,
            location: location.into(),
            chapter: None,
            connections: vec![],
            back_connections: vec![],
            hints: vec![],
            narrative: String::new(),
            interactions: vec![],
        }
    }

    fn movement(id: &str, target: &str) -> Interaction {
        Interaction {
            id: id.into(),
            kind: InteractionKind::Move,
            label: "Continue".into(),
            conditions: vec![],
            effects: vec![],
            target: Some(target.into()),
        }
    }

    fn graph(start: &str, nodes: Vec<StoryNode>) -> StoryGraph {
        StoryGraph {
            start_node_id: start.into(),
            nodes,
            acts: vec![],
        }
    }

    fn fixes_with_rule<'a>(report: &'a ValidationReport, rule: &str) -> Vec<&'a str> {
        report
            .fixes
            .iter()
            .filter(|f| f.rule == rule)
            .map(|f| f.node_id.as_deref().unwrap_or(""))
            .collect()
    }

    // --- unrepairable errors ---

    #[test]
    fn empty_graph_is_an_error() {
        let mut g = graph("start", vec![]);
        let report = validate_and_repair(&mut g);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].rule, "empty-graph");
        assert!(report.fixes.is_empty());
    }

    #[test]
    fn missing_start_is_an_error() {
        let mut g = graph("nowhere", vec![node("a", NodeKind::Passage, "x")]);
        let report = validate_and_repair(&mut g);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].rule, "missing-start");
    }

    // --- pass A repairs ---

    #[test]
    fn dangling_connections_are_dropped_and_reported() {
        let mut a = node("a", NodeKind::Passage, "x");
        a.connections = vec!["ghost".into(), "b".into()];
        a.back_connections = vec!["phantom".into()];
        let b = node("b", NodeKind::Ending, "x");

        let mut g = graph("a", vec![a, b]);
        let report = validate_and_repair(&mut g);

        assert_eq!(g.node("a").unwrap().connections, vec!["b".to_string()]);
        assert!(g.node("a").unwrap().back_connections.is_empty());
        assert_eq!(fixes_with_rule(&report, "dangling-connection"), vec!["a", "a"]);
    }

    #[test]
    fn dangling_interaction_targets_fall_back_to_the_first_ending() {
        let mut a = node("a", NodeKind::Passage, "x");
        a.connections = vec!["end".into()];
        a.interactions = vec![movement("a-go-end", "end"), movement("a-go-ghost", "ghost")];
        let end = node("end", NodeKind::Ending, "x");

        let mut g = graph("a", vec![a, end]);
        let report = validate_and_repair(&mut g);

        let a = g.node("a").unwrap();
        assert_eq!(a.interactions[1].target.as_deref(), Some("end"));
        assert_eq!(fixes_with_rule(&report, "dangling-interaction"), vec!["a"]);
    }

    #[test]
    fn dangling_interaction_without_any_ending_becomes_a_warning() {
        let mut a = node("a", NodeKind::Passage, "x");
        a.connections = vec!["b".into()];
        a.interactions = vec![movement("a-go-b", "b"), movement("a-go-ghost", "ghost")];
        let mut b = node("b", NodeKind::Passage, "x");
        b.back_connections = vec!["a".into()];

        let mut g = graph("a", vec![a, b]);
        let report = validate_and_repair(&mut g);

        // Target untouched, downgraded to a warning.
        assert_eq!(g.node("a").unwrap().interactions[1].target.as_deref(), Some("ghost"));
        assert!(report
            .warnings
            .iter()
            .any(|w| w.rule == "dangling-interaction" && w.node_id.as_deref() == Some("a")));
    }

    #[test]
    fn declared_edges_get_synthesized_move_interactions() {
        let mut a = node("a", NodeKind::Passage, "x");
        a.connections = vec!["b".into()];
        a.back_connections = vec!["hub".into()];
        let b = node("b", NodeKind::Ending, "x");
        let mut hub = node("hub", NodeKind::Choice, "x");
        hub.connections = vec!["a".into()];

        let mut g = graph("hub", vec![hub, a, b]);
        let report = validate_and_repair(&mut g);

        let a = g.node("a").unwrap();
        assert!(a.interactions.iter().any(|i| i.id == "a-go-b" && i.label == "Continue"));
        assert!(a.interactions.iter().any(|i| i.id == "a-go-hub" && i.label == "Go back"));
        assert_eq!(report.fixes.iter().filter(|f| f.rule == "missing-traversal").count(), 3);
    }

    #[test]
    fn covered_edges_are_not_synthesized_again() {
        let mut a = node("a", NodeKind::Passage, "x");
        a.connections = vec!["b".into()];
        a.interactions = vec![movement("walk", "b")];
        let b = node("b", NodeKind::Ending, "x");

        let mut g = graph("a", vec![a, b]);
        let report = validate_and_repair(&mut g);

        assert_eq!(g.node("a").unwrap().interactions.len(), 1);
        assert!(fixes_with_rule(&report, "missing-traversal").is_empty());
    }

    // --- orphan reconnection ---

    #[test]
    fn three_node_graph_reconnects_the_orphan() {
        // start -> a -> end, with b unreachable.  b shares a's location, so
        // a outscores start (5 + 2 vs 2) and adopts the orphan.
        let mut start = node("start", NodeKind::Choice, "club");
        start.connections = vec!["a".into()];
        let mut a = node("a", NodeKind::Passage, "dock");
        a.connections = vec!["end".into()];
        let end = node("end", NodeKind::Ending, "sea");
        let b = node("b", NodeKind::Passage, "dock");

        let mut g = graph("start", vec![start, a, end, b]);
        let report = validate_and_repair(&mut g);

        assert_eq!(fixes_with_rule(&report, "orphan-reconnected"), vec!["b"]);
        let incoming: Vec<&str> = g
            .nodes
            .iter()
            .flat_map(|n| n.interactions.iter().map(move |i| (n.id.as_str(), i)))
            .filter(|(_, i)| i.traversal_target() == Some("b"))
            .map(|(id, _)| id)
            .collect();
        assert_eq!(incoming, vec!["a"]);

        // Convergence: a second run repairs nothing further.
        let second = validate_and_repair(&mut g);
        assert!(second.fixes.is_empty());
    }

    #[test]
    fn tie_breaks_fall_to_the_earliest_node() {
        let mut start = node("start", NodeKind::Choice, "club");
        start.connections = vec!["a".into()];
        let mut a = node("a", NodeKind::Passage, "sea");
        a.connections = vec!["end".into()];
        let end = node("end", NodeKind::Ending, "sea");
        // No location or chapter overlap anywhere: start and a tie at +2.
        let b = node("b", NodeKind::Passage, "desert");

        let mut g = graph("start", vec![start, a, end, b]);
        validate_and_repair(&mut g);

        assert!(g.node("start").unwrap().interactions.iter().any(|i| i.traversal_target() == Some("b")));
    }

    #[test]
    fn saturated_candidates_are_skipped() {
        let mut start = node("start", NodeKind::Choice, "x");
        start.connections = vec!["end".into()];
        start.interactions = (0..MAX_OUTGOING_TRAVERSALS)
            .map(|i| movement(&format!("m{i}"), "end"))
            .collect();
        let end = node("end", NodeKind::Ending, "x");
        let orphan = node("lost", NodeKind::Passage, "x");

        let mut g = graph("start", vec![start, end, orphan]);
        let report = validate_and_repair(&mut g);

        // The only non-ending candidate is saturated, so the orphan stays
        // disconnected and is downgraded to a warning.
        assert!(fixes_with_rule(&report, "orphan-reconnected").is_empty());
        assert!(report
            .warnings
            .iter()
            .any(|w| w.rule == "orphan-unreachable" && w.node_id.as_deref() == Some("lost")));
    }

    #[test]
    fn self_loops_do_not_count_as_incoming() {
        let mut start = node("start", NodeKind::Choice, "x");
        start.connections = vec!["end".into()];
        let end = node("end", NodeKind::Ending, "x");
        let mut looper = node("looper", NodeKind::Passage, "x");
        looper.connections = vec!["looper".into()];
        looper.interactions = vec![movement("looper-go-looper", "looper")];

        let mut g = graph("start", vec![start, end, looper]);
        let report = validate_and_repair(&mut g);

        assert_eq!(fixes_with_rule(&report, "orphan-reconnected"), vec!["looper"]);
    }

    #[test]
    fn orphaned_endings_are_reconnected_too() {
        let mut start = node("start", NodeKind::Choice, "x");
        start.connections = vec!["end".into()];
        let end = node("end", NodeKind::Ending, "x");
        let stray_end = node("bad-end", NodeKind::Ending, "y");

        let mut g = graph("start", vec![start, end, stray_end]);
        let report = validate_and_repair(&mut g);

        assert_eq!(fixes_with_rule(&report, "orphan-reconnected"), vec!["bad-end"]);

        // Every non-start node now has an incoming traversal interaction.
        for target in ["end", "bad-end"] {
            let incoming = g
                .nodes
                .iter()
                .flat_map(|n| n.interactions.iter())
                .filter(|i| i.traversal_target() == Some(target))
                .count();
            assert!(incoming >= 1, "{target} still unreachable");
        }
    }

    #[test]
    fn reconnection_score_components_add_up() {
        let mut candidate = node("c", NodeKind::Passage, "garden");
        candidate.chapter = Some("ch-2".into());
        candidate.interactions = vec![movement("c-go-m", "mill"), movement("c-go-w", "well")];
        let mut orphan = node("o", NodeKind::Passage, "garden");
        orphan.chapter = Some("ch-2".into());
        orphan.interactions = vec![movement("o-go-m", "mill")];

        let reachable: HashSet<String> = ["c".to_string()].into_iter().collect();

        // chapter 10 + location 5 + one shared successor 3 + reachable 2
        assert_eq!(reconnection_score(&candidate, &orphan, &reachable), 20);

        orphan.chapter = Some("ch-9".into());
        assert_eq!(reconnection_score(&candidate, &orphan, &reachable), 10);

        let nobody: HashSet<String> = HashSet::new();
        assert_eq!(reconnection_score(&candidate, &orphan, &nobody), 8);
    }

    #[test]
    fn empty_locations_never_count_as_shared() {
        let candidate = node("c", NodeKind::Passage, "");
        let orphan = node("o", NodeKind::Passage, "");
        let reachable = HashSet::new();
        assert_eq!(reconnection_score(&candidate, &orphan, &reachable), 0);
    }

    // --- pass B coverage ---

    #[test]
    fn unused_kinds_become_coverage_warnings() {
        let mut a = node("a", NodeKind::Passage, "x");
        a.connections = vec!["end".into()];
        a.interactions = vec![movement("a-go-end", "end")];
        let end = node("end", NodeKind::Ending, "x");

        let mut g = graph("a", vec![a, end]);
        let report = validate_and_repair(&mut g);

        let coverage: Vec<&str> = report
            .warnings
            .iter()
            .filter(|w| w.rule == "coverage")
            .map(|w| w.message.as_str())
            .collect();
        assert!(coverage.contains(&"no talk interactions generated"));
        assert!(coverage.contains(&"no hasItem conditions used"));
        assert!(coverage.contains(&"no setFlag effects used"));
        assert!(!coverage.iter().any(|m| m.contains("no move interactions")));

        assert_eq!(report.stats.node_count, 2);
        assert_eq!(report.stats.ending_count, 1);
        assert_eq!(report.stats.interaction_kinds["move"], 1);
        assert_eq!(report.stats.interaction_kinds["talk"], 0);
    }

    #[test]
    fn healthy_graph_needs_no_fixes() {
        let mut start = node("start", NodeKind::Choice, "club");
        start.connections = vec!["end".into()];
        start.interactions = vec![movement("start-go-end", "end")];
        let end = node("end", NodeKind::Ending, "club");

        let mut g = graph("start", vec![start, end]);
        let report = validate_and_repair(&mut g);

        assert!(report.errors.is_empty());
        assert!(report.fixes.is_empty());
    }
}
