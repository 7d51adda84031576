//! Prompt builders, one per generation task.
//!
//! Each builder embeds its context as pretty-printed JSON and spells out the
//! exact response shape, because the engine parses replies strictly: an
//! unknown kind or a missing field is malformed output, not something to
//! paper over.  Narrative quality is the model's problem; these prompts only
//! pin down structure.

use serde_json::json;

use fabula_llm::{GenerationRequest, TaskKind};
use fabula_types::{ActPlan, ChapterPlan, Result, SourceBook, StoryNode, StorySummary, WorldModel};

use crate::resolver::START_PORT;

/// System preamble shared by every call.
pub const SYSTEM_PREAMBLE: &str = "You are a narrative designer converting a book into an \
interactive story graph. Respond with a single JSON object matching the requested shape \
exactly: no prose around it, no markdown fences. Use short kebab-case ids, and refer to \
locations, items, and flags only by ids declared in the provided world model.";

const INTERACTION_SHAPE: &str = r#"{"id": string, "kind": "move"|"examine"|"take"|"use"|"talk"|"choice"|"onEnter", "label": string, "conditions": [{"kind": "hasItem"|"missingItem"|"flagSet"|"flagClear"|"visited", "key": string}], "effects": [{"kind": "setFlag"|"clearFlag"|"giveItem"|"takeItem", "key": string}], "target": node id (optional)}"#;

const NODE_SHAPE: &str = r#"{"id": string, "kind": "passage"|"choice"|"ending"|"waypoint", "location": location id, "connections": [node ids], "backConnections": [node ids], "hints": [string]}"#;

/// Summary stage: one call over the full source text.
pub fn summary_request(book: &SourceBook) -> Result<GenerationRequest> {
    let mut prompt = format!(
        "Summarize the book \"{}\" by {} for adaptation into an interactive story.\n\n\
         # Response shape\n\n\
         {{\"synopsis\": string, \"themes\": [string], \"keyEvents\": [string]}}\n\n\
         # Source text\n",
        book.title, book.author
    );
    for chapter in &book.chapters {
        prompt.push_str(&format!(
            "\n## Chapter {}: {}\n\n{}\n",
            chapter.number, chapter.title, chapter.text
        ));
    }
    Ok(GenerationRequest::new(TaskKind::Summary, SYSTEM_PREAMBLE, prompt))
}

/// World stage: locations, characters, objects, items, and flags that every
/// later stage refers to by id.
pub fn world_request(book: &SourceBook, summary: &StorySummary) -> Result<GenerationRequest> {
    let summary_json = serde_json::to_string_pretty(summary)?;
    let prompt = format!(
        "Design the world model for an interactive adaptation of \"{}\" by {}.\n\n\
         # Summary\n\n{summary_json}\n\n\
         # Response shape\n\n\
         {{\"locations\": [{{\"id\", \"name\", \"description\"}}], \
         \"characters\": [{{\"id\", \"name\", \"description\", \"location\" (optional)}}], \
         \"objects\": [{{\"id\", \"name\", \"description\", \"location\" (optional)}}], \
         \"items\": [{{\"id\", \"name\", \"description\"}}], \
         \"variableDefinitions\": [{{\"name\", \"initial\": bool, \"description\"}}], \
         \"initialInventory\": [item ids]}}\n\n\
         Cover every location the story visits, every portable item the player could carry, \
         and every boolean story flag worth tracking.",
        book.title, book.author
    );
    Ok(GenerationRequest::new(TaskKind::World, SYSTEM_PREAMBLE, prompt))
}

/// Flat graph stage: the whole structure in one call.  Used below the
/// hierarchical threshold.
pub fn flat_graph_request(
    book: &SourceBook,
    summary: &StorySummary,
    world: &WorldModel,
    target_node_count: usize,
) -> Result<GenerationRequest> {
    let summary_json = serde_json::to_string_pretty(summary)?;
    let world_json = serde_json::to_string_pretty(world)?;
    let prompt = format!(
        "Design the complete story graph for \"{}\": about {target_node_count} nodes covering \
         the whole narrative, structure only, no narrative text yet.\n\n\
         # Summary\n\n{summary_json}\n\n\
         # World\n\n{world_json}\n\n\
         # Response shape\n\n{{\"nodes\": [{NODE_SHAPE}]}}\n\n\
         Rules:\n\
         - The first node in the list is where play begins.\n\
         - Include at least one ending node.\n\
         - Every non-ending node needs at least one forward connection.\n\
         - Use choice or waypoint kinds for crossroads the player keeps returning to.\n\
         - hints sketch what the node's content should cover later.",
        book.title
    );
    Ok(GenerationRequest::new(TaskKind::FlatGraph, SYSTEM_PREAMBLE, prompt))
}

/// Act outline: first sub-stage of the hierarchical decomposition.
pub fn act_outline_request(
    book: &SourceBook,
    summary: &StorySummary,
    act_count: usize,
) -> Result<GenerationRequest> {
    let summary_json = serde_json::to_string_pretty(summary)?;
    let prompt = format!(
        "Break the story of \"{}\" by {} into exactly {act_count} acts.\n\n\
         # Summary\n\n{summary_json}\n\n\
         # Response shape\n\n\
         {{\"acts\": [{{\"id\": string, \"number\": int, \"title\": string, \"summary\": string}}]}}\n\n\
         Number acts from 1 in story order and give each a one-paragraph summary.",
        book.title, book.author
    );
    Ok(GenerationRequest::new(TaskKind::ActOutline, SYSTEM_PREAMBLE, prompt))
}

/// Chapter planning for one act.  Chapters attach to each other only through
/// their declared ports, so the naming convention here is what makes
/// independently generated chapters connectable at merge time.
pub fn chapter_planning_request(
    act: &ActPlan,
    summary: &StorySummary,
    chapters_per_act: usize,
    nodes_per_chapter: usize,
) -> Result<GenerationRequest> {
    let act_json = serde_json::to_string_pretty(act)?;
    let summary_json = serde_json::to_string_pretty(summary)?;
    let mut prompt = format!(
        "Plan the chapters of act {} (\"{}\").\n\n\
         # Act\n\n{act_json}\n\n\
         # Story summary\n\n{summary_json}\n\n\
         # Response shape\n\n\
         {{\"chapters\": [{{\"id\": string, \"actId\": \"{}\", \"number\": int, \
         \"title\": string, \"summary\": string, \"targetNodes\": int, \
         \"entryPorts\": [string], \"exitPorts\": [string]}}]}}\n\n\
         Rules:\n\
         - Produce exactly {chapters_per_act} chapters, each targeting about \
         {nodes_per_chapter} nodes.\n\
         - Prefix every chapter id with the act id.\n\
         - Declare exactly one entry port per chapter, named \"<chapter-id>-start\"; \
         other chapters attach through it.\n\
         - exitPorts lists the entry ports of whichever chapters this one flows into.\n",
        act.number, act.title, act.id
    );
    if act.number == 1 {
        prompt.push_str(&format!(
            "- The first chapter additionally declares the entry port \"{START_PORT}\", \
             where play begins.\n"
        ));
    }
    Ok(GenerationRequest::new(
        TaskKind::ChapterPlanning { act_id: act.id.clone() },
        SYSTEM_PREAMBLE,
        prompt,
    ))
}

/// Scene generation for one chapter: its slice of the graph, structure only.
/// `chapters` is the full plan so connections can target sibling entry ports.
pub fn scene_request(
    chapter: &ChapterPlan,
    world: &WorldModel,
    chapters: &[ChapterPlan],
) -> Result<GenerationRequest> {
    let chapter_json = serde_json::to_string_pretty(chapter)?;
    let world_json = serde_json::to_string_pretty(world)?;

    let mut ports = String::new();
    for other in chapters.iter().filter(|c| c.id != chapter.id) {
        for port in &other.entry_ports {
            ports.push_str(&format!(
                "- \"{port}\" enters chapter \"{}\" ({})\n",
                other.id, other.title
            ));
        }
    }
    if ports.is_empty() {
        ports.push_str("(none)\n");
    }

    let prompt = format!(
        "Generate the story nodes for chapter \"{}\" ({}).\n\n\
         # Chapter plan\n\n{chapter_json}\n\n\
         # World\n\n{world_json}\n\n\
         # Attachment ports\n\n{ports}\n\
         # Response shape\n\n{{\"nodes\": [{NODE_SHAPE}]}}\n\n\
         Rules:\n\
         - Produce about {} nodes; the first node is this chapter's entrance.\n\
         - Prefix node ids with \"{}-\".\n\
         - Connections name sibling node ids or any attachment port listed above.\n\
         - Route this chapter's outgoing flow through its declared exitPorts.\n\
         - Include an ending node only if this chapter concludes the story.",
        chapter.title, chapter.id, chapter.target_nodes, chapter.id
    );
    Ok(GenerationRequest::new(
        TaskKind::SceneGeneration { chapter_id: chapter.id.clone() },
        SYSTEM_PREAMBLE,
        prompt,
    ))
}

/// Content for one batch of nodes: narrative text plus interactions.
pub fn content_batch_request(
    nodes: &[StoryNode],
    world: &WorldModel,
    index: usize,
) -> Result<GenerationRequest> {
    let skeletons: Vec<serde_json::Value> = nodes
        .iter()
        .map(|node| {
            json!({
                "id": node.id,
                "kind": node.kind,
                "location": node.location,
                "connections": node.connections,
                "backConnections": node.back_connections,
                "hints": node.hints,
            })
        })
        .collect();
    let nodes_json = serde_json::to_string_pretty(&skeletons)?;
    let world_json = serde_json::to_string_pretty(world)?;

    let prompt = format!(
        "Write the playable content for these {} story nodes.\n\n\
         # Nodes\n\n{nodes_json}\n\n\
         # World\n\n{world_json}\n\n\
         # Response shape\n\n\
         {{\"nodes\": [{{\"id\": node id, \"narrative\": string, \
         \"interactions\": [{INTERACTION_SHAPE}]}}]}}\n\n\
         Rules:\n\
         - Return exactly one entry per listed node, keeping the given ids.\n\
         - Every connection and backConnection of a node gets a move or choice \
         interaction targeting it.\n\
         - Ground the narrative in the node's hints and location.\n\
         - Conditions and effects refer only to declared item ids and flag names.",
        nodes.len()
    );
    Ok(GenerationRequest::new(
        TaskKind::ContentBatch { index },
        SYSTEM_PREAMBLE,
        prompt,
    ))
}

/// Enrichment: ambient, non-navigation interactions layered over the whole
/// graph in one call.  Nodes are passed as a light digest, not full content.
pub fn enrichment_request(nodes: &[StoryNode], world: &WorldModel) -> Result<GenerationRequest> {
    let digest: Vec<serde_json::Value> = nodes
        .iter()
        .map(|node| {
            json!({
                "id": node.id,
                "kind": node.kind,
                "location": node.location,
                "interactionCount": node.interactions.len(),
            })
        })
        .collect();
    let digest_json = serde_json::to_string_pretty(&digest)?;
    let world_json = serde_json::to_string_pretty(world)?;

    let prompt = format!(
        "Add ambient interactions to an existing story graph.\n\n\
         # Nodes\n\n{digest_json}\n\n\
         # World\n\n{world_json}\n\n\
         # Response shape\n\n\
         {{\"additions\": [{{\"nodeId\": node id, \"interactions\": [{INTERACTION_SHAPE}]}}]}}\n\n\
         Rules:\n\
         - Only examine, take, use, and talk interactions; never move or choice, and no targets.\n\
         - Favor nodes with a low interactionCount.\n\
         - Use conditions and effects so carried items and story flags matter."
    );
    Ok(GenerationRequest::new(TaskKind::Enrichment, SYSTEM_PREAMBLE, prompt))
}
