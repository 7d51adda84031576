//! The engine: drives a source book through every generation stage and
//! assembles the playable artifact.
//!
//! Orchestration only.  Prompt text lives in [`crate::prompts`], caching in
//! [`crate::cache`], bounded fan-out in [`crate::executor`], sub-graph
//! merging in [`crate::resolver`], and repair in [`crate::validator`].
//! Every stage boundary goes through the cache, so an interrupted run
//! resumes from its last finished stage and a warm re-run reproduces the
//! artifact without a single model call.

use std::collections::HashMap;
use std::future::Future;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use fabula_llm::{GenerationClient, GenerationRequest};
use fabula_types::{
    ActGroup, ActPlan, ArtifactMeta, ChapterGroup, ChapterPlan, FabulaError, InitialState,
    Interaction, Result, SourceBook, StoryArtifact, StoryGraph, StoryNode, StorySummary,
    ValidationReport, WorldModel,
};

use crate::cache::CacheStore;
use crate::events::{EventEmitter, PipelineEvent};
use crate::executor;
use crate::prompts;
use crate::resolver;
use crate::stage::Stage;
use crate::validator;

/// Target node counts at or above this switch from one flat graph call to
/// act/chapter/scene decomposition.
pub const HIERARCHICAL_THRESHOLD: usize = 50;

/// Nodes per content-writing call.
pub const CONTENT_BATCH_SIZE: usize = 8;

/// Tuning knobs for a run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Approximate number of story nodes to aim for.
    pub target_node_count: usize,
    /// Maximum concurrent generation calls within a fan-out stage.
    pub concurrency: usize,
    /// Stop after the graph stage, before any content is written.  Cheap
    /// way to inspect the structure a book would produce.
    pub dry_run: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_node_count: 40,
            concurrency: 4,
            dry_run: false,
        }
    }
}

/// What a completed run hands back.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub artifact: StoryArtifact,
    pub report: ValidationReport,
}

// ---------------------------------------------------------------------------
// Stage payloads — the JSON envelopes model responses are parsed into
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodesPayload {
    #[serde(default)]
    nodes: Vec<StoryNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActsPayload {
    #[serde(default)]
    acts: Vec<ActPlan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChaptersPayload {
    #[serde(default)]
    chapters: Vec<ChapterPlan>,
}

/// One node's written content, as returned by a content batch call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentPiece {
    id: String,
    #[serde(default)]
    narrative: String,
    #[serde(default)]
    interactions: Vec<Interaction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContentPayload {
    #[serde(default)]
    nodes: Vec<ContentPiece>,
}

/// Ambient interactions to layer onto an existing node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnrichmentAddition {
    node_id: String,
    #[serde(default)]
    interactions: Vec<Interaction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EnrichmentPayload {
    #[serde(default)]
    additions: Vec<EnrichmentAddition>,
}

/// Prefetch result for one partition of a fan-out stage.
enum Slot<T> {
    /// Loaded from cache.
    Hit(T),
    /// Needs computing; holds the index into the spawned task list.
    Miss(usize),
}

/// Shape of the hierarchical decomposition for a given node target.
#[derive(Debug, Clone, Copy)]
struct GraphLayout {
    act_count: usize,
    chapters_per_act: usize,
    nodes_per_chapter: usize,
}

impl GraphLayout {
    fn for_target(target: usize) -> Self {
        let act_count = target.div_ceil(40).clamp(2, 6);
        let chapters_per_act = 3;
        let nodes_per_chapter = target.div_ceil(act_count * chapters_per_act).max(4);
        Self {
            act_count,
            chapters_per_act,
            nodes_per_chapter,
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// The orchestrator.  Owns the model client, the stage cache, and an event
/// channel; [`run`](Self::run) drives a book through every stage.
pub struct Pipeline {
    client: GenerationClient,
    cache: CacheStore,
    config: PipelineConfig,
    events: EventEmitter,
}

impl Pipeline {
    pub fn new(client: GenerationClient, cache: CacheStore, config: PipelineConfig) -> Self {
        Self {
            client,
            cache,
            config,
            events: EventEmitter::default(),
        }
    }

    /// The event channel observers can subscribe to.  Subscribe before
    /// calling [`run`](Self::run); events without subscribers are dropped.
    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Run the full pipeline over `book`.
    ///
    /// Finished stages are served from the cache, so re-running after a
    /// failure only pays for the work that never completed.
    pub async fn run(&self, book: &SourceBook) -> Result<PipelineOutcome> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        self.events.emit(PipelineEvent::PipelineStarted {
            run_id: run_id.clone(),
            title: book.title.clone(),
            target_node_count: self.config.target_node_count,
        });
        tracing::info!(
            run_id = %run_id,
            title = %book.title,
            author = %book.author,
            target = self.config.target_node_count,
            backend = %self.client.backend_name(),
            "Pipeline run starting"
        );

        match self.run_inner(book).await {
            Ok(outcome) => {
                let usage = self.client.usage();
                self.events.emit(PipelineEvent::PipelineCompleted {
                    run_id,
                    duration_ms: started.elapsed().as_millis() as u64,
                    node_count: outcome.artifact.nodes.len(),
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                });
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "Pipeline run failed");
                self.events.emit(PipelineEvent::PipelineFailed {
                    run_id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_inner(&self, book: &SourceBook) -> Result<PipelineOutcome> {
        let summary: StorySummary = self
            .single_stage(Stage::Summary, prompts::summary_request(book)?)
            .await?;
        let world: WorldModel = self
            .single_stage(Stage::World, prompts::world_request(book, &summary)?)
            .await?;

        let mut graph = if self.config.target_node_count >= HIERARCHICAL_THRESHOLD {
            self.hierarchical_graph(book, &summary, &world).await?
        } else {
            self.flat_graph(book, &summary, &world).await?
        };

        if self.config.dry_run {
            tracing::info!(nodes = graph.nodes.len(), "Dry run, stopping after graph");
            return Ok(PipelineOutcome {
                artifact: self.assemble(book, &world, graph).await,
                report: ValidationReport::new(),
            });
        }

        self.content_stage(&mut graph, &world).await?;
        self.enrichment_stage(&mut graph, &world).await?;
        let report = self.validation_stage(&mut graph).await?;

        Ok(PipelineOutcome {
            artifact: self.assemble(book, &world, graph).await,
            report,
        })
    }

    // -----------------------------------------------------------------------
    // Graph construction
    // -----------------------------------------------------------------------

    /// One generation call produces the whole structure.
    async fn flat_graph(
        &self,
        book: &SourceBook,
        summary: &StorySummary,
        world: &WorldModel,
    ) -> Result<StoryGraph> {
        let request =
            prompts::flat_graph_request(book, summary, world, self.config.target_node_count)?;
        let payload: NodesPayload = self.single_stage(Stage::Graph, request).await?;
        Ok(assemble_flat_graph(book, payload.nodes))
    }

    /// Acts in one call, then chapters per act and scenes per chapter in
    /// bounded parallel, then a pure merge.  The merge is recomputed from
    /// the cached scene partitions on every run rather than cached itself.
    async fn hierarchical_graph(
        &self,
        book: &SourceBook,
        summary: &StorySummary,
        world: &WorldModel,
    ) -> Result<StoryGraph> {
        let layout = GraphLayout::for_target(self.config.target_node_count);
        tracing::info!(
            acts = layout.act_count,
            chapters_per_act = layout.chapters_per_act,
            nodes_per_chapter = layout.nodes_per_chapter,
            "Using hierarchical generation"
        );

        let acts: Vec<ActPlan> = {
            let request = prompts::act_outline_request(book, summary, layout.act_count)?;
            let payload: ActsPayload = self.single_stage(Stage::Acts, request).await?;
            payload.acts
        };

        let act_ids: Vec<String> = acts.iter().map(|a| a.id.clone()).collect();
        let acts_ref = &acts;
        let chapter_sets: Vec<ChaptersPayload> = self
            .partitioned_stage(Stage::Chapters, &act_ids, move |act_id: String| async move {
                let act = acts_ref.iter().find(|a| a.id == act_id).ok_or_else(|| {
                    FabulaError::Other(format!("unknown act partition '{act_id}'"))
                })?;
                let request = prompts::chapter_planning_request(
                    act,
                    summary,
                    layout.chapters_per_act,
                    layout.nodes_per_chapter,
                )?;
                let response = self.client.invoke(&request).await?;
                parse_payload("chapter plan", response.json)
            })
            .await?;
        let chapters: Vec<ChapterPlan> = chapter_sets
            .into_iter()
            .flat_map(|set| set.chapters)
            .collect();

        // Every scene call sees every chapter's ports, so edges can cross
        // chapter boundaries symbolically.
        let chapter_ids: Vec<String> = chapters.iter().map(|c| c.id.clone()).collect();
        let chapters_ref = &chapters;
        let scene_sets: Vec<NodesPayload> = self
            .partitioned_stage(Stage::Scenes, &chapter_ids, move |chapter_id: String| {
                async move {
                    let chapter =
                        chapters_ref.iter().find(|c| c.id == chapter_id).ok_or_else(|| {
                            FabulaError::Other(format!("unknown chapter partition '{chapter_id}'"))
                        })?;
                    let request = prompts::scene_request(chapter, world, chapters_ref)?;
                    let response = self.client.invoke(&request).await?;
                    parse_payload("scenes", response.json)
                }
            })
            .await?;

        let chapter_nodes: Vec<(String, Vec<StoryNode>)> = chapter_ids
            .into_iter()
            .zip(scene_sets.into_iter().map(|set| set.nodes))
            .collect();

        let (graph, merge) = resolver::resolve(&acts, &chapters, &chapter_nodes);
        if !merge.duplicate_ports.is_empty() {
            tracing::warn!(
                ports = ?merge.duplicate_ports,
                "Entry ports declared by more than one chapter"
            );
        }
        if !merge.unresolved.is_empty() {
            tracing::warn!(
                entries = ?merge.unresolved,
                "Unresolved connection entries left for validation"
            );
        }
        tracing::info!(
            nodes = graph.nodes.len(),
            renamed = merge.renamed.len(),
            injected_back_edges = merge.injected_back_edges,
            "Sub-graphs merged"
        );
        Ok(graph)
    }

    // -----------------------------------------------------------------------
    // Content, enrichment, validation
    // -----------------------------------------------------------------------

    /// Write narrative and core interactions for every node, in batches of
    /// [`CONTENT_BATCH_SIZE`] fanned out as partitions.
    async fn content_stage(&self, graph: &mut StoryGraph, world: &WorldModel) -> Result<()> {
        let batches: Vec<Vec<StoryNode>> = graph
            .nodes
            .chunks(CONTENT_BATCH_SIZE)
            .map(|chunk| chunk.to_vec())
            .collect();
        let partitions: Vec<String> = (0..batches.len()).map(batch_partition).collect();

        let batches_ref = &batches;
        let payloads: Vec<ContentPayload> = self
            .partitioned_stage(Stage::Content, &partitions, move |partition: String| {
                async move {
                    let index = batch_index(&partition)?;
                    let nodes = batches_ref.get(index).ok_or_else(|| {
                        FabulaError::Other(format!("unknown content partition '{partition}'"))
                    })?;
                    let request = prompts::content_batch_request(nodes, world, index)?;
                    let response = self.client.invoke(&request).await?;
                    parse_payload("content batch", response.json)
                }
            })
            .await?;

        let mut by_id: HashMap<String, ContentPiece> = payloads
            .into_iter()
            .flat_map(|payload| payload.nodes)
            .map(|piece| (piece.id.clone(), piece))
            .collect();
        for node in &mut graph.nodes {
            match by_id.remove(&node.id) {
                Some(piece) => {
                    node.narrative = piece.narrative;
                    node.interactions = piece.interactions;
                }
                None => {
                    tracing::warn!(node = %node.id, "Content batch returned nothing for node");
                }
            }
        }
        for id in by_id.keys() {
            tracing::warn!(node = %id, "Content batch wrote to an unknown node");
        }
        Ok(())
    }

    /// Layer ambient interactions over the written nodes in one call.
    async fn enrichment_stage(&self, graph: &mut StoryGraph, world: &WorldModel) -> Result<()> {
        let request = prompts::enrichment_request(&graph.nodes, world)?;
        let payload: EnrichmentPayload = self.single_stage(Stage::Enrichment, request).await?;

        let index_of: HashMap<String, usize> = graph
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
        let mut applied = 0usize;
        for addition in payload.additions {
            match index_of.get(&addition.node_id) {
                Some(&i) => {
                    applied += addition.interactions.len();
                    graph.nodes[i].interactions.extend(addition.interactions);
                }
                None => {
                    tracing::warn!(node = %addition.node_id, "Enrichment addressed an unknown node");
                }
            }
        }
        tracing::info!(interactions = applied, "Enrichment applied");
        Ok(())
    }

    /// Validate and repair in place.  The repaired node list is what gets
    /// cached; the report is cheap and recomputed every run, which a warm
    /// re-run survives because repair converges.
    async fn validation_stage(&self, graph: &mut StoryGraph) -> Result<ValidationReport> {
        let stage = Stage::Validation;
        let key = stage.key();
        let started = Instant::now();
        self.events.emit(PipelineEvent::StageStarted {
            stage: stage.name().to_string(),
        });

        let cached = self.cache.has(&key).await;
        let result: Result<ValidationReport> = async {
            if cached {
                graph.nodes = self.cache.load(&key).await?;
            }
            let report = validator::validate_and_repair(graph);
            if !cached {
                self.cache.save(&key, &graph.nodes).await?;
            }
            Ok(report)
        }
        .await;

        match result {
            Ok(report) => {
                self.emit_progress(stage, 100);
                self.events.emit(PipelineEvent::StageCompleted {
                    stage: stage.name().to_string(),
                    cached,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                tracing::info!(
                    errors = report.errors.len(),
                    warnings = report.warnings.len(),
                    fixes = report.fixes.len(),
                    "Validation finished"
                );
                Ok(report)
            }
            Err(e) => {
                self.stage_failed(stage, &e);
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Stage plumbing
    // -----------------------------------------------------------------------

    /// Run a single-valued stage: one generation call, parsed and cached.
    async fn single_stage<T>(&self, stage: Stage, request: GenerationRequest) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let client = &self.client;
        self.cached_stage(stage, move || async move {
            let response = client.invoke(&request).await?;
            parse_payload(stage.name(), response.json)
        })
        .await
    }

    /// Cache-or-compute for a single-valued stage, with events and logs.
    async fn cached_stage<T, F, Fut>(&self, stage: Stage, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        self.events.emit(PipelineEvent::StageStarted {
            stage: stage.name().to_string(),
        });

        let key = stage.key();
        let cached = self.cache.has(&key).await;
        let result: Result<T> = if cached {
            self.cache.load(&key).await
        } else {
            match compute().await {
                Ok(value) => self.cache.save(&key, &value).await.map(|()| value),
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(value) => {
                self.emit_progress(stage, 100);
                self.events.emit(PipelineEvent::StageCompleted {
                    stage: stage.name().to_string(),
                    cached,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                if cached {
                    tracing::info!(stage = %stage, "Stage served from cache");
                } else {
                    tracing::info!(
                        stage = %stage,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Stage completed"
                    );
                }
                Ok(value)
            }
            Err(e) => {
                self.stage_failed(stage, &e);
                Err(e)
            }
        }
    }

    /// Cache-or-compute for a partitioned stage, with events and logs.
    async fn partitioned_stage<T, F, Fut>(
        &self,
        stage: Stage,
        partitions: &[String],
        compute: F,
    ) -> Result<Vec<T>>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        self.events.emit(PipelineEvent::StageStarted {
            stage: stage.name().to_string(),
        });

        match self.fan_out(stage, partitions, compute).await {
            Ok((results, hits)) => {
                self.events.emit(PipelineEvent::StageCompleted {
                    stage: stage.name().to_string(),
                    cached: hits == partitions.len(),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                tracing::info!(
                    stage = %stage,
                    partitions = partitions.len(),
                    cached = hits,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Stage completed"
                );
                Ok(results)
            }
            Err(e) => {
                self.stage_failed(stage, &e);
                Err(e)
            }
        }
    }

    /// Prefetch cache hits, fan misses out through the bounded executor, and
    /// reassemble results in partition order.  Each task saves its own
    /// partition the moment it finishes, so a failing sibling cannot undo
    /// completed work.
    async fn fan_out<T, F, Fut>(
        &self,
        stage: Stage,
        partitions: &[String],
        compute: F,
    ) -> Result<(Vec<T>, usize)>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut slots: Vec<Slot<T>> = Vec::with_capacity(partitions.len());
        let mut pending: Vec<String> = Vec::new();
        for partition in partitions {
            let key = stage.partition(partition.clone());
            if self.cache.has(&key).await {
                slots.push(Slot::Hit(self.cache.load(&key).await?));
            } else {
                slots.push(Slot::Miss(pending.len()));
                pending.push(partition.clone());
            }
        }

        let total = partitions.len();
        let hits = total - pending.len();
        self.emit_progress(stage, percent_of(hits, total));
        if hits > 0 {
            tracing::info!(stage = %stage, hits, total, "Partitions served from cache");
        }

        let mut computed: Vec<Option<T>> = if pending.is_empty() {
            Vec::new()
        } else {
            let cache = &self.cache;
            let compute = &compute;
            let tasks: Vec<_> = pending
                .iter()
                .map(|partition| {
                    let partition = partition.clone();
                    move || async move {
                        let value = compute(partition.clone()).await?;
                        cache.save(&stage.partition(partition), &value).await?;
                        Ok(value)
                    }
                })
                .collect();
            executor::run_limited(tasks, self.config.concurrency, |done, _| {
                self.emit_progress(stage, percent_of(hits + done, total));
            })
            .await?
            .into_iter()
            .map(Some)
            .collect()
        };

        let mut results = Vec::with_capacity(total);
        for slot in slots {
            match slot {
                Slot::Hit(value) => results.push(value),
                Slot::Miss(index) => results.push(
                    computed.get_mut(index).and_then(Option::take).ok_or_else(|| {
                        FabulaError::Other("partition result slot left empty".into())
                    })?,
                ),
            }
        }
        Ok((results, hits))
    }

    fn emit_progress(&self, stage: Stage, percent: u8) {
        self.events.emit(PipelineEvent::StageProgress {
            stage: stage.name().to_string(),
            percent,
        });
    }

    fn stage_failed(&self, stage: Stage, error: &FabulaError) {
        tracing::error!(stage = %stage, error = %error, "Stage failed");
        self.events.emit(PipelineEvent::StageFailed {
            stage: stage.name().to_string(),
            error: error.to_string(),
        });
    }

    /// Pack the final artifact.  `generated_at` comes from the manifest's
    /// creation time, so warm re-runs reproduce the artifact byte for byte.
    async fn assemble(
        &self,
        book: &SourceBook,
        world: &WorldModel,
        graph: StoryGraph,
    ) -> StoryArtifact {
        StoryArtifact {
            meta: ArtifactMeta {
                title: book.title.clone(),
                author: book.author.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                target_node_count: self.config.target_node_count,
                generated_at: self.cache.created_at().await,
            },
            initial_state: InitialState {
                start_node_id: graph.start_node_id.clone(),
                inventory: world.initial_inventory.clone(),
                flags: world
                    .variable_definitions
                    .iter()
                    .map(|v| (v.name.clone(), v.initial))
                    .collect(),
            },
            nodes: graph.nodes,
            locations: world.locations.clone(),
            objects: world.objects.clone(),
            characters: world.characters.clone(),
            items: world.items.clone(),
            variable_definitions: world.variable_definitions.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

/// Wrap a flat node list in the single-act single-chapter scaffolding the
/// rest of the pipeline expects.
fn assemble_flat_graph(book: &SourceBook, mut nodes: Vec<StoryNode>) -> StoryGraph {
    for node in &mut nodes {
        node.chapter = Some("chapter-1".to_string());
    }
    let start_node_id = nodes.first().map(|n| n.id.clone()).unwrap_or_default();
    let chapter = ChapterGroup {
        id: "chapter-1".to_string(),
        title: book.title.clone(),
        node_ids: nodes.iter().map(|n| n.id.clone()).collect(),
    };
    StoryGraph {
        start_node_id,
        nodes,
        acts: vec![ActGroup {
            id: "act-1".to_string(),
            title: book.title.clone(),
            chapters: vec![chapter],
        }],
    }
}

fn batch_partition(index: usize) -> String {
    format!("batch-{index:03}")
}

fn batch_index(partition: &str) -> Result<usize> {
    partition
        .strip_prefix("batch-")
        .and_then(|rest| rest.parse().ok())
        .ok_or_else(|| FabulaError::Other(format!("malformed batch partition '{partition}'")))
}

fn percent_of(done: usize, total: usize) -> u8 {
    if total == 0 {
        100
    } else {
        ((done * 100) / total) as u8
    }
}

/// Deserialize a model response into its stage payload.
fn parse_payload<T: DeserializeOwned>(what: &str, value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| FabulaError::MalformedOutput {
        message: format!("{what}: {e}"),
    })
}
