//! Staged generation pipeline: resumable caching, bounded fan-out,
//! sub-graph merging, and self-healing validation.
//!
//! This crate implements the core Fabula engine: stage keys and the
//! manifest-backed artifact cache, the bounded parallel executor, prompt
//! construction for every generation task, the connection resolver that
//! merges per-chapter sub-graphs through symbolic ports, and the validator
//! that repairs what generation got wrong.

pub mod cache;
pub mod engine;
pub mod events;
pub mod executor;
pub mod prompts;
pub mod resolver;
pub mod stage;
pub mod validator;

pub use cache::{input_fingerprint, ArtifactStore, CacheStore, DiskStore, MemoryStore};
pub use engine::{
    Pipeline, PipelineConfig, PipelineOutcome, CONTENT_BATCH_SIZE, HIERARCHICAL_THRESHOLD,
};
pub use events::{EventEmitter, PipelineEvent};
pub use executor::run_limited;
pub use resolver::{resolve, ResolveReport, START_PORT};
pub use stage::{Stage, StageKey};
pub use validator::{reconnection_score, validate_and_repair, MAX_OUTGOING_TRAVERSALS};
