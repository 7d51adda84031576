//! Generation-call collaborator for the Fabula pipeline.
//!
//! Provides the `StoryModel` backend trait, `GenerationClient` with
//! transparent rate-limit retry and token-usage accounting, and one
//! OpenAI-compatible HTTP backend.

mod backend;
mod client;
mod openai;
mod retry;
mod types;

pub use backend::StoryModel;
pub use client::{GenerationClient, DEFAULT_MAX_ATTEMPTS};
pub use openai::OpenAiBackend;
pub use retry::BackoffPolicy;
pub use types::{GenerationRequest, GenerationResponse, TaskKind, Usage};
