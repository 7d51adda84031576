//! Broadcast events for observing a pipeline run.
//!
//! The engine emits [`PipelineEvent`]s on a [`tokio::sync::broadcast`]
//! channel so observers (the CLI progress display, log sinks, tests) can
//! follow a run without coupling to engine internals.  Emission is lossy:
//! with no subscriber the event is dropped, never buffered.

use serde::{Deserialize, Serialize};

/// Events emitted during a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    PipelineStarted {
        run_id: String,
        title: String,
        target_node_count: usize,
    },
    PipelineCompleted {
        run_id: String,
        duration_ms: u64,
        node_count: usize,
        input_tokens: u64,
        output_tokens: u64,
    },
    PipelineFailed {
        run_id: String,
        error: String,
    },
    StageStarted {
        stage: String,
    },
    /// Fires at least once per stage; fan-out stages emit one update per
    /// settled partition, counting cache hits as completed work.
    StageProgress {
        stage: String,
        percent: u8,
    },
    StageCompleted {
        stage: String,
        cached: bool,
        duration_ms: u64,
    },
    StageFailed {
        stage: String,
        error: String,
    },
}

/// Cloneable emitting handle; one channel serves any number of subscribers.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    /// New emitter whose channel buffers `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Send `event` to every live subscriber.  With none, it is dropped.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    /// Open a receiver positioned at the next emitted event.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
