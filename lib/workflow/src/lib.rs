//! Workflow run lifecycle for amber-relay.
//!
//! - **Runs**: `running → waiting → running → … → completed | failed`
//! - **Messages**: start and resume messages consumed from the work transport
//! - **Waits**: short waits re-enqueue with a delay, long waits go to a
//!   one-shot wake scheduler
//! - **Events**: one terminal lifecycle event per run

pub mod envelope;
pub mod error;
pub mod events;
pub mod graph;
pub mod lifecycle;
pub mod memory;
pub mod message;
pub mod nats;
pub mod queue;
pub mod run;
pub mod store;

pub use envelope::Envelope;
pub use error::{EventError, GraphError, LifecycleError, NatsError, QueueError, RunStoreError, ScheduleError};
pub use events::{LifecycleEvent, LifecycleEvents};
pub use graph::{GraphEdge, GraphNode, WorkflowGraph, WorkflowSource};
pub use lifecycle::{
    DriveOutcome, HandleOutcome, LifecycleConfig, NodeFailure, ResumeOutcome, RunLifecycle,
    WakeRoute,
};
pub use message::{MessageAction, TriggerMessage};
pub use queue::{DelayQueue, MAX_QUEUE_DELAY, WakeScheduler};
pub use run::{RunStatus, WorkflowRun};
pub use store::RunStore;
