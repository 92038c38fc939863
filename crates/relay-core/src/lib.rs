//! Relay core contracts and domain model.
//!
//! This crate freezes the seams of the dispatcher: the queue, store, trace and
//! transport contracts, the wire message schemas, and the execution descriptor
//! handed to remote workers. The dispatcher crate depends only on what is
//! defined here; concrete backends live in the harness.

pub mod contracts;
pub mod execution;
pub mod ids;
pub mod messages;
pub mod model;
pub mod retry_span;

pub use contracts::{
    AttemptOutcome, LockedRun, NewAttempt, RetryDelayEvent, RunQueue, RunStore, SpanHandle,
    TraceRecorder, WorkerTransport,
};
pub use model::{
    AttemptStatus, AuthenticatedEnvironment, BackgroundTask, BackgroundWorker, EnvironmentKind,
    Organization, Project, QueueMessage, RetryPolicy, TaskQueue, TaskRetryConfig, TaskRun,
    TaskRunAttempt,
};
