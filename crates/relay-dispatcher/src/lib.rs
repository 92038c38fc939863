//! Per-environment task-run dispatcher.
//!
//! One dispatcher is built per authenticated worker connection. It pulls run
//! messages off the environment's queue, resolves them against the worker
//! versions registered on this connection, locks the run and creates an
//! execution attempt, and ships an execution descriptor over the transport.
//! Worker-reported completions and heartbeats close the loop with ack/nack/
//! visibility-extension against the queue. Iterations are grouped under
//! bounded tracing windows.

mod completion;
pub mod dispatcher;
pub mod registry;
pub mod window;

pub use dispatcher::{Dispatcher, DispatcherOptions, Tick};
pub use registry::WorkerRegistry;
pub use window::{TraceWindow, TraceWindowConfig};
