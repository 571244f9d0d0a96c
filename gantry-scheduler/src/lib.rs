//! Gantry scheduler: request lifecycle state, batch counters and admission.

pub mod batch;
pub mod queue;
pub mod request;

pub use batch::BatchState;
pub use queue::{BatchQueue, QueueConfig};
pub use request::{RequestPhase, RequestState, StepScratch};
