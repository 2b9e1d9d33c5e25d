//! Verified generation pipeline.

pub mod gate;
pub mod orchestrator;
pub mod state;

pub use gate::{ConcurrencyGate, GatePass};
pub use orchestrator::{
    GenerationOutcome, GenerationPipeline, GenerationRequest, ProgressFn, RunHooks, RunMetadata,
};
pub use state::{transition, BufferPolicy, PipelineRun, RunCounters, RunEvent, RunPhase};
