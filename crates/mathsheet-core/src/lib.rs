//! mathsheet core library
//!
//! Generates mathematics exercise items through an external service, checks
//! every candidate (delimiter repair, sanitizer, structural check, real
//! compile) and backfills until the requested number of items is verified.

pub mod config;
pub mod domain;
pub mod fakes;
pub mod generation;
pub mod layout;
pub mod obs;
pub mod pipeline;
pub mod telemetry;
pub mod templates;
pub mod verify;

pub use config::PipelineConfig;

pub use domain::{
    CompileError, ConfigError, Difficulty, FailureKind, FeedbackItem, FeedbackSet, GeneratedItem,
    GenerationError, MathsheetError, PipelineError, ProblemBatch, Result, TemplateError,
    VerificationResult, VerifiedItem,
};

pub use generation::{ContentPart, GenerationService, ImageUrl, OpenAiClient, UserContent};

pub use layout::{escape_latex, normalize_display, CompileContext, SheetLayout, SheetSpec, TypesetEngine};

pub use pipeline::{
    BufferPolicy, ConcurrencyGate, GenerationOutcome, GenerationPipeline, GenerationRequest,
    RunHooks, RunMetadata, RunPhase,
};

pub use templates::{BatchConfig, TemplateGenerator, TemplateQuestion};

pub use verify::{
    check_content, repair, sanitize, CompileFanout, CompileVerifier, Compiler, ItemVerifier,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
