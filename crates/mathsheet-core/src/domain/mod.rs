//! Domain models for mathsheet.
//!
//! Canonical definitions for the core entities:
//! - `GeneratedItem`: an untrusted candidate problem from a generator
//! - `VerifiedItem`: a candidate that passed every verification stage
//! - `VerificationResult`: tagged outcome of one verification stage
//! - `ProblemBatch`: one structured response from the generation service
//! - `FeedbackItem`: tutor feedback (explanation, hint, common mistake) for one problem

pub mod error;
pub mod feedback;
pub mod item;
pub mod verification;

// Re-export main types and errors
pub use error::{
    CompileError, ConfigError, GenerationError, MathsheetError, PipelineError, Result,
    TemplateError,
};
pub use feedback::{FeedbackItem, FeedbackSet};
pub use item::{Difficulty, GeneratedItem, ProblemBatch, VerifiedItem};
pub use verification::{FailureKind, VerificationResult};
