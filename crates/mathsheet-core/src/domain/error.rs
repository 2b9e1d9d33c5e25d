//! Error taxonomy for mathsheet.
//!
//! Per-item verification failures are values (`VerificationResult`), not
//! errors. The enums here cover collaborator failures and the few
//! conditions that escalate to the pipeline boundary.

use std::path::PathBuf;

/// Failures of the generation-service collaborator.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("no API credential configured")]
    MissingCredential,

    #[error("generation request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("generation service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("generation service returned no message content")]
    EmptyResponse,

    #[error("response does not match the requested schema: {0}")]
    Schema(#[from] serde_json::Error),

    #[error("generation failed: {0}")]
    Other(String),
}

/// Failures of the compile collaborator.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("{engine} exited with code {exit_code} and produced no output\nstderr: {stderr}\nstdout: {stdout}")]
    Failed {
        engine: String,
        exit_code: i32,
        stderr: String,
        stdout: String,
    },

    #[error("compilation timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("compile workspace error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced at the pipeline boundary.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("no API credential configured")]
    MissingCredential,

    #[error("invalid generation request: {0}")]
    InvalidRequest(String),

    #[error("zero items produced after {attempts} attempt(s); last error: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("server is busy: {limit} generation run(s) already in progress")]
    Busy { limit: usize },

    #[error("generation run cancelled")]
    Cancelled,

    #[error("feedback request failed: {0}")]
    Feedback(GenerationError),

    #[error("feedback {field} rejected: {reason}")]
    RejectedFeedback { field: &'static str, reason: String },
}

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Static template generation errors.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("unknown unit: {0}")]
    UnknownUnit(String),

    #[error("unknown template: {0}")]
    UnknownTemplate(String),

    #[error("template data error: {0}")]
    Data(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Umbrella error for callers that mix mathsheet operations.
#[derive(Debug, thiserror::Error)]
pub enum MathsheetError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Result type for mathsheet operations.
pub type Result<T> = std::result::Result<T, MathsheetError>;
