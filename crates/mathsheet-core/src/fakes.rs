//! Scripted collaborators for tests and offline runs.
//!
//! `ScriptedGenerator` replays batches and feedback; `ScriptedCompiler`
//! decides compile outcomes from the document source without spawning an
//! engine.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{CompileError, FeedbackSet, GenerationError, ProblemBatch};
use crate::generation::{GenerationService, UserContent};
use crate::verify::Compiler;

type BatchScript = dyn Fn(usize) -> Result<ProblemBatch, GenerationError> + Send + Sync;
type FeedbackScript = dyn Fn(&str) -> Result<FeedbackSet, GenerationError> + Send + Sync;
type CompileRule = dyn Fn(&str) -> Result<Vec<u8>, CompileError> + Send + Sync;

fn no_feedback(_user_prompt: &str) -> Result<FeedbackSet, GenerationError> {
    Err(GenerationError::Other("no feedback scripted".to_string()))
}

/// One call received by a [`ScriptedGenerator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub system_prompt: String,
    pub user_content: UserContent,
    pub model: Option<String>,
}

/// Generation service answering from a script keyed by call index (0-based).
pub struct ScriptedGenerator {
    script: Box<BatchScript>,
    feedback: Box<FeedbackScript>,
    calls: Mutex<Vec<RecordedCall>>,
    feedback_prompts: Mutex<Vec<String>>,
    has_credential: bool,
}

impl ScriptedGenerator {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(usize) -> Result<ProblemBatch, GenerationError> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            feedback: Box::new(no_feedback),
            calls: Mutex::new(Vec::new()),
            feedback_prompts: Mutex::new(Vec::new()),
            has_credential: true,
        }
    }

    /// Replay `batches` in order, then return empty batches.
    pub fn from_batches(batches: Vec<Result<ProblemBatch, GenerationError>>) -> Self {
        let queue = Mutex::new(VecDeque::from(batches));
        Self::new(move |_| {
            queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
                .unwrap_or_else(|| Ok(ProblemBatch::default()))
        })
    }

    /// Return a clone of `batch` on every call.
    pub fn repeating(batch: ProblemBatch) -> Self {
        Self::new(move |_| Ok(batch.clone()))
    }

    /// Answer feedback requests with `script`, called with the user prompt.
    pub fn with_feedback<F>(mut self, script: F) -> Self
    where
        F: Fn(&str) -> Result<FeedbackSet, GenerationError> + Send + Sync + 'static,
    {
        self.feedback = Box::new(script);
        self
    }

    /// User prompts of every feedback request, in order.
    pub fn feedback_prompts(&self) -> Vec<String> {
        self.feedback_prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Fail preflight with [`GenerationError::MissingCredential`].
    pub fn without_credential(mut self) -> Self {
        self.has_credential = false;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl GenerationService for ScriptedGenerator {
    fn preflight(&self) -> Result<(), GenerationError> {
        if self.has_credential {
            Ok(())
        } else {
            Err(GenerationError::MissingCredential)
        }
    }

    async fn generate(
        &self,
        system_prompt: &str,
        user_content: &UserContent,
        model_hint: Option<&str>,
    ) -> Result<ProblemBatch, GenerationError> {
        let index = {
            let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
            calls.push(RecordedCall {
                system_prompt: system_prompt.to_string(),
                user_content: user_content.clone(),
                model: model_hint.map(str::to_string),
            });
            calls.len() - 1
        };
        (self.script)(index)
    }

    async fn generate_feedback(
        &self,
        _system_prompt: &str,
        user_prompt: &str,
        _model_hint: Option<&str>,
    ) -> Result<FeedbackSet, GenerationError> {
        self.feedback_prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(user_prompt.to_string());
        (self.feedback)(user_prompt)
    }
}

/// Compiler whose outcome is a function of the document source.
pub struct ScriptedCompiler {
    rule: Box<CompileRule>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedCompiler {
    pub fn new<F>(rule: F) -> Self
    where
        F: Fn(&str) -> Result<Vec<u8>, CompileError> + Send + Sync + 'static,
    {
        Self {
            rule: Box::new(rule),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Every document compiles.
    pub fn accepting() -> Self {
        Self::new(|_| Ok(b"%PDF-1.5 scripted".to_vec()))
    }

    /// Documents containing `marker` fail the way an undefined macro does.
    pub fn rejecting_containing(marker: impl Into<String>) -> Self {
        let marker = marker.into();
        Self::new(move |source| {
            if source.contains(&marker) {
                Err(CompileError::Failed {
                    engine: "lualatex".to_string(),
                    exit_code: 1,
                    stderr: String::new(),
                    stdout: format!("! Undefined control sequence.\nl.42 {}", marker),
                })
            } else {
                Ok(b"%PDF-1.5 scripted".to_vec())
            }
        })
    }

    /// Sleep for `delay` before succeeding.
    pub fn hanging(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::accepting()
        }
    }

    /// Report an engine-side timeout on every call.
    pub fn timing_out(timeout_secs: u64) -> Self {
        Self::new(move |_| Err(CompileError::Timeout { timeout_secs }))
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Compiler for ScriptedCompiler {
    async fn compile(&self, source: &str) -> Result<Vec<u8>, CompileError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.rule)(source)
    }
}
