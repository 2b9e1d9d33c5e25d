//! Batch request loop: generate, verify, accumulate, backfill.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::gate::ConcurrencyGate;
use super::state::{PipelineRun, RunPhase};
use crate::config::PipelineConfig;
use crate::domain::{
    Difficulty, FailureKind, FeedbackItem, GeneratedItem, GenerationError, PipelineError,
    ProblemBatch, VerificationResult, VerifiedItem,
};
use crate::generation::{prompts, GenerationService, UserContent};
use crate::layout::CompileContext;
use crate::obs;
use crate::verify::ItemVerifier;

/// Topic-driven generation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub topic: String,
    pub target_count: usize,
    pub difficulty: Difficulty,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub extra_instructions: Option<String>,
}

impl GenerationRequest {
    pub fn new(topic: impl Into<String>, target_count: usize, difficulty: Difficulty) -> Self {
        Self {
            topic: topic.into(),
            target_count,
            difficulty,
            model: None,
            extra_instructions: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_extra_instructions(mut self, extra: impl Into<String>) -> Self {
        self.extra_instructions = Some(extra.into());
        self
    }
}

/// Progress callback: `(accepted, target)`, called once per accepted item.
pub type ProgressFn<'a> = &'a (dyn Fn(usize, usize) + Send + Sync);

/// Optional caller hooks for one run.
#[derive(Clone, Copy, Default)]
pub struct RunHooks<'a> {
    pub on_progress: Option<ProgressFn<'a>>,
    pub cancel: Option<&'a CancellationToken>,
}

impl<'a> RunHooks<'a> {
    pub fn with_progress(mut self, on_progress: ProgressFn<'a>) -> Self {
        self.on_progress = Some(on_progress);
        self
    }

    pub fn with_cancel(mut self, cancel: &'a CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Bookkeeping for one finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub requested_count: usize,
    pub accepted_count: usize,
    pub attempts: u32,
    pub batch_failures: u32,
    pub rejections: BTreeMap<FailureKind, u32>,
    pub last_error: Option<String>,
    /// `true` when the target count was reached.
    pub complete: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOutcome {
    /// Accepted items in verification order.
    pub items: Vec<VerifiedItem>,
    pub intent: Option<String>,
    pub summary_notes: Option<String>,
    pub metadata: RunMetadata,
}

/// What each batch request asks the service for.
enum BatchPrompt<'a> {
    Topic(&'a GenerationRequest),
    Regenerate {
        prior: Option<&'a GeneratedItem>,
        instruction: &'a str,
        topic: &'a str,
        difficulty: Difficulty,
    },
    Free {
        system_prompt: &'a str,
        user_content: &'a UserContent,
    },
}

impl BatchPrompt<'_> {
    fn render(&self, count: usize) -> (String, UserContent) {
        match self {
            BatchPrompt::Topic(request) => (
                prompts::topic_system_prompt(count),
                UserContent::Text(prompts::topic_user_prompt(
                    &request.topic,
                    count,
                    request.difficulty,
                    request.extra_instructions.as_deref(),
                )),
            ),
            BatchPrompt::Regenerate {
                prior,
                instruction,
                topic,
                difficulty,
            } => (
                prompts::regenerate_system_prompt(),
                UserContent::Text(prompts::regenerate_user_prompt(
                    *prior,
                    instruction,
                    topic,
                    *difficulty,
                )),
            ),
            BatchPrompt::Free {
                system_prompt,
                user_content,
            } => (
                prompts::with_count(system_prompt, count),
                (*user_content).clone(),
            ),
        }
    }

    fn label(&self) -> &str {
        match self {
            BatchPrompt::Topic(request) => &request.topic,
            BatchPrompt::Regenerate { topic, .. } => *topic,
            BatchPrompt::Free { .. } => "free prompt",
        }
    }
}

/// Id sent with single-problem feedback requests.
const FEEDBACK_QUESTION_ID: &str = "q1";

/// Requests batches from a [`GenerationService`], verifies every candidate
/// and backfills until the target is met or the retry budget runs out.
pub struct GenerationPipeline {
    generator: Arc<dyn GenerationService>,
    verifier: ItemVerifier,
    config: PipelineConfig,
    gate: Option<ConcurrencyGate>,
}

impl GenerationPipeline {
    pub fn new(
        generator: Arc<dyn GenerationService>,
        verifier: ItemVerifier,
        config: PipelineConfig,
    ) -> Self {
        Self {
            generator,
            verifier,
            config,
            gate: None,
        }
    }

    /// Admit runs through `gate`; a full gate fails with
    /// [`PipelineError::Busy`].
    pub fn with_gate(mut self, gate: ConcurrencyGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn verifier(&self) -> &ItemVerifier {
        &self.verifier
    }

    /// Generate up to `request.target_count` verified items for a topic.
    ///
    /// Returns fewer items than requested without error when the retry
    /// budget runs out; zero items is [`PipelineError::Exhausted`].
    pub async fn generate_verified(
        &self,
        request: &GenerationRequest,
        hooks: RunHooks<'_>,
    ) -> Result<GenerationOutcome, PipelineError> {
        if request.topic.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("topic is empty".to_string()));
        }
        self.run(
            BatchPrompt::Topic(request),
            request.target_count,
            request.model.as_deref(),
            hooks,
        )
        .await
    }

    /// Produce one verified replacement for `prior` following `instruction`.
    pub async fn regenerate(
        &self,
        prior: Option<&GeneratedItem>,
        instruction: &str,
        topic: &str,
        difficulty: Difficulty,
        hooks: RunHooks<'_>,
    ) -> Result<VerifiedItem, PipelineError> {
        if instruction.trim().is_empty() || topic.trim().is_empty() {
            return Err(PipelineError::InvalidRequest(
                "instruction and topic are required".to_string(),
            ));
        }
        let prompt = BatchPrompt::Regenerate {
            prior,
            instruction,
            topic,
            difficulty,
        };
        let GenerationOutcome {
            items, metadata, ..
        } = self.run(prompt, 1, None, hooks).await?;
        items
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::Exhausted {
                attempts: metadata.attempts,
                last_error: metadata.last_error.unwrap_or_default(),
            })
    }

    /// Same loop with a caller-supplied system prompt and text or
    /// multimodal user content.
    pub async fn generate_verified_from_prompt(
        &self,
        system_prompt: &str,
        user_content: &UserContent,
        count: usize,
        model: Option<&str>,
        hooks: RunHooks<'_>,
    ) -> Result<GenerationOutcome, PipelineError> {
        let prompt = BatchPrompt::Free {
            system_prompt,
            user_content,
        };
        self.run(prompt, count, model, hooks).await
    }

    /// Explanation, hint and common mistake for `item`.
    ///
    /// Every non-empty field is repaired, sanitized and compiled in the
    /// answer context; the first failing field rejects the whole response.
    /// Apply the result with [`GeneratedItem::apply_feedback`].
    pub async fn feedback(
        &self,
        item: &GeneratedItem,
        model: Option<&str>,
    ) -> Result<FeedbackItem, PipelineError> {
        self.preflight()?;
        let model = model.or(self.config.feedback_model.as_deref());
        let set = self
            .generator
            .generate_feedback(
                &prompts::feedback_system_prompt(),
                &prompts::feedback_user_prompt(FEEDBACK_QUESTION_ID, item),
                model,
            )
            .await
            .map_err(PipelineError::Feedback)?;

        let mut feedback = set
            .take_for(FEEDBACK_QUESTION_ID)
            .filter(|f| !f.is_empty())
            .ok_or(PipelineError::Feedback(GenerationError::EmptyResponse))?;
        for (field, text) in feedback.text_fields_mut() {
            if text.trim().is_empty() {
                text.clear();
                continue;
            }
            let result = self.verifier.verify_fragment(text, CompileContext::Answer).await;
            if let Some(reason) = result.reason() {
                obs::emit_feedback_rejected(field, reason);
                return Err(PipelineError::RejectedFeedback {
                    field,
                    reason: reason.to_string(),
                });
            }
        }
        obs::emit_feedback_verified(feedback.text_fields().len());
        Ok(feedback)
    }

    fn preflight(&self) -> Result<(), PipelineError> {
        self.generator.preflight().map_err(|err| match err {
            GenerationError::MissingCredential => PipelineError::MissingCredential,
            other => PipelineError::InvalidRequest(other.to_string()),
        })
    }

    async fn run(
        &self,
        prompt: BatchPrompt<'_>,
        target: usize,
        model: Option<&str>,
        hooks: RunHooks<'_>,
    ) -> Result<GenerationOutcome, PipelineError> {
        if target == 0 {
            return Err(PipelineError::InvalidRequest(
                "target count must be at least 1".to_string(),
            ));
        }
        if target > self.config.max_target_count {
            return Err(PipelineError::InvalidRequest(format!(
                "target count {} exceeds the limit of {}",
                target, self.config.max_target_count
            )));
        }
        self.preflight()?;
        let _pass = match &self.gate {
            Some(gate) => Some(gate.try_enter()?),
            None => None,
        };

        let run_id = Uuid::new_v4().to_string();
        let span = obs::run_span(&run_id);
        self.drive(&run_id, prompt, target, model, hooks)
            .instrument(span)
            .await
    }

    async fn drive(
        &self,
        run_id: &str,
        prompt: BatchPrompt<'_>,
        target: usize,
        model: Option<&str>,
        hooks: RunHooks<'_>,
    ) -> Result<GenerationOutcome, PipelineError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let policy = self.config.buffer_policy();
        let mut run = PipelineRun::new(target, self.config.max_retries);
        let mut intent = None;
        let mut summary_notes = None;

        obs::emit_run_started(run_id, prompt.label(), target, self.config.max_retries);

        while let Some(request_size) = run.begin_attempt(&policy) {
            let attempt = run.attempts_used() - 1;
            obs::emit_batch_requested(run_id, attempt, run.needed(), request_size);

            let (system_prompt, user_content) = prompt.render(request_size);
            let response = guarded(
                hooks.cancel,
                self.generator.generate(&system_prompt, &user_content, model),
            )
            .await?;

            let ProblemBatch {
                items,
                intent: batch_intent,
                summary_notes: batch_notes,
            } = match response {
                Ok(batch) => batch,
                Err(err) => {
                    obs::emit_batch_failed(run_id, attempt, &err);
                    run.batch_failed(err.to_string());
                    continue;
                }
            };
            run.batch_received();
            intent = intent.or(non_empty(batch_intent));
            summary_notes = summary_notes.or(non_empty(batch_notes));

            for mut candidate in items {
                if !run.wants_more() {
                    break;
                }

                ItemVerifier::repair_fields(&mut candidate);
                if run.is_duplicate(&candidate) {
                    obs::emit_item_rejected(run_id, FailureKind::ContentInvalid, "duplicate item");
                    run.reject(FailureKind::ContentInvalid, "duplicate item");
                    continue;
                }

                let result = guarded(hooks.cancel, self.verifier.verify_item(&mut candidate)).await?;
                match result {
                    VerificationResult::Passed => {
                        if run.accept(candidate).is_some() {
                            let accepted = run.accepted_count();
                            obs::emit_item_accepted(run_id, accepted, target);
                            if let Some(on_progress) = hooks.on_progress {
                                on_progress(accepted, target);
                            }
                        }
                    }
                    VerificationResult::Failed { code, reason } => {
                        obs::emit_item_rejected(run_id, code, &reason);
                        run.reject(code, &reason);
                    }
                }
            }
            run.batch_drained();
        }

        let finished_at = Utc::now();
        let duration_ms = clock.elapsed().as_millis() as u64;
        let complete = run.phase() == RunPhase::Done;
        let metadata = RunMetadata {
            run_id: run_id.to_string(),
            requested_count: target,
            accepted_count: run.accepted_count(),
            attempts: run.attempts_used(),
            batch_failures: run.batch_failures(),
            rejections: run.rejections().clone(),
            last_error: run.last_error().map(str::to_string),
            complete,
            started_at,
            finished_at,
            duration_ms,
        };
        obs::emit_run_finished(
            run_id,
            duration_ms,
            metadata.accepted_count,
            metadata.attempts,
            complete,
        );

        if metadata.accepted_count == 0 {
            return Err(PipelineError::Exhausted {
                attempts: metadata.attempts,
                last_error: metadata
                    .last_error
                    .unwrap_or_else(|| "generation service returned no candidates".to_string()),
            });
        }

        Ok(GenerationOutcome {
            items: run.into_accepted(),
            intent,
            summary_notes,
            metadata,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Await `fut` unless `cancel` fires first.
async fn guarded<F>(cancel: Option<&CancellationToken>, fut: F) -> Result<F::Output, PipelineError>
where
    F: Future,
{
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(PipelineError::Cancelled),
            output = fut => Ok(output),
        },
        None => Ok(fut.await),
    }
}
