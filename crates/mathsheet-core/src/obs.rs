//! Structured lifecycle events for generation runs and feedback requests.
//!
//! Every event carries an `event` field so JSON logs can be filtered by
//! name, e.g. `event=item.rejected`.

use tracing::{info, warn, Span};

use crate::domain::FailureKind;

/// Span tagging everything inside one generation run with its `run_id`.
///
/// Attach it with [`tracing::Instrument::instrument`] so the run future
/// stays `Send`.
pub fn run_span(run_id: &str) -> Span {
    tracing::info_span!("mathsheet.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, topic: &str, target_count: usize, max_retries: u32) {
    info!(
        event = "run.started",
        run_id = %run_id,
        topic = %topic,
        target_count = target_count,
        max_retries = max_retries,
    );
}

/// A batch of `request_size` candidates was requested on `attempt` (0-based).
pub fn emit_batch_requested(run_id: &str, attempt: u32, needed: usize, request_size: usize) {
    info!(
        event = "batch.requested",
        run_id = %run_id,
        attempt = attempt,
        needed = needed,
        request_size = request_size,
    );
}

pub fn emit_batch_failed(run_id: &str, attempt: u32, error: &dyn std::fmt::Display) {
    warn!(event = "batch.failed", run_id = %run_id, attempt = attempt, error = %error);
}

pub fn emit_item_accepted(run_id: &str, accepted: usize, target: usize) {
    info!(
        event = "item.accepted",
        run_id = %run_id,
        accepted = accepted,
        target = target,
    );
}

pub fn emit_item_rejected(run_id: &str, kind: FailureKind, reason: &str) {
    info!(
        event = "item.rejected",
        run_id = %run_id,
        code = %kind,
        reason = %reason,
    );
}

/// Delimiter repair produced a rewrite with unbalanced groups inside a
/// wrapped span. The item continues through verification.
pub fn emit_repair_ambiguous(field: &str, text: &str) {
    warn!(event = "repair.ambiguous", field = %field, text = %text);
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, accepted: usize, attempts: u32, complete: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        accepted = accepted,
        attempts = attempts,
        complete = complete,
    );
}

pub fn emit_feedback_verified(fields: usize) {
    info!(event = "feedback.verified", fields = fields);
}

pub fn emit_feedback_rejected(field: &str, reason: &str) {
    warn!(event = "feedback.rejected", field = %field, reason = %reason);
}
