//! Retry and backfill state machine for one generation run.
//!
//! [`transition`] is pure; [`PipelineRun`] holds the counters and the
//! accepted items and drives the phase through it.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::domain::{FailureKind, GeneratedItem, VerifiedItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Waiting to request the next batch.
    Requesting,
    /// Verifying candidates of the current batch.
    Verifying,
    /// Target reached.
    Done,
    /// Retry budget spent before the target was reached.
    Exhausted,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Done | RunPhase::Exhausted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    BatchReceived,
    BatchFailed,
    ItemAccepted,
    ItemRejected,
    BatchDrained,
}

/// Counters consulted by [`transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunCounters {
    pub accepted: usize,
    pub target: usize,
    pub attempts_used: u32,
    pub max_retries: u32,
}

impl RunCounters {
    /// Phase to take between batches.
    pub fn settle(&self) -> RunPhase {
        if self.accepted >= self.target {
            RunPhase::Done
        } else if self.attempts_used > self.max_retries {
            RunPhase::Exhausted
        } else {
            RunPhase::Requesting
        }
    }
}

/// Next phase for `event`. Terminal phases absorb every event; events that do
/// not apply to the current phase leave it unchanged.
pub fn transition(phase: RunPhase, event: RunEvent, counters: &RunCounters) -> RunPhase {
    match (phase, event) {
        (RunPhase::Done | RunPhase::Exhausted, _) => phase,
        (RunPhase::Requesting, RunEvent::BatchReceived) => RunPhase::Verifying,
        (RunPhase::Requesting, RunEvent::BatchFailed) => counters.settle(),
        (RunPhase::Verifying, RunEvent::ItemAccepted) => {
            if counters.accepted >= counters.target {
                RunPhase::Done
            } else {
                RunPhase::Verifying
            }
        }
        (RunPhase::Verifying, RunEvent::ItemRejected) => RunPhase::Verifying,
        (RunPhase::Verifying, RunEvent::BatchDrained) => counters.settle(),
        (phase, _) => phase,
    }
}

/// Over-request factors for batch sizing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferPolicy {
    first_factor: f64,
    retry_factor: f64,
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self::new(1.5, 1.2)
    }
}

impl BufferPolicy {
    pub fn new(first_factor: f64, retry_factor: f64) -> Self {
        Self {
            first_factor,
            retry_factor,
        }
    }

    /// Candidates to request on `attempt` (0-based) when `needed` are missing.
    pub fn request_size(&self, attempt: u32, needed: usize) -> usize {
        let factor = if attempt == 0 {
            self.first_factor
        } else {
            self.retry_factor
        };
        ((needed as f64 * factor).ceil() as usize).max(needed)
    }
}

/// Upper bound on the accepted-item buffer reserved up front.
const PREALLOCATED_ITEMS: usize = 64;

/// Mutable state of one generation run.
#[derive(Debug)]
pub struct PipelineRun {
    target_count: usize,
    max_retries: u32,
    accepted: Vec<VerifiedItem>,
    fingerprints: HashSet<String>,
    attempts_used: u32,
    last_error: Option<String>,
    phase: RunPhase,
    rejections: BTreeMap<FailureKind, u32>,
    batch_failures: u32,
}

impl PipelineRun {
    pub fn new(target_count: usize, max_retries: u32) -> Self {
        let mut run = Self {
            target_count,
            max_retries,
            accepted: Vec::with_capacity(target_count.min(PREALLOCATED_ITEMS)),
            fingerprints: HashSet::new(),
            attempts_used: 0,
            last_error: None,
            phase: RunPhase::Requesting,
            rejections: BTreeMap::new(),
            batch_failures: 0,
        };
        run.phase = run.counters().settle();
        run
    }

    fn counters(&self) -> RunCounters {
        RunCounters {
            accepted: self.accepted.len(),
            target: self.target_count,
            attempts_used: self.attempts_used,
            max_retries: self.max_retries,
        }
    }

    fn apply(&mut self, event: RunEvent) {
        self.phase = transition(self.phase, event, &self.counters());
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn target_count(&self) -> usize {
        self.target_count
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted.len()
    }

    pub fn needed(&self) -> usize {
        self.target_count.saturating_sub(self.accepted.len())
    }

    pub fn attempts_used(&self) -> u32 {
        self.attempts_used
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn rejections(&self) -> &BTreeMap<FailureKind, u32> {
        &self.rejections
    }

    pub fn batch_failures(&self) -> u32 {
        self.batch_failures
    }

    /// Start the next attempt and return its request size, or `None` once the
    /// run has left the requesting phase.
    pub fn begin_attempt(&mut self, policy: &BufferPolicy) -> Option<usize> {
        if self.phase != RunPhase::Requesting {
            return None;
        }
        let size = policy.request_size(self.attempts_used, self.needed());
        self.attempts_used += 1;
        Some(size)
    }

    pub fn batch_received(&mut self) {
        self.apply(RunEvent::BatchReceived);
    }

    pub fn batch_failed(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.last_error = Some(format!("{}: {}", FailureKind::Unknown, reason));
        self.batch_failures += 1;
        self.apply(RunEvent::BatchFailed);
    }

    /// True while the current batch should keep being verified.
    pub fn wants_more(&self) -> bool {
        self.phase == RunPhase::Verifying
    }

    pub fn is_duplicate(&self, item: &GeneratedItem) -> bool {
        self.fingerprints.contains(&item.fingerprint())
    }

    /// Promote `item` into the accepted list. Ignored once the target is
    /// reached.
    pub fn accept(&mut self, item: GeneratedItem) -> Option<&VerifiedItem> {
        if self.phase != RunPhase::Verifying || self.accepted.len() >= self.target_count {
            return None;
        }
        let verified = VerifiedItem::promote(item);
        self.fingerprints.insert(verified.fingerprint().to_string());
        self.accepted.push(verified);
        self.apply(RunEvent::ItemAccepted);
        self.accepted.last()
    }

    pub fn reject(&mut self, kind: FailureKind, reason: &str) {
        *self.rejections.entry(kind).or_insert(0) += 1;
        self.last_error = Some(format!("{}: {}", kind, reason));
        self.apply(RunEvent::ItemRejected);
    }

    /// The current batch has no candidates left.
    pub fn batch_drained(&mut self) {
        self.apply(RunEvent::BatchDrained);
    }

    pub fn into_accepted(self) -> Vec<VerifiedItem> {
        self.accepted
    }
}
