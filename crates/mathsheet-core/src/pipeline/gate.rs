//! Admission control for concurrent generation runs.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::domain::PipelineError;

/// Bounds the number of simultaneous runs. Clones share the same budget.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

/// Held for the duration of one run; dropping it frees the slot.
#[derive(Debug)]
pub struct GatePass {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Take a slot without waiting, failing with [`PipelineError::Busy`].
    pub fn try_enter(&self) -> Result<GatePass, PipelineError> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .map(|permit| GatePass { _permit: permit })
            .map_err(|_| PipelineError::Busy { limit: self.limit })
    }

    /// Wait for a slot.
    pub async fn enter(&self) -> Result<GatePass, PipelineError> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map(|permit| GatePass { _permit: permit })
            .map_err(|_| PipelineError::Cancelled)
    }
}
