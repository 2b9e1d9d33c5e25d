//! Compile check against the real typesetting engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::{CompileError, FailureKind, VerificationResult};
use crate::layout::{CompileContext, SheetLayout};

/// Typesetting collaborator: full document source in, PDF bytes out.
///
/// Implementations own process lifetime. They must enforce their own
/// timeout and terminate the engine when the returned future is dropped.
#[async_trait]
pub trait Compiler: Send + Sync {
    async fn compile(&self, source: &str) -> Result<Vec<u8>, CompileError>;
}

/// Wraps fragments in the sheet skeleton and compiles them.
#[derive(Clone)]
pub struct CompileVerifier {
    compiler: Arc<dyn Compiler>,
    layout: SheetLayout,
    timeout: Duration,
}

impl CompileVerifier {
    pub fn new(compiler: Arc<dyn Compiler>, layout: SheetLayout, timeout: Duration) -> Self {
        Self {
            compiler,
            layout,
            timeout,
        }
    }

    pub fn layout(&self) -> SheetLayout {
        self.layout
    }

    /// Compile `fragment` in its display context. The produced document is
    /// discarded; only success or the engine diagnostic matters.
    pub async fn check_compilation(
        &self,
        fragment: &str,
        context: CompileContext,
    ) -> VerificationResult {
        let source = self.layout.probe_document(fragment, context);
        match tokio::time::timeout(self.timeout, self.compiler.compile(&source)).await {
            Ok(Ok(artifact)) => {
                debug!(context = ?context, bytes = artifact.len(), "fragment compiled");
                VerificationResult::Passed
            }
            Ok(Err(err)) => VerificationResult::failed(FailureKind::CompileFailed, err.to_string()),
            Err(_) => VerificationResult::failed(
                FailureKind::CompileFailed,
                CompileError::Timeout {
                    timeout_secs: self.timeout.as_secs(),
                }
                .to_string(),
            ),
        }
    }
}
