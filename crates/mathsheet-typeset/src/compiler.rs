//! `Compiler` implementation backed by a local TeX installation.

use std::path::Path;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use mathsheet_core::{CompileError, Compiler};

use crate::engine::{passes_for, EnginePass, TypesetConfig, SOURCE_FILE};
use crate::runner::run_pass;

/// Compiles documents in a fresh scratch directory per job.
///
/// A pass that exits non-zero but leaves its output file behind counts as
/// successful; TeX engines report recoverable problems through the exit code.
#[derive(Debug, Clone)]
pub struct LatexCompiler {
    config: TypesetConfig,
    passes: Vec<EnginePass>,
}

impl LatexCompiler {
    pub fn new(config: TypesetConfig) -> Self {
        let passes = passes_for(config.engine);
        Self { config, passes }
    }

    /// Use custom passes instead of the engine defaults.
    pub fn with_passes(config: TypesetConfig, passes: Vec<EnginePass>) -> Self {
        Self { config, passes }
    }

    pub fn config(&self) -> &TypesetConfig {
        &self.config
    }

    pub fn passes(&self) -> &[EnginePass] {
        &self.passes
    }

    /// Whether every program of the pipeline can be launched.
    pub async fn is_available(&self) -> bool {
        let search_path = self.config.search_path();
        for pass in &self.passes {
            let mut command = tokio::process::Command::new(&pass.program);
            command
                .arg("--version")
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .kill_on_drop(true);
            if let Some(path) = &search_path {
                command.env("PATH", path);
            }
            let status = tokio::time::timeout(self.config.timeout(), command.status()).await;
            if !matches!(status, Ok(Ok(s)) if s.success()) {
                debug!(program = %pass.program, "engine program unavailable");
                return false;
            }
        }
        true
    }

    async fn scratch_dir(&self) -> Result<TempDir, CompileError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("mathsheet-");
        let dir = match &self.config.scratch_root {
            Some(root) => {
                tokio::fs::create_dir_all(root).await?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    async fn run_passes(&self, workdir: &Path) -> Result<Vec<u8>, CompileError> {
        let search_path = self.config.search_path();
        let deadline = Instant::now() + self.config.timeout();

        for pass in &self.passes {
            let output = run_pass(
                pass,
                workdir,
                search_path.as_deref(),
                deadline,
                self.config.timeout_secs,
            )
            .await?;

            let produced = tokio::fs::try_exists(workdir.join(&pass.produces))
                .await
                .unwrap_or(false);
            if !produced {
                return Err(CompileError::Failed {
                    engine: pass.name.clone(),
                    exit_code: output.exit_code,
                    stderr: output.stderr,
                    stdout: output.stdout,
                });
            }
            if !output.success() {
                warn!(
                    pass = %pass.name,
                    exit_code = output.exit_code,
                    "engine exited non-zero but produced output; accepting"
                );
            }
        }

        let artifact = self
            .passes
            .last()
            .map(|p| p.produces.as_str())
            .unwrap_or(SOURCE_FILE);
        Ok(tokio::fs::read(workdir.join(artifact)).await?)
    }
}

#[async_trait]
impl Compiler for LatexCompiler {
    #[instrument(skip(self, source), fields(engine = %self.config.engine, bytes = source.len()))]
    async fn compile(&self, source: &str) -> Result<Vec<u8>, CompileError> {
        let scratch = self.scratch_dir().await?;
        tokio::fs::write(scratch.path().join(SOURCE_FILE), source).await?;
        let result = self.run_passes(scratch.path()).await;
        if let Err(e) = scratch.close() {
            debug!(error = %e, "failed to remove scratch directory");
        }
        result
    }
}
