//! Engine selection and typesetting configuration.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use mathsheet_core::{ConfigError, TypesetEngine};

pub const ENV_ENGINE: &str = "PDF_ENGINE";
pub const ENV_TEX_DIR: &str = "MATHSHEET_TEX_DIR";
pub const ENV_TIMEOUT: &str = "MATHSHEET_COMPILE_TIMEOUT_SECS";
pub const ENV_SCRATCH: &str = "MATHSHEET_SCRATCH_DIR";

/// Name of the source file written into every job directory.
pub const SOURCE_FILE: &str = "main.tex";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypesetConfig {
    pub engine: TypesetEngine,
    /// Directory holding the TeX binaries, searched before `PATH`.
    pub tex_dir: Option<PathBuf>,
    /// Budget for all passes of one job.
    pub timeout_secs: u64,
    /// Parent of per-job scratch directories. System temp dir when unset.
    pub scratch_root: Option<PathBuf>,
}

impl Default for TypesetConfig {
    fn default() -> Self {
        Self {
            engine: TypesetEngine::Lualatex,
            tex_dir: None,
            timeout_secs: 60,
            scratch_root: None,
        }
    }
}

impl TypesetConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(raw) = get(ENV_ENGINE) {
            self.engine = raw
                .parse()
                .map_err(|reason| ConfigError::Invalid { field: "engine", reason })?;
        }
        if let Some(dir) = get(ENV_TEX_DIR) {
            self.tex_dir = Some(PathBuf::from(dir.trim()));
        }
        if let Some(raw) = get(ENV_TIMEOUT) {
            self.timeout_secs = raw.trim().parse().map_err(|e| ConfigError::Invalid {
                field: "timeout_secs",
                reason: format!("'{}': {}", raw.trim(), e),
            })?;
        }
        if let Some(dir) = get(ENV_SCRATCH) {
            self.scratch_root = Some(PathBuf::from(dir.trim()));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// `PATH` for engine processes: `tex_dir` first, then the inherited path.
    pub fn search_path(&self) -> Option<OsString> {
        let dir = self.tex_dir.as_ref()?;
        let inherited = std::env::var_os("PATH").unwrap_or_default();
        let paths = std::iter::once(dir.clone()).chain(std::env::split_paths(&inherited));
        std::env::join_paths(paths).ok()
    }
}

/// One engine invocation inside a job directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnginePass {
    /// Label used in diagnostics.
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    /// File the pass must leave behind, relative to the job directory.
    pub produces: String,
}

impl EnginePass {
    pub fn new(
        name: impl Into<String>,
        program: impl Into<String>,
        args: &[&str],
        produces: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            produces: produces.into(),
        }
    }
}

/// Passes that turn `main.tex` into `main.pdf` for `engine`.
pub fn passes_for(engine: TypesetEngine) -> Vec<EnginePass> {
    const TEX_FLAGS: [&str; 4] = [
        "-interaction=nonstopmode",
        "-halt-on-error",
        "-no-shell-escape",
        SOURCE_FILE,
    ];
    match engine {
        TypesetEngine::Lualatex => vec![EnginePass::new("lualatex", "lualatex", &TEX_FLAGS, "main.pdf")],
        TypesetEngine::Uplatex => vec![
            EnginePass::new("uplatex", "uplatex", &TEX_FLAGS, "main.dvi"),
            EnginePass::new("dvipdfmx", "dvipdfmx", &["main.dvi"], "main.pdf"),
        ],
    }
}
