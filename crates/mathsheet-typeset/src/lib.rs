//! TeX engine invocation for mathsheet.
//!
//! [`LatexCompiler`] implements [`mathsheet_core::Compiler`]: it writes the
//! document into a scratch directory, runs the engine passes under one
//! deadline and returns the PDF bytes.

pub mod compiler;
pub mod engine;
pub mod runner;

pub use compiler::LatexCompiler;
pub use engine::{passes_for, EnginePass, TypesetConfig};
pub use runner::{run_pass, PassOutput};
