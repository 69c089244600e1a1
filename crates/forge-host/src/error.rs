/// Error types for pipeline runs

use std::fmt;
use std::time::Duration;

use forge_build::{BuildError, BuildStatus, DiagnosticRecord};
use forge_module::{InvocationError, ModuleError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// The part of a run a timeout applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Compile,
    Invoke,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Compile => write!(f, "compilation"),
            Stage::Invoke => write!(f, "module execution"),
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("A compile/run is already in progress")]
    Busy,

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("Build failed: {}", failure_kind(.status))]
    BuildFailed {
        status: BuildStatus,
        diagnostics: Vec<DiagnosticRecord>,
        /// Combined toolchain output, for display when no diagnostic was parsed.
        raw: String,
    },

    #[error("Toolchain terminated abnormally (exit code {exit_code:?})")]
    ToolchainCrashed { exit_code: Option<i32> },

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error("Could not release the previous module: {0}")]
    ModuleUnload(#[source] ModuleError),

    #[error(transparent)]
    Invocation(#[from] InvocationError),

    #[error("{stage} timed out after {limit:?}")]
    TimedOut { stage: Stage, limit: Duration },

    #[error("Run was cancelled")]
    Cancelled,

    #[error("Pipeline task failed: {0}")]
    Task(String),
}

fn failure_kind(status: &BuildStatus) -> &'static str {
    match status {
        BuildStatus::LinkFailed => "linking failed",
        _ => "compilation errors",
    }
}
