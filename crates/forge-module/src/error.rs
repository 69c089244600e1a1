//! Error types for module loading and invocation.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ModuleError>;

#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("Failed to load module {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("Module {path} is missing required exports: {}", .missing.join(", "))]
    SymbolResolution { path: PathBuf, missing: Vec<String> },

    #[error("Failed to unload module {path}: {reason}")]
    Unload { path: PathBuf, reason: String },
}

impl ModuleError {
    pub fn load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ModuleError::Load {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn unload(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ModuleError::Unload {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Why a module invocation did not produce a result.
#[derive(Error, Debug)]
pub enum InvocationError {
    #[error("Module export resolved to null: {0}")]
    MissingExport(String),

    #[error("Module misbehaved: {0}")]
    Misbehaved(String),

    #[error("Module faulted during execution: {0}")]
    Faulted(String),

    #[error("Worker thread ended without reporting a result")]
    WorkerLost,

    #[error("Failed to start worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}
