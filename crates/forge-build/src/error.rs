/// Error types for the forge build stage

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BuildError>;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Build directory {path} is not usable: {reason}")]
    Setup { path: PathBuf, reason: String },

    #[error("Failed to start toolchain {program}: {source}")]
    ProcessSpawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid toolchain configuration in {path}: {message}")]
    Config { path: PathBuf, message: String },

    #[error("Toolchain output stream failed: {0}")]
    Output(String),
}

impl BuildError {
    pub fn setup(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        BuildError::Setup {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn config(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        BuildError::Config {
            path: path.into(),
            message: message.into(),
        }
    }
}
