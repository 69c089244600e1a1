//! Build stage of the forge pipeline.
//!
//! Turns a [`CompileRequest`] into a native module on disk: the request's
//! source is written into the workspace, a build script is generated from the
//! [`ToolchainConfig`], the external toolchain runs it, and the outcome is
//! classified into a [`BuildResult`] with parsed diagnostics.

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod layout;
pub mod orchestrator;
pub mod request;
pub mod script;
pub mod templates;

pub use config::{EnvSetup, Flavor, Profile, ToolchainConfig};
pub use diagnostics::{DiagnosticFormat, DiagnosticRecord};
pub use error::{BuildError, Result};
pub use layout::WorkspaceLayout;
pub use orchestrator::{
    BuildResult, BuildStatus, CompileHandle, CompileOrchestrator, OutputLine, OutputSink, Severity,
};
pub use request::CompileRequest;
pub use script::{BuildScript, BUILD_MARKER, COMPILE_FAILED_EXIT, LINK_FAILED_EXIT};
