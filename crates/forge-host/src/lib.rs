//! forge host
//!
//! Ties the build and module stages together: one request at a time is
//! compiled, loaded and run, with progress reported as events.

pub mod error;
pub mod events;
pub mod pipeline;

pub use error::{PipelineError, Result, Stage};
pub use events::{EventStream, PipelineEvent};
pub use pipeline::{Pipeline, PipelineOptions, RunHandle};
