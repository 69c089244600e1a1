use std::time::SystemTime;

/// A request to build and run one piece of user source.
///
/// Immutable once created; the pipeline consumes it exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileRequest {
    /// Logical origin of the source, e.g. the editor tab it came from.
    pub id: String,
    pub source: String,
    pub submitted_at: SystemTime,
}

impl CompileRequest {
    pub fn new(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            submitted_at: SystemTime::now(),
        }
    }
}
