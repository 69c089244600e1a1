//! Caller-facing progress events.

use forge_build::{BuildStatus, DiagnosticRecord, Severity};
use forge_module::{DialogRequest, ExecutionResult, Message};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Something that happened during a run, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    CompileStarted {
        request_id: String,
    },
    /// A raw toolchain output line.
    OutputLine {
        severity: Severity,
        text: String,
    },
    CompileFinished {
        status: BuildStatus,
        exit_code: Option<i32>,
    },
    /// Emitted for failed compiles and links, possibly with no records.
    DiagnosticsReady {
        diagnostics: Vec<DiagnosticRecord>,
    },
    ExecutionFinished {
        success: bool,
        messages: Vec<Message>,
        dialogs: Vec<DialogRequest>,
        model_count: usize,
    },
    RunFailed {
        reason: String,
    },
}

impl PipelineEvent {
    pub(crate) fn finished(result: &ExecutionResult) -> Self {
        PipelineEvent::ExecutionFinished {
            success: result.success,
            messages: result.messages.clone(),
            dialogs: result.dialogs.clone(),
            model_count: result.models.len(),
        }
    }

    /// Whether this event ends a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineEvent::ExecutionFinished { .. } | PipelineEvent::RunFailed { .. }
        )
    }
}

pub type EventStream = UnboundedReceiver<PipelineEvent>;
pub(crate) type EventSink = UnboundedSender<PipelineEvent>;
