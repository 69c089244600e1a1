//! Runs a loaded module on its own worker thread.
//!
//! The worker calls the entry point once and then drains the module's three
//! export collections (messages, dialog requests, models) into host-owned
//! values. Strings are copied as soon as they are read; model pointers change
//! owner. The result is delivered through a oneshot channel so the caller's
//! thread never blocks on user code.

use std::ffi::{c_char, c_int, CStr};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::oneshot;

use crate::abi::{BoundSurface, ModuleSurface};
use crate::dynamic::DynamicModule;
use crate::error::InvocationError;
use crate::loader::LoadedModule;
use crate::result::{DialogRequest, DisplayStyle, ExecutionResult, GeometryItem, Message, NativeHandle};

type Outcome = Result<ExecutionResult, InvocationError>;

/// Upper bound on slots reserved up front from a module-reported count.
const PREALLOC_LIMIT: c_int = 1024;

/// Starts module invocations.
pub struct ModuleInvoker;

impl ModuleInvoker {
    /// Run `module` on a dedicated worker thread.
    ///
    /// The worker holds a reference to the module until it finishes, which
    /// keeps the loader from unloading it underneath the running code.
    pub fn invoke<M: DynamicModule>(module: Arc<LoadedModule<M>>) -> Result<Invocation, InvocationError> {
        let (tx, rx) = oneshot::channel::<Outcome>();
        let path = module.path().display().to_string();

        let thread = std::thread::Builder::new()
            .name("forge-module".to_string())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| drain(module.surface())))
                    .unwrap_or_else(|payload| Err(InvocationError::Faulted(panic_text(payload.as_ref()))));
                // Release the module before reporting so the receiver may unload it.
                drop(module);
                let _ = tx.send(outcome);
            })?;

        tracing::debug!(module = %path, "invocation started");
        Ok(Invocation {
            receiver: rx,
            thread: Some(thread),
        })
    }
}

/// A module run in progress.
pub struct Invocation {
    receiver: oneshot::Receiver<Outcome>,
    thread: Option<JoinHandle<()>>,
}

impl Invocation {
    /// Wait for the worker to report, then join it.
    pub async fn wait(&mut self) -> Outcome {
        let outcome = (&mut self.receiver)
            .await
            .unwrap_or(Err(InvocationError::WorkerLost));

        if let Some(thread) = self.thread.take() {
            let joined = tokio::task::spawn_blocking(move || thread.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                tracing::error!("module worker did not exit cleanly");
            }
        }
        outcome
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Stop waiting for a worker that is still running.
    ///
    /// The thread keeps running and keeps its module reference, so the module
    /// stays loaded until the user code returns on its own.
    pub fn abandon(mut self) {
        if let Some(thread) = self.thread.take() {
            tracing::warn!(
                thread = ?thread.thread().name(),
                "abandoning running module worker; module stays loaded until it returns"
            );
        }
    }
}

/// Call the entry point and copy out everything the module exported.
///
/// Makes no call at all if any export is missing. An exception the module
/// caught and reported through `get_fault` fails the run.
pub fn drain(surface: &ModuleSurface) -> Outcome {
    let exports = surface
        .bind()
        .map_err(|missing| InvocationError::MissingExport(missing.join(", ")))?;

    // SAFETY: every function pointer was resolved from the module under its
    // ABI name and the module is kept loaded for the duration of this call.
    unsafe {
        let success = (exports.entry_point)();
        if let Some(fault) = exports.fault {
            let text = fault();
            if !text.is_null() {
                return Err(InvocationError::Faulted(CStr::from_ptr(text).to_string_lossy().into_owned()));
            }
        }
        let messages = drain_messages(&exports)?;
        let dialogs = drain_dialogs(&exports)?;
        let models = drain_models(&exports)?;

        Ok(ExecutionResult {
            success,
            models,
            messages,
            dialogs,
        })
    }
}

unsafe fn drain_messages(exports: &BoundSurface) -> Result<Vec<Message>, InvocationError> {
    let count = bounded((exports.messages_size)(), "get_messages_size")?;
    (0..count)
        .map(|i| copy_string((exports.message)(i), "get_message", i).map(|text| Message { text }))
        .collect()
}

unsafe fn drain_dialogs(exports: &BoundSurface) -> Result<Vec<DialogRequest>, InvocationError> {
    let count = bounded((exports.message_boxes_size)(), "get_messageBoxes_size")?;
    (0..count)
        .map(|i| {
            let title = copy_string((exports.message_box_title)(i), "get_messageBoxTitle", i)?;
            let text = copy_string((exports.message_box_text)(i), "get_messageBoxText", i)?;
            Ok(DialogRequest { title, text })
        })
        .collect()
}

unsafe fn drain_models(exports: &BoundSurface) -> Result<Vec<GeometryItem>, InvocationError> {
    let count = bounded((exports.models_size)(), "get_models_size")?;
    let mut models = Vec::with_capacity(count.min(PREALLOC_LIMIT) as usize);
    for i in 0..count {
        let Some(ptr) = NonNull::new((exports.model)(i)) else {
            if !models.is_empty() {
                tracing::warn!(count = models.len(), "dropping ownership of models drained before the failure");
            }
            return Err(InvocationError::Misbehaved(format!("get_model({}) returned null", i)));
        };
        let style = DisplayStyle::from_raw((*ptr.as_ptr()).style);
        models.push(GeometryItem {
            style,
            handle: NativeHandle::new(ptr),
        });
    }
    Ok(models)
}

fn bounded(size: usize, export: &str) -> Result<c_int, InvocationError> {
    c_int::try_from(size)
        .map_err(|_| InvocationError::Misbehaved(format!("{}() returned {} items", export, size)))
}

unsafe fn copy_string(ptr: *const c_char, export: &str, index: c_int) -> Result<String, InvocationError> {
    if ptr.is_null() {
        return Err(InvocationError::Misbehaved(format!(
            "{}({}) returned null",
            export, index
        )));
    }
    Ok(CStr::from_ptr(ptr).to_string_lossy().into_owned())
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown exception".to_string()
    }
}
