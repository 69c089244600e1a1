//! Single-flight compile → load → run sequencing.
//!
//! A [`Pipeline`] accepts one [`CompileRequest`] at a time. Each accepted
//! request becomes a tokio task that releases the previous module, runs the
//! toolchain, loads the result and invokes it, reporting progress as
//! [`PipelineEvent`]s and the final outcome through a [`RunHandle`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use forge_build::{
    BuildResult, BuildStatus, CompileOrchestrator, CompileRequest, OutputLine, ToolchainConfig,
    WorkspaceLayout,
};
use forge_module::{
    DynamicModule, ExecutionResult, LibraryModule, LoadedModule, ModuleInvoker, ModuleLoader, ModuleState,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, Result, Stage};
use crate::events::{EventSink, EventStream, PipelineEvent};

/// Limits applied to every run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    pub compile_timeout: Duration,
    pub invoke_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            compile_timeout: Duration::from_secs(120),
            invoke_timeout: Duration::from_secs(30),
        }
    }
}

/// Owns the toolchain orchestrator and the module loader.
pub struct Pipeline<M: DynamicModule = LibraryModule> {
    orchestrator: Arc<CompileOrchestrator>,
    loader: Arc<Mutex<ModuleLoader<M>>>,
    options: PipelineOptions,
    events: EventSink,
    in_flight: Arc<AtomicBool>,
}

impl<M: DynamicModule> Pipeline<M> {
    pub fn new(config: ToolchainConfig, layout: WorkspaceLayout, options: PipelineOptions) -> (Self, EventStream) {
        let (events, stream) = mpsc::unbounded_channel();
        let pipeline = Self {
            orchestrator: Arc::new(CompileOrchestrator::new(config, layout)),
            loader: Arc::new(Mutex::new(ModuleLoader::new())),
            options,
            events,
            in_flight: Arc::new(AtomicBool::new(false)),
        };
        (pipeline, stream)
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        self.orchestrator.layout()
    }

    /// Whether a run is in flight.
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn module_state(&self) -> ModuleState {
        lock(&self.loader).state()
    }

    /// Number of modules loaded so far.
    pub fn load_count(&self) -> u64 {
        lock(&self.loader).load_count()
    }

    /// Start a run for `request`.
    ///
    /// Never waits for the run. Fails with [`PipelineError::Busy`] while
    /// another run is in flight. Must be called from within a tokio runtime.
    pub fn submit(&self, request: CompileRequest) -> Result<RunHandle> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!(request = %request.id, "rejecting request; a run is already in progress");
            return Err(PipelineError::Busy);
        }

        let token = CancellationToken::new();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let run = Run {
            orchestrator: Arc::clone(&self.orchestrator),
            loader: Arc::clone(&self.loader),
            options: self.options,
            events: self.events.clone(),
            token: token.clone(),
        };
        let flight = FlightGuard(Arc::clone(&self.in_flight));
        let request_id = request.id.clone();

        tokio::spawn(async move {
            let outcome = run.execute(request).await;
            match &outcome {
                Ok(result) => run.emit(PipelineEvent::finished(result)),
                Err(e) => {
                    tracing::error!("run failed: {}", e);
                    run.emit(PipelineEvent::RunFailed { reason: e.to_string() });
                }
            }
            drop(flight);
            let _ = outcome_tx.send(outcome);
        });

        Ok(RunHandle {
            request_id,
            token,
            outcome: outcome_rx,
        })
    }

    /// Unload the current module, if any.
    pub async fn unload(&self) -> Result<()> {
        if self.is_busy() {
            return Err(PipelineError::Busy);
        }
        with_loader(&self.loader, |loader| loader.unload())
            .await?
            .map_err(PipelineError::ModuleUnload)
    }
}

/// Handle to a submitted run.
pub struct RunHandle {
    request_id: String,
    token: CancellationToken,
    outcome: oneshot::Receiver<Result<ExecutionResult>>,
}

impl RunHandle {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Ask the run to stop. A running toolchain is killed; a running module
    /// is abandoned.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// A token that cancels this run, for use from other tasks.
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for the run to end.
    pub async fn outcome(self) -> Result<ExecutionResult> {
        self.outcome
            .await
            .unwrap_or_else(|_| Err(PipelineError::Task("run ended without an outcome".to_string())))
    }
}

/// Clears the single-flight flag when a run ends, however it ends.
struct FlightGuard(Arc<AtomicBool>);

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Run<M: DynamicModule> {
    orchestrator: Arc<CompileOrchestrator>,
    loader: Arc<Mutex<ModuleLoader<M>>>,
    options: PipelineOptions,
    events: EventSink,
    token: CancellationToken,
}

impl<M: DynamicModule> Run<M> {
    fn emit(&self, event: PipelineEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    async fn execute(&self, request: CompileRequest) -> Result<ExecutionResult> {
        tracing::info!(request = %request.id, "run started");
        self.emit(PipelineEvent::CompileStarted {
            request_id: request.id.clone(),
        });

        with_loader(&self.loader, |loader| loader.unload())
            .await?
            .map_err(PipelineError::ModuleUnload)?;

        let build = self.compile(&request).await?;

        self.emit(PipelineEvent::CompileFinished {
            status: build.status,
            exit_code: build.exit_code,
        });
        match build.status {
            BuildStatus::Succeeded => {}
            BuildStatus::Crashed => {
                return Err(PipelineError::ToolchainCrashed {
                    exit_code: build.exit_code,
                })
            }
            BuildStatus::CompileFailed | BuildStatus::LinkFailed => {
                self.emit(PipelineEvent::DiagnosticsReady {
                    diagnostics: build.diagnostics.clone(),
                });
                let raw = build.raw_output();
                return Err(PipelineError::BuildFailed {
                    status: build.status,
                    diagnostics: build.diagnostics,
                    raw,
                });
            }
        }

        if self.token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let path = self.orchestrator.layout().module_path();
        let module = with_loader(&self.loader, move |loader| loader.load(path)).await??;

        if self.token.is_cancelled() {
            drop(module);
            self.release().await;
            return Err(PipelineError::Cancelled);
        }
        self.invoke(module).await
    }

    async fn compile(&self, request: &CompileRequest) -> Result<BuildResult> {
        let (sink, mut lines) = mpsc::unbounded_channel::<OutputLine>();
        let events = self.events.clone();
        let forward = tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                let _ = events.send(PipelineEvent::OutputLine {
                    severity: line.severity,
                    text: line.text,
                });
            }
        });

        let mut handle = self.orchestrator.start(request, Some(sink)).await?;
        let limit = self.options.compile_timeout;

        let finished = tokio::select! {
            result = handle.wait() => Ok(result),
            _ = tokio::time::sleep(limit) => Err(PipelineError::TimedOut { stage: Stage::Compile, limit }),
            _ = self.token.cancelled() => Err(PipelineError::Cancelled),
        };

        match finished {
            Ok(Ok(result)) => {
                // Every output line is delivered before the build is reported.
                let _ = forward.await;
                Ok(result)
            }
            Ok(Err(e)) => {
                forward.abort();
                Err(e.into())
            }
            Err(e) => {
                // The whole toolchain is gone before the run reports its end.
                if let Err(kill) = handle.kill().await {
                    tracing::warn!("failed to kill toolchain: {}", kill);
                }
                forward.abort();
                Err(e)
            }
        }
    }

    async fn invoke(&self, module: Arc<LoadedModule<M>>) -> Result<ExecutionResult> {
        let mut invocation = match ModuleInvoker::invoke(module) {
            Ok(invocation) => invocation,
            Err(e) => {
                self.release().await;
                return Err(e.into());
            }
        };
        let limit = self.options.invoke_timeout;

        let outcome = tokio::select! {
            result = invocation.wait() => result.map_err(PipelineError::from),
            _ = tokio::time::sleep(limit) => Err(PipelineError::TimedOut { stage: Stage::Invoke, limit }),
            _ = self.token.cancelled() => Err(PipelineError::Cancelled),
        };

        match outcome {
            Ok(result) => {
                tracing::info!(
                    success = result.success,
                    models = result.models.len(),
                    messages = result.messages.len(),
                    "module finished"
                );
                Ok(result)
            }
            Err(e @ (PipelineError::TimedOut { .. } | PipelineError::Cancelled)) => {
                invocation.abandon();
                Err(e)
            }
            Err(e) => {
                self.release().await;
                Err(e)
            }
        }
    }

    /// Unload after a failed run; the run's own error takes precedence.
    async fn release(&self) {
        match with_loader(&self.loader, |loader| loader.unload()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("failed to unload module after failed run: {}", e),
            Err(e) => tracing::error!("{}", e),
        }
    }
}

/// Run `f` against the loader on the blocking pool.
async fn with_loader<M, T, F>(loader: &Arc<Mutex<ModuleLoader<M>>>, f: F) -> Result<T>
where
    M: DynamicModule,
    T: Send + 'static,
    F: FnOnce(&mut ModuleLoader<M>) -> T + Send + 'static,
{
    let loader = Arc::clone(loader);
    tokio::task::spawn_blocking(move || f(&mut lock(&loader)))
        .await
        .map_err(|e| PipelineError::Task(format!("loader task failed: {}", e)))
}

fn lock<M: DynamicModule>(loader: &Mutex<ModuleLoader<M>>) -> std::sync::MutexGuard<'_, ModuleLoader<M>> {
    loader.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
