//! Runs the generated build script and classifies its outcome.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::config::{Flavor, ToolchainConfig};
use crate::diagnostics::{self, DiagnosticFormat, DiagnosticRecord};
use crate::error::{BuildError, Result};
use crate::layout::WorkspaceLayout;
use crate::request::CompileRequest;
use crate::script::{BuildScript, BUILD_MARKER};
use crate::templates;

/// Severity of a raw toolchain output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Error,
}

/// One line of raw toolchain output, forwarded while the build runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub severity: Severity,
    pub text: String,
}

/// A sink for live toolchain output.
pub type OutputSink = UnboundedSender<OutputLine>;

/// How the toolchain run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    /// Compiled and linked.
    Succeeded,
    /// The compiler reported errors; nothing was linked.
    CompileFailed,
    /// Compilation passed but the link step failed.
    LinkFailed,
    /// The toolchain terminated abnormally; no diagnostics are available.
    Crashed,
}

impl BuildStatus {
    /// Classify a script exit code.
    ///
    /// `None` means the process was terminated by a signal.
    pub fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => BuildStatus::Succeeded,
            Some(1) | Some(2) => BuildStatus::CompileFailed,
            // NTSTATUS error codes (access violation, stack overflow). Elsewhere a
            // negative code is an ordinary failure from the link step.
            Some(code) if cfg!(windows) && code as u32 >= 0xC000_0000 => BuildStatus::Crashed,
            Some(_) => BuildStatus::LinkFailed,
            None => BuildStatus::Crashed,
        }
    }

    pub fn has_diagnostics(self) -> bool {
        matches!(self, BuildStatus::CompileFailed | BuildStatus::LinkFailed)
    }
}

/// Outcome of one toolchain run. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    pub status: BuildStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub diagnostics: Vec<DiagnosticRecord>,
}

impl BuildResult {
    pub fn succeeded(&self) -> bool {
        self.status == BuildStatus::Succeeded
    }

    /// Combined raw output, for display when no diagnostics were recognised.
    pub fn raw_output(&self) -> String {
        let mut raw = self.stdout.clone();
        if !raw.is_empty() && !raw.ends_with('\n') {
            raw.push('\n');
        }
        raw.push_str(&self.stderr);
        raw
    }
}

/// How long output pipes may stay open after the script exits.
///
/// A process the toolchain left behind can hold them open indefinitely.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Writes sources, generates the script and runs the toolchain.
#[derive(Debug, Clone)]
pub struct CompileOrchestrator {
    config: ToolchainConfig,
    layout: WorkspaceLayout,
}

impl CompileOrchestrator {
    pub fn new(config: ToolchainConfig, layout: WorkspaceLayout) -> Self {
        Self { config, layout }
    }

    pub fn config(&self) -> &ToolchainConfig {
        &self.config
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    /// Start a build for `request`.
    ///
    /// Prepares the workspace, overwrites the user source file, clears the
    /// previous build products and spawns the script. File work runs on the
    /// blocking pool. Output is forwarded to `sink` as it arrives.
    pub async fn start(&self, request: &CompileRequest, sink: Option<OutputSink>) -> Result<CompileHandle> {
        for tool in [&self.config.compiler, &self.config.linker()] {
            if tool.is_absolute() && !tool.exists() {
                return Err(BuildError::ProcessSpawn {
                    program: tool.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "toolchain executable not found"),
                });
            }
        }

        let config = self.config.clone();
        let layout = self.layout.clone();
        let source = request.source.clone();
        let script_path = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            layout.prepare()?;
            std::fs::write(layout.user_source_path(), source)?;
            std::fs::write(layout.entry_source_path(), templates::entry_source())?;
            layout.clean_outputs()?;
            BuildScript::generate(&config, &layout).write()
        })
        .await
        .map_err(|e| BuildError::Output(format!("workspace task failed: {}", e)))??;

        let (shell, shell_args): (PathBuf, &[&str]) = match self.config.flavor {
            Flavor::Msvc => (PathBuf::from("cmd"), &["/C"]),
            Flavor::Gnu => (PathBuf::from("sh"), &[]),
        };

        tracing::info!(request = %request.id, script = %script_path.display(), "starting toolchain");

        let mut command = Command::new(&shell);
        command
            .args(shell_args)
            .arg(&script_path)
            .current_dir(self.layout.temp_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Compiler and linker join the script's group so they can be killed together.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| BuildError::ProcessSpawn {
            program: shell.clone(),
            source,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BuildError::Output("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BuildError::Output("stderr was not captured".to_string()))?;

        Ok(CompileHandle {
            pid: child.id(),
            child,
            stdout: Capture::spawn(stdout, Severity::Info, sink.clone()),
            stderr: Capture::spawn(stderr, Severity::Error, sink),
            format: DiagnosticFormat::for_flavor(self.config.flavor),
            source_path: self.layout.user_source_path(),
        })
    }
}

/// A running toolchain process.
///
/// Dropping a handle that was not waited for kills the script, and on unix its
/// whole process group.
pub struct CompileHandle {
    child: Child,
    pid: Option<u32>,
    stdout: Capture,
    stderr: Capture,
    format: DiagnosticFormat,
    source_path: PathBuf,
}

impl CompileHandle {
    /// Wait for the toolchain to exit and classify the result.
    ///
    /// Returns once the script has exited and its output is drained. Processes
    /// still holding the output pipes after [`OUTPUT_DRAIN_GRACE`] are killed.
    pub async fn wait(&mut self) -> Result<BuildResult> {
        let status = self.child.wait().await?;

        let drained = tokio::time::timeout(OUTPUT_DRAIN_GRACE, async {
            self.stdout.finished().await?;
            self.stderr.finished().await
        })
        .await;
        match drained {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!("toolchain left processes holding its output open; killing them");
                if let Some(pid) = self.pid {
                    kill_tree(pid).await;
                }
                self.stdout.abort();
                self.stderr.abort();
            }
        }
        self.pid = None;
        let stdout = self.stdout.take();
        let stderr = self.stderr.take();

        let exit_code = status.code();
        let build_status = BuildStatus::from_exit_code(exit_code);
        tracing::info!(?exit_code, status = ?build_status, "toolchain finished");

        let diagnostics = if build_status.has_diagnostics() {
            let mut raw = stdout.clone();
            raw.push('\n');
            raw.push_str(&stderr);
            diagnostics::parse_with(
                self.format,
                &raw,
                BUILD_MARKER,
                &self.source_path.display().to_string(),
            )
        } else {
            Vec::new()
        };

        Ok(BuildResult {
            status: build_status,
            exit_code,
            stdout,
            stderr,
            diagnostics,
        })
    }

    /// Terminate the script together with every compiler and linker it started.
    ///
    /// Returns after the script has exited.
    pub async fn kill(&mut self) -> Result<()> {
        tracing::warn!("killing toolchain process tree");
        if let Some(pid) = self.pid.take() {
            kill_tree(pid).await;
        }
        // Already gone if the tree kill reached it.
        let _ = self.child.start_kill();
        self.child.wait().await?;
        self.stdout.abort();
        self.stderr.abort();
        Ok(())
    }
}

#[cfg(unix)]
impl Drop for CompileHandle {
    fn drop(&mut self) {
        if let Some(pid) = self.pid {
            if matches!(self.child.try_wait(), Ok(None)) {
                kill_group(pid);
            }
        }
    }
}

#[cfg(unix)]
async fn kill_tree(pid: u32) {
    kill_group(pid);
}

#[cfg(windows)]
async fn kill_tree(pid: u32) {
    let killed = Command::new("taskkill")
        .args(["/T", "/F", "/PID"])
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = killed {
        tracing::warn!(pid, "taskkill failed: {}", e);
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    let Ok(pgid) = i32::try_from(pid) else {
        return;
    };
    // SAFETY: signals the process group created for the script at spawn.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        tracing::debug!(pid, "process group already gone");
    }
}

/// Output of one stream, collected by a background task.
struct Capture {
    text: Arc<Mutex<String>>,
    task: JoinHandle<std::io::Result<()>>,
    done: bool,
}

impl Capture {
    fn spawn<R>(reader: R, severity: Severity, sink: Option<OutputSink>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let text = Arc::new(Mutex::new(String::new()));
        let captured = Arc::clone(&text);
        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut bytes = Vec::new();
            loop {
                bytes.clear();
                if reader.read_until(b'\n', &mut bytes).await? == 0 {
                    return Ok(());
                }
                // Toolchains print in the console code page; keep whatever decodes.
                let line = String::from_utf8_lossy(&bytes);
                let line = line.trim_end_matches(['\r', '\n']);
                {
                    let mut captured = lock(&captured);
                    captured.push_str(line);
                    captured.push('\n');
                }
                if let Some(sink) = &sink {
                    let _ = sink.send(OutputLine {
                        severity,
                        text: line.to_string(),
                    });
                }
            }
        });
        Self {
            text,
            task,
            done: false,
        }
    }

    /// Wait until the stream reaches end of file.
    async fn finished(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        let joined = (&mut self.task).await;
        self.done = true;
        match joined {
            Ok(result) => result.map_err(BuildError::from),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(BuildError::Output(e.to_string())),
        }
    }

    fn abort(&self) {
        self.task.abort();
    }

    /// Everything read so far.
    fn take(&self) -> String {
        std::mem::take(&mut *lock(&self.text))
    }
}

fn lock(text: &Mutex<String>) -> MutexGuard<'_, String> {
    text.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
