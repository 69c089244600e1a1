/// forge CLI

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use forge_build::{
    diagnostics, BuildScript, CompileRequest, DiagnosticFormat, Flavor, Severity, ToolchainConfig,
    WorkspaceLayout, BUILD_MARKER,
};
use forge_host::{EventStream, Pipeline, PipelineError, PipelineEvent, PipelineOptions};
use forge_module::LibraryModule;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "forge")]
#[command(about = "Compile C++ against the CAD kernel, load the result and run it")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile, load and run a source file
    Run {
        /// User C++ source file
        #[arg(value_name = "FILE")]
        input: PathBuf,

        #[command(flatten)]
        workspace: Workspace,

        /// Seconds the toolchain may run
        #[arg(long, value_name = "SECS", default_value_t = 120)]
        compile_timeout: u64,

        /// Seconds the module's entry point may run
        #[arg(long, value_name = "SECS", default_value_t = 30)]
        invoke_timeout: u64,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Print the build script that would be generated
    Script {
        #[command(flatten)]
        workspace: Workspace,
    },

    /// Parse a saved toolchain log into diagnostics
    Diagnostics {
        /// Toolchain output log
        #[arg(value_name = "LOG")]
        log: PathBuf,

        /// Marker line; output before its last occurrence is ignored
        #[arg(long, default_value = BUILD_MARKER)]
        marker: String,

        /// Source path to strip from each line
        #[arg(long, default_value = "")]
        source_path: String,

        /// Parse GNU-style `file:line:col:` diagnostics
        #[arg(long)]
        gnu: bool,
    },
}

#[derive(clap::Args, Debug)]
struct Workspace {
    /// Toolchain configuration (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory for the build script, sources and build output
    #[arg(long, value_name = "DIR")]
    temp_dir: Option<PathBuf>,

    /// Directory holding the support header and static library
    #[arg(long, value_name = "DIR")]
    user_dir: Option<PathBuf>,
}

impl Workspace {
    fn resolve(&self) -> anyhow::Result<(ToolchainConfig, WorkspaceLayout)> {
        let config = match &self.config {
            Some(path) => ToolchainConfig::load(path)?,
            None => ToolchainConfig::for_host(),
        };
        let temp_dir = match &self.temp_dir {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir().join("forge"),
        };
        let user_dir = match &self.user_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?.join("forge"),
        };
        let layout = WorkspaceLayout::new(temp_dir, user_dir, config.flavor);
        Ok((config, layout))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Command::Run {
            input,
            workspace,
            compile_timeout,
            invoke_timeout,
            json,
        } => {
            let options = PipelineOptions {
                compile_timeout: Duration::from_secs(compile_timeout),
                invoke_timeout: Duration::from_secs(invoke_timeout),
            };
            run(&input, &workspace, options, json).await
        }
        Command::Script { workspace } => {
            let (config, layout) = workspace.resolve()?;
            print!("{}", BuildScript::generate(&config, &layout).render());
            Ok(())
        }
        Command::Diagnostics {
            log,
            marker,
            source_path,
            gnu,
        } => {
            let raw = std::fs::read_to_string(&log)
                .with_context(|| format!("Failed to read {}", log.display()))?;
            let format = if gnu {
                DiagnosticFormat::for_flavor(Flavor::Gnu)
            } else {
                DiagnosticFormat::for_flavor(Flavor::Msvc)
            };
            for record in diagnostics::parse_with(format, &raw, &marker, &source_path) {
                println!("{}: {}", record.line, record.message);
            }
            Ok(())
        }
    }
}

async fn run(input: &Path, workspace: &Workspace, options: PipelineOptions, json: bool) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let (config, layout) = workspace.resolve()?;

    let (pipeline, events) = Pipeline::<LibraryModule>::new(config, layout, options);
    let printer = tokio::spawn(print_events(events, json));

    let request_id = input
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string());
    let handle = pipeline.submit(CompileRequest::new(request_id, source))?;

    let cancel = handle.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; cancelling run");
            cancel.cancel();
        }
    });

    let outcome = handle.outcome().await;
    if outcome.is_ok() {
        if let Err(e) = pipeline.unload().await {
            tracing::warn!("{}", e);
        }
    }
    // Closing the last event sender ends the printer.
    drop(pipeline);
    printer.await?;

    match outcome {
        Ok(_) => Ok(()),
        Err(PipelineError::BuildFailed {
            diagnostics, raw, ..
        }) if diagnostics.is_empty() && !json => {
            eprintln!("{}", raw.trim_end());
            anyhow::bail!("build failed")
        }
        Err(e) => Err(e.into()),
    }
}

async fn print_events(mut events: EventStream, json: bool) {
    while let Some(event) = events.recv().await {
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::error!("failed to serialize event: {}", e),
            }
            continue;
        }
        match event {
            PipelineEvent::CompileStarted { request_id } => eprintln!("Compiling {}...", request_id),
            PipelineEvent::OutputLine { severity, text } => match severity {
                Severity::Info => eprintln!("  {}", text),
                Severity::Error => eprintln!("! {}", text),
            },
            PipelineEvent::CompileFinished { status, exit_code } => {
                eprintln!("Toolchain finished: {:?} (exit code {:?})", status, exit_code)
            }
            PipelineEvent::DiagnosticsReady { diagnostics } => {
                for record in diagnostics {
                    println!("line {}: {}", record.line, record.message);
                }
            }
            PipelineEvent::ExecutionFinished {
                success,
                messages,
                dialogs,
                model_count,
            } => {
                for message in messages {
                    println!("{}", message.text);
                }
                for dialog in dialogs {
                    println!("[{}] {}", dialog.title, dialog.text);
                }
                println!(
                    "entry point returned {}; {} model(s) produced",
                    success, model_count
                );
            }
            PipelineEvent::RunFailed { reason } => eprintln!("Run failed: {}", reason),
        }
    }
}
