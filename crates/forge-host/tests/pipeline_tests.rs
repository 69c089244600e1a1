//! End-to-end runs with a fake compiler that "links" fake modules
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use forge_build::{BuildStatus, CompileRequest, Flavor, ToolchainConfig, WorkspaceLayout};
use forge_host::{EventStream, Pipeline, PipelineError, PipelineEvent, PipelineOptions, Stage};
use forge_module::testing::{self, FakeModule, Profile};
use forge_module::{InvocationError, ModuleError, ModuleState};

const COMPILE_OK: &str = "exit 0";
const COMPILE_SLOW: &str = "sleep 1; exit 0";
const COMPILE_HANG: &str = "exec sleep 30 >/dev/null 2>&1";
const COMPILE_ERROR: &str = r#"echo "$SRC:12:5: error: expected ';' before '}' token" >&2
exit 1"#;
const LINK_ERROR: &str = r#"echo "entry.o: undefined reference to 'BRep_Builder::MakeFace'" >&2; exit 1"#;

/// A link step that writes a fake module with the given behaviour.
fn link_module(profile: Profile, omit: &[&str]) -> String {
    format!(
        "cat > \"$OUT\" <<'FORGE_EOF'\n{}FORGE_EOF\nexit 0",
        testing::module_text(profile, omit)
    )
}

struct Fixture {
    _dir: tempfile::TempDir,
    pipeline: Pipeline<FakeModule>,
    events: EventStream,
}

fn fixture(compile: &str, link: &str, options: PipelineOptions) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let compiler = dir.path().join("fakecc");
    let script = format!(
        r#"#!/bin/sh
SRC=""
OUT=""
MODE=link
PREV=""
for a in "$@"; do
  case "$a" in
    -c) MODE=compile ;;
    *user.cpp) SRC="$a" ;;
  esac
  if [ "$PREV" = "-o" ]; then OUT="$a"; fi
  PREV="$a"
done
if [ "$MODE" = compile ]; then
{compile}
else
{link}
fi
"#
    );
    std::fs::write(&compiler, script).unwrap();
    let mut perms = std::fs::metadata(&compiler).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&compiler, perms).unwrap();

    let mut config = ToolchainConfig::for_host();
    config.flavor = Flavor::Gnu;
    config.compiler = compiler;
    config.linker = None;
    let layout = WorkspaceLayout::new(dir.path().join("tmp"), dir.path().join("user"), Flavor::Gnu);

    let (pipeline, events) = Pipeline::new(config, layout, options);
    Fixture {
        _dir: dir,
        pipeline,
        events,
    }
}

fn collect(events: &mut EventStream) -> Vec<PipelineEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn request(source: &str) -> CompileRequest {
    CompileRequest::new("tab-1", source)
}

#[tokio::test]
async fn test_clean_run_loads_once_and_reports() {
    let mut f = fixture(COMPILE_OK, &link_module(Profile::Full, &[]), PipelineOptions::default());

    let handle = f.pipeline.submit(request("bool forge_user_main() { return true; }")).unwrap();
    assert_eq!(handle.request_id(), "tab-1");
    let result = handle.outcome().await.unwrap();

    assert!(result.success);
    assert_eq!(result.messages.len(), 2);
    assert_eq!(result.models.len(), 1);
    assert_eq!(f.pipeline.load_count(), 1);
    assert_eq!(f.pipeline.module_state(), ModuleState::Loaded);
    assert!(!f.pipeline.is_busy());

    let events = collect(&mut f.events);
    assert_eq!(
        events.first(),
        Some(&PipelineEvent::CompileStarted {
            request_id: "tab-1".to_string()
        })
    );
    assert!(events.contains(&PipelineEvent::CompileFinished {
        status: BuildStatus::Succeeded,
        exit_code: Some(0),
    }));
    assert!(!events
        .iter()
        .any(|e| matches!(e, PipelineEvent::DiagnosticsReady { .. })));
    match events.last() {
        Some(PipelineEvent::ExecutionFinished {
            success,
            messages,
            model_count,
            ..
        }) => {
            assert!(*success);
            assert_eq!(messages[0].text, "hello");
            assert_eq!(*model_count, 1);
        }
        other => panic!("expected ExecutionFinished, got {:?}", other),
    }

    f.pipeline.unload().await.unwrap();
    assert_eq!(f.pipeline.module_state(), ModuleState::Unloaded);
}

#[tokio::test]
async fn test_compile_error_reports_diagnostics() {
    let mut f = fixture(
        COMPILE_ERROR,
        &link_module(Profile::Full, &[]),
        PipelineOptions::default(),
    );

    let err = f
        .pipeline
        .submit(request("void f() { int k }"))
        .unwrap()
        .outcome()
        .await
        .unwrap_err();

    match err {
        PipelineError::BuildFailed {
            status,
            diagnostics,
            ..
        } => {
            assert_eq!(status, BuildStatus::CompileFailed);
            assert_eq!(diagnostics.len(), 1);
            assert_eq!(diagnostics[0].line, 12);
            assert_eq!(
                diagnostics[0].message,
                "error: expected ';' before '}' token"
            );
        }
        other => panic!("expected BuildFailed, got {:?}", other),
    }
    assert_eq!(f.pipeline.load_count(), 0);

    let events = collect(&mut f.events);
    assert!(events.iter().any(|e| matches!(
        e,
        PipelineEvent::OutputLine { text, .. } if text.contains("user.cpp:12:5")
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, PipelineEvent::DiagnosticsReady { diagnostics } if diagnostics.len() == 1)));
    assert!(matches!(events.last(), Some(PipelineEvent::RunFailed { .. })));
}

#[tokio::test]
async fn test_link_failure_is_annotated() {
    let mut f = fixture(COMPILE_OK, LINK_ERROR, PipelineOptions::default());

    let err = f
        .pipeline
        .submit(request("int x;"))
        .unwrap()
        .outcome()
        .await
        .unwrap_err();

    assert!(err.to_string().contains("linking failed"));
    match &err {
        PipelineError::BuildFailed { status, raw, .. } => {
            assert_eq!(*status, BuildStatus::LinkFailed);
            assert!(raw.contains("undefined reference"));
        }
        other => panic!("expected BuildFailed, got {:?}", other),
    }

    // diagnostics are still offered for a failed link
    let events = collect(&mut f.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, PipelineEvent::DiagnosticsReady { .. })));
    assert_eq!(f.pipeline.load_count(), 0);
}

#[tokio::test]
async fn test_missing_export_is_not_invoked() {
    let mut f = fixture(
        COMPILE_OK,
        &link_module(Profile::Panic, &["get_model"]),
        PipelineOptions::default(),
    );

    let err = f
        .pipeline
        .submit(request("int x;"))
        .unwrap()
        .outcome()
        .await
        .unwrap_err();

    // The panicking entry point was never reached.
    match err {
        PipelineError::Module(ModuleError::SymbolResolution { missing, .. }) => {
            assert_eq!(missing, vec!["get_model"]);
        }
        other => panic!("expected SymbolResolution, got {:?}", other),
    }
    assert_eq!(f.pipeline.load_count(), 0);
    assert!(!collect(&mut f.events)
        .iter()
        .any(|e| matches!(e, PipelineEvent::ExecutionFinished { .. })));
}

#[tokio::test]
async fn test_second_request_is_rejected_while_busy() {
    let f = fixture(
        COMPILE_SLOW,
        &link_module(Profile::Full, &[]),
        PipelineOptions::default(),
    );

    let first = f.pipeline.submit(request("// one")).unwrap();
    assert!(f.pipeline.is_busy());
    let err = f.pipeline.submit(request("// two")).err().unwrap();
    assert!(matches!(err, PipelineError::Busy));
    assert!(matches!(f.pipeline.unload().await, Err(PipelineError::Busy)));

    first.outcome().await.unwrap();
    let again = f.pipeline.submit(request("// three")).unwrap();
    again.outcome().await.unwrap();
    assert_eq!(f.pipeline.load_count(), 2);
}

#[tokio::test]
async fn test_module_fault_unloads() {
    let f = fixture(
        COMPILE_OK,
        &link_module(Profile::Panic, &[]),
        PipelineOptions::default(),
    );

    let err = f
        .pipeline
        .submit(request("int x;"))
        .unwrap()
        .outcome()
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Invocation(_)));
    assert_eq!(f.pipeline.module_state(), ModuleState::Unloaded);
}

#[tokio::test]
async fn test_module_exception_unloads() {
    let mut f = fixture(
        COMPILE_OK,
        &link_module(Profile::Throw, &[]),
        PipelineOptions::default(),
    );

    let err = f
        .pipeline
        .submit(request("int x;"))
        .unwrap()
        .outcome()
        .await
        .unwrap_err();

    match err {
        PipelineError::Invocation(InvocationError::Faulted(text)) => assert_eq!(text, testing::THROWN),
        other => panic!("expected Faulted, got {:?}", other),
    }
    assert_eq!(f.pipeline.module_state(), ModuleState::Unloaded);
    assert!(matches!(
        collect(&mut f.events).last(),
        Some(PipelineEvent::RunFailed { reason }) if reason.contains("BRepBuilderAPI_MakeFace")
    ));
}

#[tokio::test]
async fn test_invoke_timeout_abandons_worker() {
    let options = PipelineOptions {
        invoke_timeout: Duration::from_millis(200),
        ..PipelineOptions::default()
    };
    let f = fixture(COMPILE_OK, &link_module(Profile::Slow, &[]), options);

    let err = f
        .pipeline
        .submit(request("int x;"))
        .unwrap()
        .outcome()
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::TimedOut {
            stage: Stage::Invoke,
            ..
        }
    ));

    // The abandoned worker still runs the module, so it cannot be replaced yet.
    let err = f
        .pipeline
        .submit(request("int y;"))
        .unwrap()
        .outcome()
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::ModuleUnload(_)));
    assert_eq!(f.pipeline.load_count(), 1);

    tokio::time::sleep(testing::SLOW_ENTRY + Duration::from_millis(500)).await;
    assert!(f.pipeline.unload().await.is_ok());
    assert_eq!(f.pipeline.module_state(), ModuleState::Unloaded);
}

#[tokio::test]
async fn test_cancel_kills_toolchain() {
    let mut f = fixture(
        COMPILE_HANG,
        &link_module(Profile::Full, &[]),
        PipelineOptions::default(),
    );

    let handle = f.pipeline.submit(request("int x;")).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.cancel();

    let err = tokio::time::timeout(Duration::from_secs(10), handle.outcome())
        .await
        .expect("cancelled run should end promptly")
        .unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled));
    assert!(!f.pipeline.is_busy());
    assert_eq!(f.pipeline.load_count(), 0);

    let events = collect(&mut f.events);
    assert!(matches!(
        events.last(),
        Some(PipelineEvent::RunFailed { reason }) if reason.contains("cancelled")
    ));
}

#[tokio::test]
async fn test_compile_timeout() {
    let options = PipelineOptions {
        compile_timeout: Duration::from_millis(300),
        ..PipelineOptions::default()
    };
    let f = fixture(COMPILE_HANG, &link_module(Profile::Full, &[]), options);

    let err = f
        .pipeline
        .submit(request("int x;"))
        .unwrap()
        .outcome()
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::TimedOut {
            stage: Stage::Compile,
            ..
        }
    ));
}

#[tokio::test]
async fn test_cancel_stops_compiler_before_next_run() {
    let dir = tempfile::tempdir().unwrap();
    let mark = dir.path().join("late");
    let compile = format!("sleep 2; echo late > \"{}\"; exit 0", mark.display());
    let f = fixture(&compile, &link_module(Profile::Full, &[]), PipelineOptions::default());

    let handle = f.pipeline.submit(request("int x;")).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    handle.cancel();
    let err = handle.outcome().await.unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled));
    assert!(!f.pipeline.is_busy());

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!mark.exists(), "compiler outlived the cancelled run");
}
