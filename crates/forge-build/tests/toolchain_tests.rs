//! Integration tests that drive the orchestrator with a fake compiler script
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use forge_build::{
    BuildError, BuildStatus, CompileOrchestrator, CompileRequest, Flavor, OutputLine, Severity,
    ToolchainConfig, WorkspaceLayout, BUILD_MARKER,
};
use tokio::sync::mpsc::unbounded_channel;

const COMPILE_OK: &str = "exit 0";
const COMPILE_ERROR: &str = r#"echo "$SRC: In function 'void f()':" >&2
echo "$SRC:12:5: error: expected ';' before '}' token" >&2
exit 1"#;
const COMPILE_HANG: &str = "exec sleep 30 >/dev/null 2>&1";
const LINK_OK: &str = r#"printf 'module' > "$OUT"; exit 0"#;
const LINK_ERROR: &str = r#"echo "entry.o: undefined reference to 'BRep_Builder::MakeFace'" >&2; exit 1"#;

/// Write a fake compiler driver that behaves as `compile` for `-c` invocations
/// and as `link` otherwise.
fn fake_compiler(dir: &Path, compile: &str, link: &str) -> PathBuf {
    let path = dir.join("fakecc");
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
    std::fs::write(&path, script).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn setup(dir: &Path, compile: &str, link: &str) -> CompileOrchestrator {
    let compiler = fake_compiler(dir, compile, link);
    let mut config = ToolchainConfig::for_host();
    config.flavor = Flavor::Gnu;
    config.compiler = compiler;
    config.linker = None;

    let layout = WorkspaceLayout::new(dir.join("tmp dir"), dir.join("user"), Flavor::Gnu);
    layout.prepare().unwrap();
    CompileOrchestrator::new(config, layout)
}

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<OutputLine>) -> Vec<OutputLine> {
    let mut lines = Vec::new();
    while let Ok(line) = rx.try_recv() {
        lines.push(line);
    }
    lines
}

#[tokio::test]
async fn test_clean_build_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = setup(dir.path(), COMPILE_OK, LINK_OK);
    let (tx, mut rx) = unbounded_channel();

    let request = CompileRequest::new("tab-1", "void f(){ int k; }");
    let mut handle = orchestrator.start(&request, Some(tx)).await.unwrap();
    let result = handle.wait().await.unwrap();

    assert_eq!(result.status, BuildStatus::Succeeded);
    assert_eq!(result.exit_code, Some(0));
    assert!(result.diagnostics.is_empty());

    let layout = orchestrator.layout();
    assert_eq!(std::fs::read_to_string(layout.module_path()).unwrap(), "module");
    assert_eq!(
        std::fs::read_to_string(layout.user_source_path()).unwrap(),
        "void f(){ int k; }"
    );
    assert!(layout.entry_source_path().exists());

    let lines = drain(&mut rx);
    assert!(lines
        .iter()
        .any(|l| l.severity == Severity::Info && l.text == BUILD_MARKER));
}

#[tokio::test]
async fn test_compile_error_is_parsed() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = setup(dir.path(), COMPILE_ERROR, LINK_OK);
    let (tx, mut rx) = unbounded_channel();

    let request = CompileRequest::new("tab-1", "void f() { int k }");
    let mut handle = orchestrator.start(&request, Some(tx)).await.unwrap();
    let result = handle.wait().await.unwrap();

    assert_eq!(result.status, BuildStatus::CompileFailed);
    assert_eq!(result.exit_code, Some(2));
    assert_eq!(result.diagnostics.len(), 1);
    assert_eq!(result.diagnostics[0].line, 12);
    assert_eq!(
        result.diagnostics[0].message,
        "error: expected ';' before '}' token"
    );
    assert!(!orchestrator.layout().module_path().exists());

    // stderr is forwarded live with error severity and the source path intact.
    let lines = drain(&mut rx);
    assert!(lines
        .iter()
        .any(|l| l.severity == Severity::Error && l.text.contains("user.cpp:12:5")));
}

#[tokio::test]
async fn test_link_failure_is_classified() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = setup(dir.path(), COMPILE_OK, LINK_ERROR);

    // A module left over from an earlier run must not survive.
    std::fs::write(orchestrator.layout().module_path(), "stale").unwrap();

    let request = CompileRequest::new("tab-1", "int main() {}");
    let mut handle = orchestrator.start(&request, None).await.unwrap();
    let result = handle.wait().await.unwrap();

    assert_eq!(result.status, BuildStatus::LinkFailed);
    assert_eq!(result.exit_code, Some(3));
    assert!(result.stderr.contains("undefined reference"));
    assert!(result.diagnostics.is_empty());
    assert!(!orchestrator.layout().module_path().exists());
}

#[tokio::test]
async fn test_killed_build_is_crashed() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = setup(dir.path(), COMPILE_HANG, LINK_OK);

    let request = CompileRequest::new("tab-1", "");
    let mut handle = orchestrator.start(&request, None).await.unwrap();
    handle.kill().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .expect("wait after kill should not hang")
        .unwrap();
    assert_eq!(result.status, BuildStatus::Crashed);
    assert!(result.diagnostics.is_empty());
}

#[tokio::test]
async fn test_missing_compiler_is_spawn_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ToolchainConfig::for_host();
    config.flavor = Flavor::Gnu;
    config.compiler = dir.path().join("no-such-compiler");
    let layout = WorkspaceLayout::new(dir.path().join("t"), dir.path().join("u"), Flavor::Gnu);
    layout.prepare().unwrap();

    let orchestrator = CompileOrchestrator::new(config, layout);
    let err = orchestrator
        .start(&CompileRequest::new("tab-1", ""), None)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, BuildError::ProcessSpawn { .. }));
}

#[tokio::test]
async fn test_source_is_overwritten_each_run() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = setup(dir.path(), COMPILE_OK, LINK_OK);

    for source in ["// a much longer first version of the source", "// v2"] {
        let mut handle = orchestrator
            .start(&CompileRequest::new("tab-1", source), None)
            .await
            .unwrap();
        handle.wait().await.unwrap();
        assert_eq!(
            std::fs::read_to_string(orchestrator.layout().user_source_path()).unwrap(),
            source
        );
    }
}

#[tokio::test]
async fn test_kill_stops_compiler_started_by_script() {
    let dir = tempfile::tempdir().unwrap();
    let mark = dir.path().join("late");
    // Not exec'd: the compiler runs as a child of the driver script.
    let compile = format!("sleep 2; echo late > \"{}\"; exit 0", mark.display());
    let orchestrator = setup(dir.path(), &compile, LINK_OK);

    let request = CompileRequest::new("tab-1", "");
    let mut handle = orchestrator.start(&request, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    handle.kill().await.unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!mark.exists(), "compiler kept running after kill");
    assert!(!orchestrator.layout().module_path().exists());
}

#[tokio::test]
async fn test_lingering_process_does_not_stall_wait() {
    let dir = tempfile::tempdir().unwrap();
    let mark = dir.path().join("late");
    // A background helper inherits the output pipes and outlives the build.
    let compile = format!("(sleep 4; echo late > \"{}\") &\nexit 0", mark.display());
    let orchestrator = setup(dir.path(), &compile, LINK_OK);

    let started = Instant::now();
    let mut handle = orchestrator
        .start(&CompileRequest::new("tab-1", ""), None)
        .await
        .unwrap();
    let result = tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .expect("wait should not block on inherited pipes")
        .unwrap();
    assert_eq!(result.status, BuildStatus::Succeeded);
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(result.stdout.contains(BUILD_MARKER));

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!mark.exists(), "helper kept running after the build");
}

#[tokio::test]
async fn test_start_prepares_fresh_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ToolchainConfig::for_host();
    config.flavor = Flavor::Gnu;
    config.compiler = fake_compiler(dir.path(), COMPILE_OK, LINK_OK);
    config.linker = None;
    // Nothing on disk yet: start creates the directories and header itself.
    let layout = WorkspaceLayout::new(dir.path().join("fresh"), dir.path().join("user"), Flavor::Gnu);
    let orchestrator = CompileOrchestrator::new(config, layout);

    let mut handle = orchestrator
        .start(&CompileRequest::new("tab-1", "int x;"), None)
        .await
        .unwrap();
    let result = handle.wait().await.unwrap();

    assert_eq!(result.status, BuildStatus::Succeeded);
    assert!(orchestrator.layout().support_header_path().exists());
    assert!(orchestrator.layout().script_path().exists());
}
