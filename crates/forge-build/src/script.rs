//! Build script generation.
//!
//! The toolchain is driven through one generated script per compile: an
//! optional environment-setup call, a marker line, one compile invocation for
//! the user and entry sources, and one link invocation producing the module.
//! Generation is a pure function of the configuration and the layout; only
//! [`BuildScript::write`] touches the filesystem.

use std::path::{Path, PathBuf};

use crate::config::{Flavor, Profile, ToolchainConfig};
use crate::error::Result;
use crate::layout::WorkspaceLayout;

/// Line echoed by the script right before the compiler runs. Everything the
/// toolchain printed before it (environment-setup banners) is not diagnostics.
pub const BUILD_MARKER: &str = "==forge-build==";

/// Script exit code when the compile step fails. No link is attempted.
pub const COMPILE_FAILED_EXIT: i32 = 2;

/// Script exit code when the link step fails.
pub const LINK_FAILED_EXIT: i32 = 3;

/// One argument of a toolchain invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// Emitted verbatim.
    Flag(String),
    /// A path or free-form value, quoted for the target shell after `prefix`.
    Quoted { prefix: &'static str, value: String },
}

impl Arg {
    fn flag(flag: impl Into<String>) -> Self {
        Arg::Flag(flag.into())
    }

    fn path(prefix: &'static str, path: &Path) -> Self {
        Arg::Quoted {
            prefix,
            value: path.display().to_string(),
        }
    }

    fn value(prefix: &'static str, value: &str) -> Self {
        Arg::Quoted {
            prefix,
            value: value.to_string(),
        }
    }
}

/// What a step of the script is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    EnvSetup,
    Compile,
    Link,
}

/// A single program invocation in the generated script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub step: Step,
    pub program: PathBuf,
    pub args: Vec<Arg>,
}

impl Invocation {
    /// Exit code the script terminates with when this step fails.
    pub fn failure_exit(&self) -> Option<i32> {
        match self.step {
            Step::EnvSetup => None,
            Step::Compile => Some(COMPILE_FAILED_EXIT),
            Step::Link => Some(LINK_FAILED_EXIT),
        }
    }
}

/// A generated build script.
#[derive(Debug, Clone)]
pub struct BuildScript {
    flavor: Flavor,
    path: PathBuf,
    build_dir: PathBuf,
    invocations: Vec<Invocation>,
}

impl BuildScript {
    pub fn generate(config: &ToolchainConfig, layout: &WorkspaceLayout) -> Self {
        let mut invocations = Vec::new();

        if let Some(setup) = &config.env_setup {
            invocations.push(Invocation {
                step: Step::EnvSetup,
                program: setup.script.clone(),
                args: setup.args.iter().map(|a| Arg::value("", a)).collect(),
            });
        }

        invocations.push(match config.flavor {
            Flavor::Msvc => msvc_compile(config, layout),
            Flavor::Gnu => gnu_compile(config, layout),
        });
        invocations.push(match config.flavor {
            Flavor::Msvc => msvc_link(config, layout),
            Flavor::Gnu => gnu_link(config, layout),
        });

        Self {
            flavor: config.flavor,
            path: layout.script_path(),
            build_dir: layout.build_dir(),
            invocations,
        }
    }

    pub fn invocations(&self) -> &[Invocation] {
        &self.invocations
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    /// Render the script text for the configured shell.
    pub fn render(&self) -> String {
        match self.flavor {
            Flavor::Msvc => self.render_batch(),
            Flavor::Gnu => self.render_sh(),
        }
    }

    /// Write the script to its designated location.
    pub fn write(&self) -> Result<PathBuf> {
        std::fs::write(&self.path, self.render())?;
        tracing::debug!(path = %self.path.display(), "wrote build script");
        Ok(self.path.clone())
    }

    fn render_batch(&self) -> String {
        let mut out = String::from("@echo off\r\n");
        for inv in &self.invocations {
            if inv.step == Step::EnvSetup {
                out.push_str(&format!("call {}\r\n", render_command(inv, quote_batch)));
            }
        }
        out.push_str(&format!("cd /d {}\r\n", quote_batch(&self.build_dir.display().to_string())));
        out.push_str(&format!("if errorlevel 1 exit /b {}\r\n", COMPILE_FAILED_EXIT));
        out.push_str(&format!("echo {}\r\n", BUILD_MARKER));
        for inv in &self.invocations {
            let Some(code) = inv.failure_exit() else { continue };
            out.push_str(&render_command(inv, quote_batch));
            out.push_str("\r\n");
            out.push_str(&format!("if errorlevel 1 exit /b {}\r\n", code));
        }
        out.push_str("exit /b 0\r\n");
        out
    }

    fn render_sh(&self) -> String {
        let mut out = String::from("#!/bin/sh\n");
        for inv in &self.invocations {
            if inv.step == Step::EnvSetup {
                out.push_str(&format!(". {}\n", render_command(inv, quote_sh)));
            }
        }
        out.push_str(&format!(
            "cd {} || exit {}\n",
            quote_sh(&self.build_dir.display().to_string()),
            COMPILE_FAILED_EXIT
        ));
        out.push_str(&format!("echo '{}'\n", BUILD_MARKER));
        for inv in &self.invocations {
            let Some(code) = inv.failure_exit() else { continue };
            out.push_str(&format!("{} || exit {}\n", render_command(inv, quote_sh), code));
        }
        out.push_str("exit 0\n");
        out
    }
}

fn render_command(inv: &Invocation, quote: fn(&str) -> String) -> String {
    let mut line = quote(&inv.program.display().to_string());
    for arg in &inv.args {
        line.push(' ');
        match arg {
            Arg::Flag(flag) => line.push_str(flag),
            Arg::Quoted { prefix, value } => {
                line.push_str(prefix);
                line.push_str(&quote(value));
            }
        }
    }
    line
}

/// Quote for `cmd.exe`. Paths are always wrapped in double quotes; `%` is
/// doubled so it is not expanded as a variable reference.
pub fn quote_batch(value: &str) -> String {
    format!("\"{}\"", value.replace('%', "%%"))
}

/// Quote for a POSIX shell. Values made only of safe characters pass through.
pub fn quote_sh(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:+,@".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

fn include_dirs(config: &ToolchainConfig, layout: &WorkspaceLayout) -> Vec<PathBuf> {
    config
        .kernel_include_dirs
        .iter()
        .chain(config.user_include_dirs.iter())
        .cloned()
        .chain(std::iter::once(layout.user_dir().to_path_buf()))
        .collect()
}

fn msvc_compile(config: &ToolchainConfig, layout: &WorkspaceLayout) -> Invocation {
    let mut args = vec![
        Arg::flag("/nologo"),
        Arg::flag("/c"),
        Arg::flag("/EHsc"),
        Arg::flag("/std:c++17"),
    ];
    match config.profile {
        Profile::Debug => {
            args.extend(["/Zi", "/Od", "/MDd"].map(Arg::flag));
            args.push(Arg::value("/D", "_DEBUG"));
        }
        Profile::Release => {
            args.extend(["/O2", "/MD"].map(Arg::flag));
            args.push(Arg::value("/D", "NDEBUG"));
        }
    }
    for define in &config.defines {
        args.push(Arg::value("/D", define));
    }
    for dir in include_dirs(config, layout) {
        args.push(Arg::path("/I", &dir));
    }
    args.push(Arg::path("", &layout.user_source_path()));
    args.push(Arg::path("", &layout.entry_source_path()));

    Invocation {
        step: Step::Compile,
        program: config.compiler.clone(),
        args,
    }
}

fn msvc_link(config: &ToolchainConfig, layout: &WorkspaceLayout) -> Invocation {
    let mut args = vec![Arg::flag("/nologo"), Arg::flag("/DLL")];
    if config.profile == Profile::Debug {
        args.push(Arg::flag("/DEBUG"));
    }
    args.push(Arg::path("/OUT:", &layout.module_path()));
    for object in layout.object_paths() {
        args.push(Arg::path("", &object));
    }
    args.push(Arg::path("", &layout.static_library_path()));
    for dir in &config.library_dirs {
        args.push(Arg::path("/LIBPATH:", dir));
    }
    for lib in &config.link_libraries {
        args.push(Arg::value("", &format!("{}.lib", lib)));
    }

    Invocation {
        step: Step::Link,
        program: config.linker(),
        args,
    }
}

fn gnu_compile(config: &ToolchainConfig, layout: &WorkspaceLayout) -> Invocation {
    let mut args = vec![Arg::flag("-c"), Arg::flag("-fPIC"), Arg::flag("-std=c++17")];
    match config.profile {
        Profile::Debug => {
            args.extend(["-g", "-O0"].map(Arg::flag));
            args.push(Arg::value("-D", "_DEBUG"));
        }
        Profile::Release => {
            args.push(Arg::flag("-O2"));
            args.push(Arg::value("-D", "NDEBUG"));
        }
    }
    for define in &config.defines {
        args.push(Arg::value("-D", define));
    }
    for dir in include_dirs(config, layout) {
        args.push(Arg::path("-I", &dir));
    }
    args.push(Arg::path("", &layout.user_source_path()));
    args.push(Arg::path("", &layout.entry_source_path()));

    Invocation {
        step: Step::Compile,
        program: config.compiler.clone(),
        args,
    }
}

fn gnu_link(config: &ToolchainConfig, layout: &WorkspaceLayout) -> Invocation {
    let mut args = vec![Arg::flag("-shared")];
    args.push(Arg::flag("-o"));
    args.push(Arg::path("", &layout.module_path()));
    for object in layout.object_paths() {
        args.push(Arg::path("", &object));
    }
    args.push(Arg::path("", &layout.static_library_path()));
    for dir in &config.library_dirs {
        args.push(Arg::path("-L", dir));
    }
    for lib in &config.link_libraries {
        args.push(Arg::value("-l", lib));
    }

    Invocation {
        step: Step::Link,
        program: config.linker(),
        args,
    }
}
