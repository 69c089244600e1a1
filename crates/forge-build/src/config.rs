//! Toolchain configuration.
//!
//! A `ToolchainConfig` is read once at startup (usually from a TOML file) and
//! passed by reference into the script generator and the orchestrator. It is
//! never mutated while a compile is running.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BuildError, Result};

/// Which family of command-line conventions the toolchain follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    /// `cl.exe` / `link.exe` driven from a batch file.
    Msvc,
    /// gcc/clang style driver run from a POSIX shell script.
    Gnu,
}

/// Optimisation profile for the generated module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[default]
    Debug,
    Release,
}

/// Script that prepares the toolchain environment (e.g. `vcvarsall.bat x64`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvSetup {
    pub script: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainConfig {
    pub flavor: Flavor,
    /// Compiler driver executable.
    pub compiler: PathBuf,
    /// Linker executable. Falls back to `link.exe` (MSVC) or the compiler (GNU).
    #[serde(default)]
    pub linker: Option<PathBuf>,
    #[serde(default)]
    pub env_setup: Option<EnvSetup>,
    #[serde(default)]
    pub kernel_include_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub user_include_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub library_dirs: Vec<PathBuf>,
    /// Libraries the module links against, without platform prefix/suffix.
    #[serde(default)]
    pub link_libraries: Vec<String>,
    /// Preprocessor definitions (`NAME` or `NAME=VALUE`).
    #[serde(default)]
    pub defines: Vec<String>,
    #[serde(default)]
    pub profile: Profile,
}

impl ToolchainConfig {
    /// Default configuration for the platform this binary was built for.
    pub fn for_host() -> Self {
        let flavor = if cfg!(windows) { Flavor::Msvc } else { Flavor::Gnu };
        let compiler = match flavor {
            Flavor::Msvc => PathBuf::from("cl.exe"),
            Flavor::Gnu => PathBuf::from("c++"),
        };
        Self {
            flavor,
            compiler,
            linker: None,
            env_setup: None,
            kernel_include_dirs: Vec::new(),
            user_include_dirs: Vec::new(),
            library_dirs: Vec::new(),
            link_libraries: Vec::new(),
            defines: Vec::new(),
            profile: Profile::Debug,
        }
    }

    /// Load a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(BuildError::config(path, "file not found"));
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text).map_err(|message| BuildError::config(path, message))
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml(text: &str) -> std::result::Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }

    /// Serialize to TOML, e.g. to persist edited settings.
    pub fn to_toml(&self) -> std::result::Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| e.to_string())
    }

    pub fn linker(&self) -> PathBuf {
        match (&self.linker, self.flavor) {
            (Some(linker), _) => linker.clone(),
            (None, Flavor::Msvc) => PathBuf::from("link.exe"),
            (None, Flavor::Gnu) => self.compiler.clone(),
        }
    }

    pub fn profile(mut self, profile: Profile) -> Self {
        self.profile = profile;
        self
    }
}
