//! On-disk layout of a forge workspace.
//!
//! The temp directory holds everything the pipeline regenerates on every
//! compile (script, sources, object files, module). The user directory holds
//! the static support library and the user-editable support header.

use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::path::{Path, PathBuf};

use crate::config::Flavor;
use crate::error::{BuildError, Result};
use crate::templates;

pub const USER_SOURCE_FILE: &str = "user.cpp";
pub const ENTRY_SOURCE_FILE: &str = "entry.cpp";
pub const SUPPORT_HEADER_FILE: &str = "forge_user.h";
const MODULE_STEM: &str = "forge_module";
const BUILD_DIR: &str = "build";
const WRITE_CHECK_FILE: &str = ".forge-write-check";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    temp_dir: PathBuf,
    user_dir: PathBuf,
    flavor: Flavor,
}

impl WorkspaceLayout {
    pub fn new(temp_dir: impl Into<PathBuf>, user_dir: impl Into<PathBuf>, flavor: Flavor) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            user_dir: user_dir.into(),
            flavor,
        }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn user_dir(&self) -> &Path {
        &self.user_dir
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    pub fn script_path(&self) -> PathBuf {
        match self.flavor {
            Flavor::Msvc => self.temp_dir.join("build.bat"),
            Flavor::Gnu => self.temp_dir.join("build.sh"),
        }
    }

    pub fn user_source_path(&self) -> PathBuf {
        self.temp_dir.join(USER_SOURCE_FILE)
    }

    pub fn entry_source_path(&self) -> PathBuf {
        self.temp_dir.join(ENTRY_SOURCE_FILE)
    }

    pub fn build_dir(&self) -> PathBuf {
        self.temp_dir.join(BUILD_DIR)
    }

    /// Object files produced by the compile step, in link order.
    pub fn object_paths(&self) -> Vec<PathBuf> {
        let ext = match self.flavor {
            Flavor::Msvc => "obj",
            Flavor::Gnu => "o",
        };
        [USER_SOURCE_FILE, ENTRY_SOURCE_FILE]
            .iter()
            .map(|file| self.build_dir().join(Path::new(file).with_extension(ext)))
            .collect()
    }

    pub fn module_path(&self) -> PathBuf {
        self.build_dir()
            .join(format!("{}{}{}", DLL_PREFIX, MODULE_STEM, DLL_SUFFIX))
    }

    pub fn static_library_path(&self) -> PathBuf {
        match self.flavor {
            Flavor::Msvc => self.user_dir.join("forge_user.lib"),
            Flavor::Gnu => self.user_dir.join("libforge_user.a"),
        }
    }

    pub fn support_header_path(&self) -> PathBuf {
        self.user_dir.join(SUPPORT_HEADER_FILE)
    }

    /// Create the directories and check that the temp directory is writable.
    ///
    /// Must succeed before any compile is attempted.
    pub fn prepare(&self) -> Result<()> {
        for dir in [&self.temp_dir, &self.build_dir(), &self.user_dir] {
            std::fs::create_dir_all(dir)
                .map_err(|e| BuildError::setup(dir.as_path(), e.to_string()))?;
        }

        let check = self.temp_dir.join(WRITE_CHECK_FILE);
        std::fs::write(&check, b"forge")
            .map_err(|e| BuildError::setup(&self.temp_dir, format!("not writable: {}", e)))?;
        let _ = std::fs::remove_file(&check);

        let header = self.support_header_path();
        if !header.exists() {
            tracing::info!(path = %header.display(), "installing default support header");
            std::fs::write(&header, templates::SUPPORT_HEADER)
                .map_err(|e| BuildError::setup(&self.user_dir, e.to_string()))?;
        }

        let library = self.static_library_path();
        if !library.exists() {
            tracing::warn!(
                path = %library.display(),
                "static support library is missing; linking will fail"
            );
        }

        Ok(())
    }

    /// Remove the previous run's build products.
    pub fn clean_outputs(&self) -> Result<()> {
        let mut stale = self.object_paths();
        stale.push(self.module_path());
        for path in stale {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "removed stale output"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
