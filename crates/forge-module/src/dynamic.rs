//! Platform dynamic-library access.

use std::ffi::c_void;
use std::path::{Path, PathBuf};

use crate::error::{ModuleError, Result};

/// A dynamic module that can be opened, queried for symbols and closed.
///
/// Implementations must be shareable with the worker thread that runs the
/// module's code.
pub trait DynamicModule: Send + Sync + Sized + 'static {
    /// Open the module at `path`.
    fn open(path: &Path) -> Result<Self>;

    /// Address of the exported symbol `name`, if the module has one.
    fn resolve_symbol(&self, name: &str) -> Option<*const c_void>;

    /// Close the module. Symbols resolved from it become dangling.
    fn close(self) -> Result<()>;
}

/// A shared library opened through the platform loader.
#[derive(Debug)]
pub struct LibraryModule {
    library: libloading::Library,
    path: PathBuf,
}

impl LibraryModule {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DynamicModule for LibraryModule {
    fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ModuleError::load(path, "file not found"));
        }
        // SAFETY: running the module's initialisers is the point of loading
        // it; the module was built against the forge support library.
        let library = unsafe { libloading::Library::new(path) }
            .map_err(|e| ModuleError::load(path, e.to_string()))?;
        tracing::debug!(path = %path.display(), "opened module");
        Ok(Self {
            library,
            path: path.to_path_buf(),
        })
    }

    fn resolve_symbol(&self, name: &str) -> Option<*const c_void> {
        // SAFETY: the address is only reinterpreted by `ModuleSurface`, which
        // applies the ABI's signature for `name`.
        let symbol = unsafe { self.library.get::<unsafe extern "C" fn()>(name.as_bytes()) }.ok()?;
        Some(*symbol as *const c_void)
    }

    fn close(self) -> Result<()> {
        let path = self.path;
        self.library
            .close()
            .map_err(|e| ModuleError::unload(&path, e.to_string()))?;
        tracing::debug!(path = %path.display(), "closed module");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_file() {
        let err = LibraryModule::open(Path::new("/no/such/module.so")).unwrap_err();
        assert!(matches!(err, ModuleError::Load { .. }));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_open_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(libloading::library_filename("corrupt"));
        std::fs::write(&path, b"this is not a shared object").unwrap();

        let err = LibraryModule::open(&path).unwrap_err();
        assert!(matches!(err, ModuleError::Load { .. }));
    }
}
