//! Module lifecycle: unload the previous module, load the new one, resolve
//! its export surface.
//!
//! At most one module is loaded at a time. The loaded module is shared as an
//! `Arc`; an invocation in flight holds a clone, and while it does the module
//! cannot be unloaded. A failed unload is reported, never retried, and blocks
//! the load that needed it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::abi::ModuleSurface;
use crate::dynamic::DynamicModule;
use crate::error::{ModuleError, Result};

/// Lifecycle state of the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Unloaded,
    Loading,
    Loaded,
    Unloading,
    /// A load or unload failed. Cleared by the next `load` or `unload` call.
    Error,
}

/// A loaded module together with its resolved exports.
#[derive(Debug)]
pub struct LoadedModule<M> {
    path: PathBuf,
    module: M,
    surface: ModuleSurface,
}

impl<M> LoadedModule<M> {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn surface(&self) -> &ModuleSurface {
        &self.surface
    }
}

/// Owns the single loaded module.
#[derive(Debug)]
pub struct ModuleLoader<M: DynamicModule> {
    current: Option<Arc<LoadedModule<M>>>,
    state: ModuleState,
    loads: u64,
}

impl<M: DynamicModule> ModuleLoader<M> {
    pub fn new() -> Self {
        Self {
            current: None,
            state: ModuleState::Unloaded,
            loads: 0,
        }
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    /// The loaded module, if any.
    pub fn current(&self) -> Option<Arc<LoadedModule<M>>> {
        self.current.clone()
    }

    /// Number of modules successfully loaded over the loader's lifetime.
    pub fn load_count(&self) -> u64 {
        self.loads
    }

    /// Load the module at `path`, unloading the current one first.
    ///
    /// Fails without loading anything if the current module cannot be
    /// unloaded. If any required export is missing the new module is closed
    /// again and every missing name is reported.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<Arc<LoadedModule<M>>> {
        let path = path.as_ref();
        self.unload()?;

        self.state = ModuleState::Loading;
        tracing::info!(path = %path.display(), "loading module");

        let module = match M::open(path) {
            Ok(module) => module,
            Err(e) => {
                self.state = ModuleState::Error;
                return Err(e);
            }
        };

        let surface = match ModuleSurface::resolve(|name| module.resolve_symbol(name)) {
            Ok(surface) => surface,
            Err(missing) => {
                self.state = ModuleState::Error;
                tracing::error!(path = %path.display(), ?missing, "module is missing exports");
                if let Err(e) = module.close() {
                    tracing::error!("failed to close rejected module: {}", e);
                }
                return Err(ModuleError::SymbolResolution {
                    path: path.to_path_buf(),
                    missing: missing.into_iter().map(String::from).collect(),
                });
            }
        };

        let loaded = Arc::new(LoadedModule {
            path: path.to_path_buf(),
            module,
            surface,
        });
        self.current = Some(Arc::clone(&loaded));
        self.state = ModuleState::Loaded;
        self.loads += 1;
        Ok(loaded)
    }

    /// Unload the current module, if any.
    ///
    /// Fails if anything besides the loader still references the module, or
    /// if the platform refuses to close it.
    pub fn unload(&mut self) -> Result<()> {
        let Some(current) = self.current.take() else {
            self.state = ModuleState::Unloaded;
            return Ok(());
        };

        self.state = ModuleState::Unloading;
        let path = current.path.clone();
        tracing::info!(path = %path.display(), "unloading module");

        match Arc::try_unwrap(current) {
            Ok(loaded) => match loaded.module.close() {
                Ok(()) => {
                    self.state = ModuleState::Unloaded;
                    Ok(())
                }
                Err(e) => {
                    self.state = ModuleState::Error;
                    Err(e)
                }
            },
            Err(shared) => {
                let others = Arc::strong_count(&shared) - 1;
                self.current = Some(shared);
                self.state = ModuleState::Error;
                Err(ModuleError::unload(
                    path,
                    format!("module is still in use ({} active reference(s))", others),
                ))
            }
        }
    }
}

impl<M: DynamicModule> Default for ModuleLoader<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::GET_MODEL;
    use crate::testing::{self, FakeModule, Profile};

    #[test]
    fn test_load_and_unload() {
        let dir = tempfile::tempdir().unwrap();
        let path = testing::write_module(dir.path(), "m", Profile::Full, &[]);

        let mut loader = ModuleLoader::<FakeModule>::new();
        assert_eq!(loader.state(), ModuleState::Unloaded);

        let loaded = loader.load(&path).unwrap();
        assert_eq!(loader.state(), ModuleState::Loaded);
        assert_eq!(loaded.path(), path.as_path());
        assert!(loaded.surface().bind().is_ok());
        drop(loaded);

        loader.unload().unwrap();
        assert_eq!(loader.state(), ModuleState::Unloaded);
        assert!(loader.current().is_none());
        assert_eq!(testing::close_count(&path), 1);
    }

    #[test]
    fn test_reload_unloads_previous_first() {
        let dir = tempfile::tempdir().unwrap();
        let first = testing::write_module(dir.path(), "a", Profile::Full, &[]);
        let second = testing::write_module(dir.path(), "b", Profile::Empty, &[]);

        let mut loader = ModuleLoader::<FakeModule>::new();
        drop(loader.load(&first).unwrap());
        drop(loader.load(&second).unwrap());

        assert_eq!(testing::close_count(&first), 1);
        assert_eq!(testing::close_count(&second), 0);
        assert_eq!(loader.current().unwrap().path(), second.as_path());
        assert_eq!(loader.load_count(), 2);
    }

    #[test]
    fn test_missing_export_fails_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = testing::write_module(dir.path(), "m", Profile::Full, &[GET_MODEL]);

        let mut loader = ModuleLoader::<FakeModule>::new();
        let err = loader.load(&path).unwrap_err();

        match err {
            ModuleError::SymbolResolution { missing, .. } => assert_eq!(missing, vec!["get_model"]),
            other => panic!("expected SymbolResolution, got {:?}", other),
        }
        assert_eq!(loader.state(), ModuleState::Error);
        assert!(loader.current().is_none());
        // the rejected module was closed again
        assert_eq!(testing::close_count(&path), 1);
        assert_eq!(loader.load_count(), 0);
    }

    #[test]
    fn test_missing_file_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = ModuleLoader::<FakeModule>::new();
        let err = loader.load(dir.path().join("nope.fake")).unwrap_err();
        assert!(matches!(err, ModuleError::Load { .. }));
        assert_eq!(loader.state(), ModuleState::Error);
    }

    #[test]
    fn test_in_use_module_blocks_load() {
        let dir = tempfile::tempdir().unwrap();
        let first = testing::write_module(dir.path(), "a", Profile::Full, &[]);
        let second = testing::write_module(dir.path(), "b", Profile::Full, &[]);

        let mut loader = ModuleLoader::<FakeModule>::new();
        let borrowed = loader.load(&first).unwrap();

        let err = loader.load(&second).unwrap_err();
        assert!(matches!(err, ModuleError::Unload { .. }));
        assert_eq!(loader.state(), ModuleState::Error);
        // the old module is still owned; the new one was never opened
        assert_eq!(loader.current().unwrap().path(), first.as_path());
        assert_eq!(testing::open_count(&second), 0);

        drop(borrowed);
        loader.load(&second).unwrap();
        assert_eq!(loader.state(), ModuleState::Loaded);
        assert_eq!(testing::close_count(&first), 1);
    }

    #[test]
    fn test_platform_unload_failure_aborts_load() {
        let dir = tempfile::tempdir().unwrap();
        let sticky = testing::write_module(dir.path(), "sticky", Profile::Sticky, &[]);
        let next = testing::write_module(dir.path(), "next", Profile::Full, &[]);

        let mut loader = ModuleLoader::<FakeModule>::new();
        drop(loader.load(&sticky).unwrap());

        let err = loader.load(&next).unwrap_err();
        assert!(matches!(err, ModuleError::Unload { .. }));
        assert_eq!(loader.state(), ModuleState::Error);
        assert_eq!(testing::open_count(&next), 0);
    }

    #[test]
    fn test_unload_when_empty_is_noop() {
        let mut loader = ModuleLoader::<FakeModule>::default();
        loader.unload().unwrap();
        assert_eq!(loader.state(), ModuleState::Unloaded);
    }
}
