//! Execution stage of the forge pipeline.
//!
//! A compiled module is opened through [`ModuleLoader`], which resolves the
//! fixed export surface described in [`abi`], and run by [`ModuleInvoker`] on
//! a worker thread that drains its output into an [`ExecutionResult`].

pub mod abi;
pub mod dynamic;
pub mod error;
pub mod invoker;
pub mod loader;
pub mod result;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use abi::{ModuleSurface, RawModel, REQUIRED_EXPORTS};
pub use dynamic::{DynamicModule, LibraryModule};
pub use error::{InvocationError, ModuleError, Result};
pub use invoker::{drain, Invocation, ModuleInvoker};
pub use loader::{LoadedModule, ModuleLoader, ModuleState};
pub use result::{DialogRequest, DisplayStyle, ExecutionResult, GeometryItem, Message, NativeHandle};
