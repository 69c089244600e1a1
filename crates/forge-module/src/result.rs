//! Host-owned values drained from a module.

use std::ffi::{c_int, c_void};
use std::ptr::NonNull;

use serde::{Deserialize, Serialize};

use crate::abi::RawModel;

/// How the scene should draw a geometry item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayStyle {
    Shaded,
    Wireframe,
    Points,
    Other(i32),
}

impl DisplayStyle {
    pub fn from_raw(style: c_int) -> Self {
        match style {
            0 => DisplayStyle::Shaded,
            1 => DisplayStyle::Wireframe,
            2 => DisplayStyle::Points,
            other => DisplayStyle::Other(other),
        }
    }
}

/// Owning pointer to a model the module handed over.
///
/// The host is responsible for disposing of it through the kernel's usual
/// lifetime rules; dropping the handle does not free it.
#[derive(Debug, PartialEq, Eq)]
pub struct NativeHandle(NonNull<RawModel>);

// SAFETY: ownership of the model moves to the host with the handle; the module
// keeps no reference to it after `get_model` returns.
unsafe impl Send for NativeHandle {}
unsafe impl Sync for NativeHandle {}

impl NativeHandle {
    pub(crate) fn new(ptr: NonNull<RawModel>) -> Self {
        Self(ptr)
    }

    pub fn as_ptr(&self) -> *mut RawModel {
        self.0.as_ptr()
    }

    /// The kernel shape the model wraps.
    pub fn shape(&self) -> *mut c_void {
        // SAFETY: the handle owns a live model object.
        unsafe { (*self.0.as_ptr()).shape }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct GeometryItem {
    pub style: DisplayStyle,
    pub handle: NativeHandle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogRequest {
    pub title: String,
    pub text: String,
}

/// Everything one module run produced, copied into host memory.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Value returned by the entry point.
    pub success: bool,
    pub models: Vec<GeometryItem>,
    pub messages: Vec<Message>,
    pub dialogs: Vec<DialogRequest>,
}

impl ExecutionResult {
    pub fn is_empty(&self) -> bool {
        self.models.is_empty() && self.messages.is_empty() && self.dialogs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_style_mapping() {
        assert_eq!(DisplayStyle::from_raw(0), DisplayStyle::Shaded);
        assert_eq!(DisplayStyle::from_raw(1), DisplayStyle::Wireframe);
        assert_eq!(DisplayStyle::from_raw(2), DisplayStyle::Points);
        assert_eq!(DisplayStyle::from_raw(7), DisplayStyle::Other(7));
    }

    #[test]
    fn test_default_result_is_empty() {
        let result = ExecutionResult::default();
        assert!(!result.success);
        assert!(result.is_empty());
    }
}
