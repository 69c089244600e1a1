//! The fixed export surface every forge module provides.
//!
//! ```text
//! bool        entry_point();
//! size_t      get_models_size();
//! Model*      get_model(int index);
//! size_t      get_messages_size();
//! const char* get_message(int index);
//! size_t      get_messageBoxes_size();
//! const char* get_messageBoxTitle(int index);
//! const char* get_messageBoxText(int index);
//! const char* get_fault();              // optional
//! ```
//!
//! The generated entry point catches every C++ exception thrown by user code
//! and returns `false`; `get_fault` then returns the exception text. It returns
//! null after a run that did not throw.
//!
//! Strings returned by the module stay valid only until it is unloaded.
//! Model pointers are handed over to the host.

use std::ffi::{c_char, c_int, c_void};

pub const ENTRY_POINT: &str = "entry_point";
pub const GET_MODELS_SIZE: &str = "get_models_size";
pub const GET_MODEL: &str = "get_model";
pub const GET_MESSAGES_SIZE: &str = "get_messages_size";
pub const GET_MESSAGE: &str = "get_message";
pub const GET_MESSAGE_BOXES_SIZE: &str = "get_messageBoxes_size";
pub const GET_MESSAGE_BOX_TITLE: &str = "get_messageBoxTitle";
pub const GET_MESSAGE_BOX_TEXT: &str = "get_messageBoxText";
pub const GET_FAULT: &str = "get_fault";

/// Every export a module must provide. Loading fails unless all resolve.
pub const REQUIRED_EXPORTS: [&str; 8] = [
    ENTRY_POINT,
    GET_MODELS_SIZE,
    GET_MODEL,
    GET_MESSAGES_SIZE,
    GET_MESSAGE,
    GET_MESSAGE_BOXES_SIZE,
    GET_MESSAGE_BOX_TITLE,
    GET_MESSAGE_BOX_TEXT,
];

// `C-unwind` lets a Rust panic from an in-process module reach the worker's
// unwind guard. A foreign (C++) exception crossing this boundary aborts the
// process, so C++ modules must catch their own and report through `get_fault`.
pub type EntryPointFn = unsafe extern "C-unwind" fn() -> bool;
pub type SizeFn = unsafe extern "C-unwind" fn() -> usize;
pub type ModelFn = unsafe extern "C-unwind" fn(c_int) -> *mut RawModel;
pub type StringFn = unsafe extern "C-unwind" fn(c_int) -> *const c_char;
pub type FaultFn = unsafe extern "C-unwind" fn() -> *const c_char;

/// Header of the module-side `Model` object.
#[repr(C)]
#[derive(Debug)]
pub struct RawModel {
    pub style: c_int,
    pub shape: *mut c_void,
}

/// Typed function-pointer table, populated once at load time.
#[derive(Debug, Clone, Copy)]
pub struct ModuleSurface {
    pub entry_point: Option<EntryPointFn>,
    pub models_size: Option<SizeFn>,
    pub model: Option<ModelFn>,
    pub messages_size: Option<SizeFn>,
    pub message: Option<StringFn>,
    pub message_boxes_size: Option<SizeFn>,
    pub message_box_title: Option<StringFn>,
    pub message_box_text: Option<StringFn>,
    /// Not required; absent in modules built without the generated entry source.
    pub fault: Option<FaultFn>,
}

/// A surface whose exports are all known to be present.
#[derive(Debug, Clone, Copy)]
pub struct BoundSurface {
    pub entry_point: EntryPointFn,
    pub models_size: SizeFn,
    pub model: ModelFn,
    pub messages_size: SizeFn,
    pub message: StringFn,
    pub message_boxes_size: SizeFn,
    pub message_box_title: StringFn,
    pub message_box_text: StringFn,
    pub fault: Option<FaultFn>,
}

impl ModuleSurface {
    /// Resolve every required export, and `get_fault` if present, through `lookup`.
    ///
    /// Returns the names of all required exports that were absent or null.
    pub fn resolve(
        mut lookup: impl FnMut(&str) -> Option<*const c_void>,
    ) -> std::result::Result<Self, Vec<&'static str>> {
        let mut missing = Vec::new();
        let mut addresses = [std::ptr::null::<c_void>(); REQUIRED_EXPORTS.len()];
        for (slot, name) in addresses.iter_mut().zip(REQUIRED_EXPORTS) {
            match lookup(name).filter(|ptr| !ptr.is_null()) {
                Some(ptr) => *slot = ptr,
                None => missing.push(name),
            }
        }
        if !missing.is_empty() {
            return Err(missing);
        }
        let fault = lookup(GET_FAULT).unwrap_or(std::ptr::null());

        // SAFETY: each address was exported under the name the ABI assigns to
        // the corresponding signature.
        unsafe {
            Ok(Self {
                entry_point: cast(addresses[0]),
                models_size: cast(addresses[1]),
                model: cast(addresses[2]),
                messages_size: cast(addresses[3]),
                message: cast(addresses[4]),
                message_boxes_size: cast(addresses[5]),
                message_box_title: cast(addresses[6]),
                message_box_text: cast(addresses[7]),
                fault: cast(fault),
            })
        }
    }

    /// Check that every export is present.
    pub fn bind(&self) -> std::result::Result<BoundSurface, Vec<&'static str>> {
        match (
            self.entry_point,
            self.models_size,
            self.model,
            self.messages_size,
            self.message,
            self.message_boxes_size,
            self.message_box_title,
            self.message_box_text,
        ) {
            (Some(e), Some(ms), Some(m), Some(ss), Some(s), Some(bs), Some(bt), Some(bx)) => {
                Ok(BoundSurface {
                    entry_point: e,
                    models_size: ms,
                    model: m,
                    messages_size: ss,
                    message: s,
                    message_boxes_size: bs,
                    message_box_title: bt,
                    message_box_text: bx,
                    fault: self.fault,
                })
            }
            _ => Err(self.missing()),
        }
    }

    fn missing(&self) -> Vec<&'static str> {
        let present = [
            self.entry_point.is_some(),
            self.models_size.is_some(),
            self.model.is_some(),
            self.messages_size.is_some(),
            self.message.is_some(),
            self.message_boxes_size.is_some(),
            self.message_box_title.is_some(),
            self.message_box_text.is_some(),
        ];
        REQUIRED_EXPORTS
            .iter()
            .zip(present)
            .filter(|(_, present)| !present)
            .map(|(name, _)| *name)
            .collect()
    }
}

/// Reinterpret a non-null symbol address as a function pointer.
///
/// # Safety
/// `F` must be a function pointer type matching the symbol's real signature.
unsafe fn cast<F: Copy>(address: *const c_void) -> Option<F> {
    debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<*const c_void>());
    if address.is_null() {
        None
    } else {
        Some(std::mem::transmute_copy::<*const c_void, F>(&address))
    }
}
