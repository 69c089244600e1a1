//! In-process fake modules.
//!
//! A fake module is a small text file naming a [`Profile`] and, optionally,
//! exports to leave out. Opening it with [`FakeModule`] yields a module whose
//! exports are Rust functions, so loader and invoker behaviour can be tested
//! without a C++ toolchain.

use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_void};
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use crate::abi::*;
use crate::dynamic::DynamicModule;
use crate::error::{ModuleError, Result};

/// How long the entry point of [`Profile::Slow`] runs.
pub const SLOW_ENTRY: Duration = Duration::from_millis(1500);

/// Text `get_fault` reports for [`Profile::Throw`].
pub const THROWN: &str = "Standard_ConstructionError: BRepBuilderAPI_MakeFace";

static OPENS: LazyLock<Mutex<HashMap<PathBuf, usize>>> = LazyLock::new(Default::default);
static CLOSES: LazyLock<Mutex<HashMap<PathBuf, usize>>> = LazyLock::new(Default::default);

/// Behaviour of a fake module's exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Returns `true` with two messages, one dialog and one wireframe model.
    Full,
    /// Returns `false` and exports nothing.
    Empty,
    /// The entry point panics.
    Panic,
    /// Claims one message but returns a null string for it.
    NullMessage,
    /// The entry point sleeps for [`SLOW_ENTRY`] and returns `true`.
    Slow,
    /// Like `Full`, but the platform refuses to close it.
    Sticky,
    /// The entry point "catches an exception": it returns `false` and
    /// `get_fault` reports [`THROWN`].
    Throw,
    /// Claims `c_int::MAX` models but only hands out the first.
    Flood,
}

impl Profile {
    fn name(self) -> &'static str {
        match self {
            Profile::Full => "full",
            Profile::Empty => "empty",
            Profile::Panic => "panic",
            Profile::NullMessage => "null-message",
            Profile::Slow => "slow",
            Profile::Sticky => "sticky",
            Profile::Throw => "throw",
            Profile::Flood => "flood",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        [
            Profile::Full,
            Profile::Empty,
            Profile::Panic,
            Profile::NullMessage,
            Profile::Slow,
            Profile::Sticky,
            Profile::Throw,
            Profile::Flood,
        ]
        .into_iter()
        .find(|p| p.name() == name)
    }
}

/// Text content of a fake module file.
pub fn module_text(profile: Profile, omit: &[&str]) -> String {
    format!("profile={}\nomit={}\n", profile.name(), omit.join(","))
}

/// Write a fake module file named `name` into `dir`.
pub fn write_module(dir: &Path, name: &str, profile: Profile, omit: &[&str]) -> PathBuf {
    let path = dir.join(format!("{}.fake", name));
    std::fs::write(&path, module_text(profile, omit)).expect("write fake module");
    path
}

/// How many times the module at `path` was opened.
pub fn open_count(path: &Path) -> usize {
    count(&OPENS, path)
}

/// How many times the module at `path` was closed.
pub fn close_count(path: &Path) -> usize {
    count(&CLOSES, path)
}

fn count(table: &Mutex<HashMap<PathBuf, usize>>, path: &Path) -> usize {
    let table = table.lock().unwrap_or_else(|e| e.into_inner());
    table.get(path).copied().unwrap_or(0)
}

fn bump(table: &Mutex<HashMap<PathBuf, usize>>, path: &Path) {
    let mut table = table.lock().unwrap_or_else(|e| e.into_inner());
    *table.entry(path.to_path_buf()).or_default() += 1;
}

#[derive(Debug)]
pub struct FakeModule {
    path: PathBuf,
    profile: Profile,
    omit: Vec<String>,
}

impl DynamicModule for FakeModule {
    fn open(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ModuleError::load(path, e.to_string()))?;

        let mut profile = None;
        let mut omit = Vec::new();
        for line in text.lines() {
            if let Some(name) = line.strip_prefix("profile=") {
                profile = Profile::parse(name.trim());
            } else if let Some(list) = line.strip_prefix("omit=") {
                omit = list
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
            }
        }
        let profile = profile.ok_or_else(|| ModuleError::load(path, "not a fake module"))?;

        bump(&OPENS, path);
        Ok(Self {
            path: path.to_path_buf(),
            profile,
            omit,
        })
    }

    fn resolve_symbol(&self, name: &str) -> Option<*const c_void> {
        if self.omit.iter().any(|o| o == name) {
            return None;
        }
        exports(self.profile)
            .into_iter()
            .find(|(export, _)| *export == name)
            .map(|(_, address)| address)
    }

    fn close(self) -> Result<()> {
        if self.profile == Profile::Sticky {
            return Err(ModuleError::unload(&self.path, "module is pinned"));
        }
        bump(&CLOSES, &self.path);
        Ok(())
    }
}

fn exports(profile: Profile) -> [(&'static str, *const c_void); 9] {
    let entry: EntryPointFn = match profile {
        Profile::Full | Profile::Sticky | Profile::NullMessage | Profile::Flood => entry_true,
        Profile::Empty | Profile::Throw => entry_false,
        Profile::Panic => entry_panic,
        Profile::Slow => entry_slow,
    };
    let full = matches!(profile, Profile::Full | Profile::Sticky);
    let models_size: SizeFn = match profile {
        Profile::Flood => flood,
        _ if full => one,
        _ => zero,
    };
    let model: ModelFn = if profile == Profile::Flood { first_model } else { model };
    let fault: FaultFn = if profile == Profile::Throw { thrown } else { no_fault };
    let messages_size: SizeFn = match profile {
        Profile::Full | Profile::Sticky => two,
        Profile::NullMessage => one,
        _ => zero,
    };
    let message: StringFn = if full { message } else { null_string };
    let boxes_size: SizeFn = if full { one } else { zero };

    [
        (ENTRY_POINT, entry as *const c_void),
        (GET_MODELS_SIZE, models_size as *const c_void),
        (GET_MODEL, model as *const c_void),
        (GET_MESSAGES_SIZE, messages_size as *const c_void),
        (GET_MESSAGE, message as *const c_void),
        (GET_MESSAGE_BOXES_SIZE, boxes_size as *const c_void),
        (GET_MESSAGE_BOX_TITLE, box_title as StringFn as *const c_void),
        (GET_MESSAGE_BOX_TEXT, box_text as StringFn as *const c_void),
        (GET_FAULT, fault as *const c_void),
    ]
}

unsafe extern "C-unwind" fn entry_true() -> bool {
    true
}

unsafe extern "C-unwind" fn entry_false() -> bool {
    false
}

unsafe extern "C-unwind" fn entry_panic() -> bool {
    panic!("Standard_Failure: BRep_API: command not done");
}

unsafe extern "C-unwind" fn entry_slow() -> bool {
    std::thread::sleep(SLOW_ENTRY);
    true
}

unsafe extern "C-unwind" fn zero() -> usize {
    0
}

unsafe extern "C-unwind" fn one() -> usize {
    1
}

unsafe extern "C-unwind" fn two() -> usize {
    2
}

unsafe extern "C-unwind" fn flood() -> usize {
    c_int::MAX as usize
}

unsafe extern "C-unwind" fn first_model(index: c_int) -> *mut RawModel {
    if index == 0 {
        model(index)
    } else {
        std::ptr::null_mut()
    }
}

unsafe extern "C-unwind" fn model(_index: c_int) -> *mut RawModel {
    Box::into_raw(Box::new(RawModel {
        style: 1,
        shape: std::ptr::null_mut(),
    }))
}

unsafe extern "C-unwind" fn message(index: c_int) -> *const c_char {
    match index {
        0 => c"hello".as_ptr(),
        1 => c"world".as_ptr(),
        _ => std::ptr::null(),
    }
}

unsafe extern "C-unwind" fn null_string(_index: c_int) -> *const c_char {
    std::ptr::null()
}

unsafe extern "C-unwind" fn box_title(_index: c_int) -> *const c_char {
    c"Note".as_ptr()
}

unsafe extern "C-unwind" fn box_text(_index: c_int) -> *const c_char {
    c"done".as_ptr()
}

unsafe extern "C-unwind" fn no_fault() -> *const c_char {
    std::ptr::null()
}

unsafe extern "C-unwind" fn thrown() -> *const c_char {
    c"Standard_ConstructionError: BRepBuilderAPI_MakeFace".as_ptr()
}
