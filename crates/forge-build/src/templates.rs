//! Fixed C++ sources shipped with the pipeline.
//!
//! `ENTRY_SOURCE` is regenerated into the temp directory before every build.
//! `SUPPORT_HEADER` is installed once into the user directory and may be edited
//! there. The static support library implements the functions the header
//! declares, including a default `forge_user_main` that returns `false`; the
//! linker only pulls that default in when the user source does not define one.

pub const SUPPORT_HEADER: &str = r#"#pragma once

#include <cstddef>
#include <string>
#include <vector>

namespace forge {

enum Style { Shaded = 0, Wireframe = 1, Points = 2 };

// Layout shared with the host; keep it standard-layout.
struct Model {
    int style;
    void* shape;
};

void reset();
void add_model(void* shape, Style style = Shaded);
void log(const std::string& text);
void message_box(const std::string& title, const std::string& text);

const std::vector<Model*>& models();
Model* take_model(int index);
const std::vector<std::string>& messages();
const std::vector<std::string>& message_box_titles();
const std::vector<std::string>& message_box_texts();

} // namespace forge

// Define this in your source to run code when the module is executed.
bool forge_user_main();
"#;

pub const ENTRY_SOURCE: &str = r#"// Generated by forge. Rewritten before every build.
#include "forge_user.h"

#include <exception>

#if defined(_WIN32)
#define FORGE_EXPORT extern "C" __declspec(dllexport)
#else
#define FORGE_EXPORT extern "C" __attribute__((visibility("default")))
#endif

// No exception may leave an export: the host cannot unwind through it.
static bool forge_faulted = false;
static std::string forge_fault;

FORGE_EXPORT bool entry_point() {
    forge_faulted = false;
    forge_fault.clear();
    try {
        forge::reset();
        return forge_user_main();
    } catch (const std::exception& e) {
        forge_fault = e.what();
    } catch (...) {
        forge_fault = "unknown exception";
    }
    forge_faulted = true;
    return false;
}

FORGE_EXPORT const char* get_fault() { return forge_faulted ? forge_fault.c_str() : nullptr; }

FORGE_EXPORT size_t get_models_size() { return forge::models().size(); }
FORGE_EXPORT forge::Model* get_model(int index) { return forge::take_model(index); }

FORGE_EXPORT size_t get_messages_size() { return forge::messages().size(); }
FORGE_EXPORT const char* get_message(int index) { return forge::messages()[index].c_str(); }

FORGE_EXPORT size_t get_messageBoxes_size() { return forge::message_box_titles().size(); }
FORGE_EXPORT const char* get_messageBoxTitle(int index) { return forge::message_box_titles()[index].c_str(); }
FORGE_EXPORT const char* get_messageBoxText(int index) { return forge::message_box_texts()[index].c_str(); }
"#;

/// Text of the generated entry-point source file.
pub fn entry_source() -> &'static str {
    ENTRY_SOURCE
}
