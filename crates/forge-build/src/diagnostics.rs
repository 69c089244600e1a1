//! Extraction of line-addressable diagnostics from raw toolchain output.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::Flavor;

// MSVC: `C:\tmp\user.cpp(12): error C2143: syntax error`
// The prefix is lazy so paths like `C:\Program Files (x86)\...` still match.
static RE_PAREN_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^.*?\((\d+)\)[ \t]*:?[ \t]*(.*?)\r?$").expect("valid paren-line regex")
});

// gcc/clang after path stripping: `:12:5: error: expected ';'`
static RE_COLON_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^:(\d+):(?:\d+:)?[ \t]*(.*?)\r?$").expect("valid colon-line regex")
});

/// A `(line, message)` pair pulled out of compiler or linker output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    pub line: u32,
    pub message: String,
}

/// Shape of the location prefix a toolchain prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticFormat {
    /// `path(line): message`
    Msvc,
    /// `path:line:col: message`
    Gnu,
}

impl DiagnosticFormat {
    pub fn for_flavor(flavor: Flavor) -> Self {
        match flavor {
            Flavor::Msvc => DiagnosticFormat::Msvc,
            Flavor::Gnu => DiagnosticFormat::Gnu,
        }
    }

    fn pattern(self) -> &'static Regex {
        match self {
            DiagnosticFormat::Msvc => &RE_PAREN_LINE,
            DiagnosticFormat::Gnu => &RE_COLON_LINE,
        }
    }
}

/// Parse `(line)message` diagnostics.
///
/// See [`parse_with`].
pub fn parse(raw: &str, marker: &str, source_path: &str) -> Vec<DiagnosticRecord> {
    parse_with(DiagnosticFormat::Msvc, raw, marker, source_path)
}

/// Parse diagnostics from raw toolchain output.
///
/// Everything up to and including the last occurrence of `marker` is
/// discarded, so environment-setup banners are never reported. Every literal
/// occurrence of `source_path` is removed, which keeps messages relative to
/// the user's source. Records come back in the order they were printed.
/// Output with no recognisable diagnostics yields an empty list.
pub fn parse_with(
    format: DiagnosticFormat,
    raw: &str,
    marker: &str,
    source_path: &str,
) -> Vec<DiagnosticRecord> {
    let tail = match (marker.is_empty(), raw.rfind(marker)) {
        (false, Some(pos)) => &raw[pos + marker.len()..],
        _ => raw,
    };

    let stripped = if source_path.is_empty() {
        tail.to_string()
    } else {
        tail.replace(source_path, "")
    };

    format
        .pattern()
        .captures_iter(&stripped)
        .filter_map(|caps| {
            let line = caps.get(1)?.as_str().parse().ok()?;
            let message = caps.get(2).map_or("", |m| m.as_str()).trim().to_string();
            Some(DiagnosticRecord { line, message })
        })
        .collect()
}
