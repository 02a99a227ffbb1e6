//! Terminal logging with a colored `[module]` prefix.
//!
//! `log!` always prints unless quiet mode is set; `debug!` and `debug_do!`
//! only act in verbose mode.
//!
//! ```ignore
//! log!("cache"; "best effort result served for {}", key);
//! debug!("inspect"; "{} references found in {}", count, name);
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use owo_colors::{AnsiColors, OwoColorize};

static VERBOSE: AtomicBool = AtomicBool::new(false);
static QUIET: AtomicBool = AtomicBool::new(false);

pub fn set_verbose(verbose: bool) {
    VERBOSE.store(verbose, Ordering::Relaxed);
}

pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

/// Silence `log!` output. Verbose `debug!` output is unaffected.
pub fn set_quiet(quiet: bool) {
    QUIET.store(quiet, Ordering::Relaxed);
}

pub fn is_quiet() -> bool {
    QUIET.load(Ordering::Relaxed)
}

// ============================================================================
// Macros
// ============================================================================

#[macro_export]
macro_rules! log {
    ($module:expr; $($arg:tt)*) => {{
        if !$crate::logger::is_quiet() {
            $crate::logger::log($module, &format!($($arg)*))
        }
    }};
}

#[macro_export]
macro_rules! debug {
    ($module:expr; $($arg:tt)*) => {{
        if $crate::logger::is_verbose() {
            $crate::logger::log($module, &format!($($arg)*))
        }
    }};
}

/// Run a block only in verbose mode, for diagnostics that cost something
/// to assemble.
#[macro_export]
macro_rules! debug_do {
    ($($body:tt)*) => {{
        if $crate::logger::is_verbose() {
            $($body)*
        }
    }};
}

// ============================================================================
// Output
// ============================================================================

/// Write one prefixed line to stderr.
pub fn log(module: &str, message: &str) {
    let line = format!("{} {message}", prefix(module));
    let mut err = std::io::stderr().lock();
    let _ = writeln!(err, "{line}");
}

fn prefix_color(module: &str) -> AnsiColors {
    match module.to_ascii_lowercase().as_str() {
        "cache" => AnsiColors::BrightBlue,
        "store" | "poll" => AnsiColors::BrightGreen,
        "context" | "config" => AnsiColors::BrightMagenta,
        "error" => AnsiColors::BrightRed,
        _ => AnsiColors::BrightYellow,
    }
}

fn prefix(module: &str) -> String {
    format!("[{module}]")
        .color(prefix_color(module))
        .bold()
        .to_string()
}
