//! Dotted paths naming config fields in diagnostics.

use owo_colors::OwoColorize;
use std::fmt;

/// Path of a config field, e.g. `cache.time_to_live`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldPath(&'static str);

impl FieldPath {
    pub const fn new(path: &'static str) -> Self {
        Self(path)
    }

    /// Table the field lives in (`cache` for `cache.time_to_live`).
    pub fn section(&self) -> &'static str {
        self.0.split_once('.').map_or(self.0, |(section, _)| section)
    }

    pub const fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let quoted = format!("`{}`", self.0);
        write!(f, "{}", quoted.bright_blue())
    }
}
