//! `[engine]` section configuration.
//!
//! Switches for the built-in stages.
//!
//! # Example
//!
//! ```toml
//! [engine]
//! aggregate = true     # Concatenate the nuts of a chain into aggregate.<ext>
//! inspect = true       # Rewrite url(), @import, src/href and sourceMappingURL
//! minify = true        # Minify JavaScript and CSS
//! compress = false     # Gzip text nuts
//! best_effort = false  # Answer cache misses with a partial result
//! ```

use serde::{Deserialize, Serialize};

/// Built-in stage switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSectionConfig {
    pub aggregate: bool,
    pub inspect: bool,
    pub minify: bool,
    pub compress: bool,
    pub best_effort: bool,
}

impl Default for EngineSectionConfig {
    fn default() -> Self {
        Self {
            aggregate: true,
            inspect: true,
            minify: true,
            compress: false,
            best_effort: false,
        }
    }
}
