//! Pipeline configuration from `nutflow.toml`.
//!
//! # Module Structure
//!
//! ```text
//! config/
//! ├── section/       # Configuration section definitions
//! │   ├── engine     # [engine]
//! │   ├── cache      # [cache]
//! │   ├── store      # [store]
//! │   └── request    # [request]
//! ├── types/         # Utility types
//! │   ├── error      # ConfigError, ConfigDiagnostics
//! │   └── field      # FieldPath
//! └── mod.rs         # PipelineConfig (this file)
//! ```
//!
//! Every section is optional; an empty file yields the defaults.

pub mod section;
pub mod types;

pub use section::{
    CacheSectionConfig, EngineSectionConfig, RequestSectionConfig, StoreSectionConfig,
};
pub use types::{ConfigDiagnostic, ConfigDiagnostics, ConfigError, FieldPath, Severity};

use crate::log;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

// ============================================================================
// root configuration
// ============================================================================

/// Root configuration structure representing `nutflow.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Built-in stage switches
    #[serde(default)]
    pub engine: EngineSectionConfig,

    /// Result cache
    #[serde(default)]
    pub cache: CacheSectionConfig,

    /// Defaults for registered stores
    #[serde(default)]
    pub store: StoreSectionConfig,

    /// Request charset and URL prefix
    #[serde(default)]
    pub request: RequestSectionConfig,
}

impl PipelineConfig {
    /// Read, parse and validate a configuration file.
    ///
    /// Unknown keys are reported as warnings and otherwise ignored.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;

        let (config, ignored) = Self::parse_with_ignored(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        let label = path
            .file_name()
            .map_or_else(|| path.to_string_lossy(), |name| name.to_string_lossy());
        warn_unknown(&label, &ignored);

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let (config, ignored) = Self::parse_with_ignored(content)?;
        warn_unknown("inline config", &ignored);
        config.validate()?;
        Ok(config)
    }

    /// Parse config and collect ignored (unknown) fields.
    fn parse_with_ignored(content: &str) -> Result<(Self, Vec<String>)> {
        let mut ignored = Vec::new();
        let deserializer = toml::Deserializer::new(content);
        let config = serde_ignored::deserialize(deserializer, |path: serde_ignored::Path| {
            ignored.push(path.to_string());
        })
        .map_err(ConfigError::Toml)?;
        Ok((config, ignored))
    }

    /// Validate every section.
    ///
    /// Collects all problems and returns them at once; warnings are printed.
    pub fn validate(&self) -> Result<()> {
        let mut diag = ConfigDiagnostics::new();

        self.cache.validate(&mut diag);
        self.store.validate(&mut diag);
        self.request.validate(&mut diag);

        diag.print_warnings();
        diag.into_result()
            .map_err(|e| ConfigError::Diagnostics(e).into())
    }
}

/// Unknown keys are ignored, but listed so typos do not go unnoticed.
fn warn_unknown(source: &str, fields: &[String]) {
    if fields.is_empty() {
        return;
    }
    log!("config"; "{} unknown key(s) in {}: {}", fields.len(), source, fields.join(", "));
}

// ============================================================================
// Test Helpers (available to all modules via `use crate::config::test_*`)
// ============================================================================

/// Parse config text, asserting that every key is known.
#[cfg(test)]
pub fn test_parse_config(content: &str) -> PipelineConfig {
    let (parsed, ignored) = PipelineConfig::parse_with_ignored(content).unwrap();
    assert!(
        ignored.is_empty(),
        "test config has unknown fields: {:?}",
        ignored
    );
    parsed
}

// ============================================================================
// tests
// ============================================================================
