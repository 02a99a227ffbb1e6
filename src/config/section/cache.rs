//! `[cache]` section configuration.
//!
//! ```toml
//! [cache]
//! enabled = true
//! time_to_live = 0     # Seconds between full clears, 0 = never
//! ```

use serde::{Deserialize, Serialize};

use crate::config::{ConfigDiagnostics, FieldPath};

/// Result cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSectionConfig {
    pub enabled: bool,
    pub time_to_live: i64,
}

impl CacheSectionConfig {
    pub const TIME_TO_LIVE: FieldPath = FieldPath::new("cache.time_to_live");

    pub fn validate(&self, diag: &mut ConfigDiagnostics) {
        if self.time_to_live < 0 {
            diag.error_with_hint(
                Self::TIME_TO_LIVE,
                format!("must not be negative, got {}", self.time_to_live),
                "use 0 to keep entries until the configuration changes",
            );
        }
        if !self.enabled && self.time_to_live > 0 {
            diag.warn(Self::TIME_TO_LIVE, "ignored while the cache is disabled");
        }
    }
}

impl Default for CacheSectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            time_to_live: 0,
        }
    }
}
