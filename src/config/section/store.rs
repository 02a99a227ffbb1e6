//! `[store]` section configuration.
//!
//! Defaults applied to the stores registered by [`crate::context::ContextBuilder::configure_default`].
//!
//! ```toml
//! [store]
//! polling_interval = 0             # Seconds, 0 = no polling
//! content_based_versioning = true  # Hash content (true) or use timestamps (false)
//! # fixed_version = 42             # Constant version, requires content_based_versioning = false
//! ```

use serde::{Deserialize, Serialize};

use crate::config::{ConfigDiagnostics, FieldPath};
use crate::nut::VersionStrategy;
use crate::store::StoreOptions;

/// Store defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSectionConfig {
    pub polling_interval: i64,
    pub content_based_versioning: bool,
    pub fixed_version: Option<u64>,
}

impl StoreSectionConfig {
    pub const FIXED_VERSION: FieldPath = FieldPath::new("store.fixed_version");
    pub const POLLING_INTERVAL: FieldPath = FieldPath::new("store.polling_interval");

    pub fn version_strategy(&self) -> VersionStrategy {
        match (self.fixed_version, self.content_based_versioning) {
            (Some(v), _) => VersionStrategy::Fixed(v),
            (None, true) => VersionStrategy::ContentHash,
            (None, false) => VersionStrategy::Timestamp,
        }
    }

    /// Options for a store with exact path matching.
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            version_strategy: self.version_strategy(),
            polling_interval: self.polling_interval,
            ..StoreOptions::default()
        }
    }

    pub fn validate(&self, diag: &mut ConfigDiagnostics) {
        if self.fixed_version.is_some() && self.content_based_versioning {
            diag.error_with_hint(
                Self::FIXED_VERSION,
                "conflicts with content_based_versioning = true",
                "set content_based_versioning = false to use a fixed version",
            );
        }
        if self.polling_interval < 0 {
            diag.warn(Self::POLLING_INTERVAL, "negative interval disables polling");
        }
    }
}

impl Default for StoreSectionConfig {
    fn default() -> Self {
        Self {
            polling_interval: 0,
            content_based_versioning: true,
            fixed_version: None,
        }
    }
}
