//! `[request]` section configuration.
//!
//! ```toml
//! [request]
//! charset = "UTF-8"
//! context_path = "/static"   # Prefix of every rewritten URL
//! ```

use serde::{Deserialize, Serialize};

use crate::config::{ConfigDiagnostics, FieldPath};

/// Charsets whose bytes are valid UTF-8 for the texts we rewrite.
const UTF8_COMPATIBLE: &[&str] = &["utf-8", "utf8", "us-ascii", "ascii"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestSectionConfig {
    pub charset: String,
    pub context_path: String,
}

impl RequestSectionConfig {
    pub const CHARSET: FieldPath = FieldPath::new("request.charset");

    pub fn validate(&self, diag: &mut ConfigDiagnostics) {
        let charset = self.charset.to_ascii_lowercase();
        if !UTF8_COMPATIBLE.contains(&charset.as_str()) {
            diag.error_with_hint(
                Self::CHARSET,
                format!("unsupported charset `{}`", self.charset),
                "only UTF-8 compatible content is inspected",
            );
        }
    }
}

impl Default for RequestSectionConfig {
    fn default() -> Self {
        Self {
            charset: "UTF-8".to_string(),
            context_path: String::new(),
        }
    }
}
