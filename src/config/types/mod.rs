//! Configuration utility types.
//!
//! | Module  | Purpose                              |
//! |---------|--------------------------------------|
//! | `error` | Configuration errors and diagnostics |
//! | `field` | Field paths used in diagnostics      |

mod error;
mod field;

pub use error::{ConfigDiagnostic, ConfigDiagnostics, ConfigError, Severity};
pub use field::FieldPath;
