//! Configuration errors and validation diagnostics.

use super::FieldPath;
use owo_colors::OwoColorize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading `nutflow.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file `{0}`")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("malformed config file")]
    Toml(#[from] toml::de::Error),

    /// Every problem found by validation, rendered together.
    #[error("{0}")]
    Diagnostics(ConfigDiagnostics),
}

// ============================================================================
// ConfigDiagnostic
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Rejects the configuration.
    Error,
    /// Printed, configuration still accepted.
    Warning,
}

/// One finding about one field.
#[derive(Debug, Clone)]
pub struct ConfigDiagnostic {
    pub severity: Severity,
    pub field: FieldPath,
    pub message: String,
    pub hint: Option<String>,
}

impl ConfigDiagnostic {
    pub fn new(severity: Severity, field: FieldPath, message: impl Into<String>) -> Self {
        Self {
            severity,
            field,
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl fmt::Display for ConfigDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.severity {
            Severity::Error => write!(f, "{} {}: {}", "×".red().bold(), self.field, self.message)?,
            Severity::Warning => write!(f, "{} {}: {}", "!".yellow(), self.field, self.message)?,
        }
        if let Some(hint) = &self.hint {
            write!(f, " ({})", hint.dimmed())?;
        }
        Ok(())
    }
}

// ============================================================================
// ConfigDiagnostics
// ============================================================================

/// Findings collected while validating every section.
#[derive(Debug, Default)]
pub struct ConfigDiagnostics {
    items: Vec<ConfigDiagnostic>,
}

impl ConfigDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(&mut self, field: FieldPath, message: impl Into<String>) {
        self.items
            .push(ConfigDiagnostic::new(Severity::Error, field, message));
    }

    pub fn error_with_hint(
        &mut self,
        field: FieldPath,
        message: impl Into<String>,
        hint: impl Into<String>,
    ) {
        self.items
            .push(ConfigDiagnostic::new(Severity::Error, field, message).with_hint(hint));
    }

    pub fn warn(&mut self, field: FieldPath, message: impl Into<String>) {
        self.items
            .push(ConfigDiagnostic::new(Severity::Warning, field, message));
    }

    pub fn errors(&self) -> Vec<&ConfigDiagnostic> {
        self.of(Severity::Error).collect()
    }

    pub fn warnings(&self) -> Vec<&ConfigDiagnostic> {
        self.of(Severity::Warning).collect()
    }

    fn of(&self, severity: Severity) -> impl Iterator<Item = &ConfigDiagnostic> {
        self.items.iter().filter(move |d| d.severity == severity)
    }

    pub fn print_warnings(&self) {
        for warning in self.of(Severity::Warning) {
            crate::log!("config"; "{}", warning);
        }
    }

    pub fn has_errors(&self) -> bool {
        self.of(Severity::Error).next().is_some()
    }

    /// Number of errors.
    pub fn len(&self) -> usize {
        self.of(Severity::Error).count()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_errors()
    }

    /// `Err(self)` when any error was recorded.
    pub fn into_result(self) -> Result<(), Self> {
        if self.has_errors() { Err(self) } else { Ok(()) }
    }
}

impl fmt::Display for ConfigDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.len();
        write!(
            f,
            "{} ({} error{})",
            "invalid configuration".red().bold(),
            count,
            if count == 1 { "" } else { "s" }
        )?;
        for error in self.of(Severity::Error) {
            write!(f, "\n  {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigDiagnostics {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn test_io_error_names_file() {
        let err = ConfigError::Io(
            PathBuf::from("nutflow.toml"),
            Error::new(ErrorKind::NotFound, "file not found"),
        );
        assert!(err.to_string().contains("nutflow.toml"));
    }

    #[test]
    fn test_warnings_do_not_fail() {
        let mut diag = ConfigDiagnostics::new();
        diag.warn(FieldPath::new("store.polling_interval"), "negative");
        assert!(diag.is_empty());
        assert_eq!(diag.warnings().len(), 1);
        assert!(diag.into_result().is_ok());
    }

    #[test]
    fn test_errors_rendered_together() {
        let mut diag = ConfigDiagnostics::new();
        diag.error_with_hint(FieldPath::new("cache.time_to_live"), "negative", "use 0");
        diag.error(FieldPath::new("request.charset"), "unsupported");
        assert_eq!(diag.len(), 2);

        let shown = diag.into_result().unwrap_err().to_string();
        assert!(shown.contains("2 errors"));
        assert!(shown.contains("cache.time_to_live"));
        assert!(shown.contains("use 0"));
        assert!(shown.contains("request.charset"));
    }
}
