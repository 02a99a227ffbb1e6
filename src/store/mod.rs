//! Store contract: resolving paths into nuts and reporting changes.
//!
//! A [`Store`] is the boundary to whatever actually holds bytes. The
//! pipeline only relies on this trait; [`BackendStore`] implements the
//! shared parts (pattern matching, versioning, proxy URIs, polling) on top
//! of a minimal [`StoreBackend`].
//!
//! ```text
//! Store (trait)
//!   ├── BackendStore<MemoryBackend>  = MemoryStore
//!   ├── BackendStore<DiskBackend>    = DiskStore
//!   └── ProxyStore                   (in-memory overrides over another store)
//! ```

mod backend;
mod disk;
mod memory;
mod polling;
mod proxy;

use std::io::Read;
use std::sync::Arc;

use regex::Regex;

use crate::error::{Error, Result};
use crate::nut::{Nut, VersionStrategy};

pub use backend::{BackendStore, StoreBackend};
pub use disk::{DiskBackend, DiskStore};
pub use memory::{MemoryBackend, MemoryStore};
pub use proxy::ProxyStore;

// ============================================================================
// Pattern matching
// ============================================================================

/// How a path passed to `list`/`resolve` is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatternMode {
    /// Literal path.
    #[default]
    Exact,
    /// `*` matches any run of characters, `?` a single one.
    Wildcard,
    /// Full regular expression, anchored on both ends.
    Regex,
}

/// Compiled path matcher.
#[derive(Debug, Clone)]
pub enum Matcher {
    Exact(String),
    Pattern(Regex),
}

impl Matcher {
    pub fn new(pattern: &str, mode: PatternMode) -> Result<Self> {
        let source = match mode {
            PatternMode::Exact => return Ok(Self::Exact(pattern.to_string())),
            PatternMode::Wildcard => wildcard_to_regex(pattern),
            PatternMode::Regex => format!("^(?:{pattern})$"),
        };
        Regex::new(&source)
            .map(Self::Pattern)
            .map_err(|source| Error::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })
    }

    pub fn is_match(&self, path: &str) -> bool {
        match self {
            Self::Exact(p) => p == path,
            Self::Pattern(re) => re.is_match(path),
        }
    }
}

fn wildcard_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    let mut literal = String::new();
    for c in pattern.chars() {
        match c {
            '*' | '?' => {
                out.push_str(&regex::escape(&literal));
                literal.clear();
                out.push_str(if c == '*' { ".*" } else { "." });
            }
            _ => literal.push(c),
        }
    }
    out.push_str(&regex::escape(&literal));
    out.push('$');
    out
}

// ============================================================================
// Options
// ============================================================================

/// Per-instance store configuration.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub wildcard: bool,
    pub regex: bool,
    pub version_strategy: VersionStrategy,
    /// Polling period in seconds; non-positive disables polling.
    pub polling_interval: i64,
    /// Base URI under which nuts are also published (e.g. a CDN).
    pub proxy_base: Option<String>,
}

impl StoreOptions {
    /// Pattern mode implied by the flags.
    ///
    /// Wildcard and regex are mutually exclusive.
    pub fn pattern_mode(&self) -> Result<PatternMode> {
        match (self.wildcard, self.regex) {
            (true, true) => Err(Error::ConfigurationConflict(
                "a store can't use both wildcard and regex patterns".to_string(),
            )),
            (true, false) => Ok(PatternMode::Wildcard),
            (false, true) => Ok(PatternMode::Regex),
            (false, false) => Ok(PatternMode::Exact),
        }
    }
}

// ============================================================================
// Listeners
// ============================================================================

/// Whether a listener takes part in the current polling round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    Poll,
    Skip,
}

/// What to do with a listener after it was notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerAction {
    Keep,
    Dispose,
}

/// Observer notified when a watched path changes.
pub trait StoreListener: Send + Sync {
    /// Called at the start of each round with the watched paths.
    fn polling(&self, _paths: &[String]) -> PollDecision {
        PollDecision::Poll
    }

    /// A watched path reported a new timestamp.
    fn nut_updated(&self, path: &str) -> ListenerAction;
}

/// Identity comparison ignoring vtable pointers.
pub(crate) fn same_listener(a: &Arc<dyn StoreListener>, b: &Arc<dyn StoreListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

// ============================================================================
// Store
// ============================================================================

/// Backend abstraction resolving paths to nuts.
pub trait Store: Send + Sync {
    /// Human readable identity used in errors.
    fn name(&self) -> String;

    /// Mode used for paths registered in heaps backed by this store.
    fn pattern_mode(&self) -> PatternMode;

    /// Paths matching `pattern` under this store's pattern mode, sorted.
    fn list(&self, pattern: &str) -> Result<Vec<String>>;

    /// Nuts for every path matching `path` under `mode`.
    ///
    /// An empty match is a [`Error::NotFound`].
    fn resolve(&self, path: &str, mode: PatternMode) -> Result<Vec<Nut>>;

    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>>;

    fn exists(&self, path: &str) -> bool;

    /// Modification timestamp in milliseconds.
    fn last_modified(&self, path: &str) -> Result<u64>;

    /// Register `listener` for changes on `path`.
    fn watch(&self, path: &str, listener: Arc<dyn StoreListener>);

    /// Remove every watch held by `listener`.
    fn unwatch(&self, listener: &Arc<dyn StoreListener>);

    /// Change the polling period; non-positive stops future ticks.
    fn set_polling_interval(&self, secs: i64);

    /// Run one polling round on the calling thread.
    fn poll_now(&self);

    /// Release watches and background tasks.
    fn free(&self);

    /// External address for `path`, if the store publishes one.
    fn proxy_uri(&self, _path: &str) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_matcher() {
        let m = Matcher::new("css/*.css", PatternMode::Wildcard).unwrap();
        assert!(m.is_match("css/a.css"));
        assert!(m.is_match("css/sub/b.css"));
        assert!(!m.is_match("js/a.js"));
        assert!(!m.is_match("css/a.css.map"));

        let m = Matcher::new("a?.js", PatternMode::Wildcard).unwrap();
        assert!(m.is_match("a1.js"));
        assert!(!m.is_match("a.js"));
    }

    #[test]
    fn test_regex_matcher_is_anchored() {
        let m = Matcher::new(r"js/.*\.js", PatternMode::Regex).unwrap();
        assert!(m.is_match("js/a.js"));
        assert!(!m.is_match("lib/js/a.js"));
    }

    #[test]
    fn test_invalid_regex() {
        let err = Matcher::new("(", PatternMode::Regex).unwrap_err();
        assert!(matches!(err, Error::InvalidPattern { .. }));
    }

    #[test]
    fn test_exact_is_literal() {
        let m = Matcher::new("a.*", PatternMode::Exact).unwrap();
        assert!(m.is_match("a.*"));
        assert!(!m.is_match("a.js"));
    }

    #[test]
    fn test_wildcard_and_regex_conflict() {
        let options = StoreOptions {
            wildcard: true,
            regex: true,
            ..Default::default()
        };
        assert!(matches!(
            options.pattern_mode(),
            Err(Error::ConfigurationConflict(_))
        ));
        assert_eq!(
            StoreOptions::default().pattern_mode().unwrap(),
            PatternMode::Exact
        );
    }
}
