//! Asynchronously resolved, memoized version numbers.
//!
//! A [`Version`] is a cheap handle. The first `get()` (or a `prefetch()`)
//! triggers the computation; every clone shares the same result. Concurrent
//! callers block on the in-flight computation instead of starting another.

use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Deferred version computation.
pub type VersionFn = Box<dyn FnOnce() -> Result<u64> + Send>;

/// `(referencer name, base version) -> derived version`.
///
/// A failure fails the derived version.
pub type VersionCallback = Arc<dyn Fn(&str, u64) -> Result<u64> + Send + Sync>;

/// How a store computes the versions of the nuts it creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionStrategy {
    /// Hash of the byte content.
    #[default]
    ContentHash,
    /// Last-modified timestamp reported by the store.
    Timestamp,
    /// Constant supplied by configuration.
    Fixed(u64),
}

/// Shared handle to a version number.
#[derive(Clone)]
pub struct Version(Arc<VersionCell>);

struct VersionCell {
    name: String,
    value: OnceLock<std::result::Result<u64, String>>,
    compute: Mutex<Option<VersionFn>>,
}

impl Version {
    /// Already resolved version.
    pub fn fixed(value: u64) -> Self {
        let value_cell = OnceLock::new();
        let _ = value_cell.set(Ok(value));
        Self(Arc::new(VersionCell {
            name: String::new(),
            value: value_cell,
            compute: Mutex::new(None),
        }))
    }

    /// Version computed on first access.
    pub fn lazy<F>(name: impl Into<String>, compute: F) -> Self
    where
        F: FnOnce() -> Result<u64> + Send + 'static,
    {
        Self(Arc::new(VersionCell {
            name: name.into(),
            value: OnceLock::new(),
            compute: Mutex::new(Some(Box::new(compute))),
        }))
    }

    /// Version named `name` tracking `self` through `(referencer, callback)`
    /// pairs, applied in order.
    pub fn derive(&self, name: impl Into<String>, callbacks: Vec<(String, VersionCallback)>) -> Self {
        if callbacks.is_empty() {
            return self.clone();
        }
        let base = self.clone();
        Self::lazy(name, move || {
            let start = base.get()?;
            callbacks
                .iter()
                .try_fold(start, |v, (referencer, cb)| cb(referencer, v))
        })
    }

    /// Resolve the version, blocking on a pending computation.
    pub fn get(&self) -> Result<u64> {
        let cell = &self.0;
        let resolved = cell.value.get_or_init(|| {
            let compute = cell.compute.lock().take();
            match compute {
                Some(compute) => compute().map_err(|e| e.to_string()),
                None => Err("no version computation registered".to_string()),
            }
        });
        resolved.clone().map_err(|reason| Error::Version {
            name: cell.name.clone(),
            reason,
        })
    }

    /// Resolved value if the computation already finished successfully.
    pub fn try_get(&self) -> Option<u64> {
        self.0.value.get().and_then(|r| r.as_ref().ok().copied())
    }

    /// Whether the computation finished (successfully or not).
    pub fn is_resolved(&self) -> bool {
        self.0.value.get().is_some()
    }

    /// Start resolving on the rayon pool without waiting.
    pub fn prefetch(&self) {
        if self.is_resolved() {
            return;
        }
        let handle = self.clone();
        rayon::spawn(move || {
            let _ = handle.get();
        });
    }

    /// Whether two handles share the same computation.
    pub fn ptr_eq(&self, other: &Version) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.value.get() {
            Some(Ok(v)) => write!(f, "Version({v})"),
            Some(Err(e)) => write!(f, "Version(error: {e})"),
            None => f.write_str("Version(pending)"),
        }
    }
}
