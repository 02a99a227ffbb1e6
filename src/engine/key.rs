//! Request fingerprints used as cache keys.

use std::fmt;

use super::{Category, EngineRequest};
use crate::error::Result;

/// Deterministic fingerprint of a request's resolved inputs.
///
/// Covers the workflow id, the heap id, the skipped categories and the
/// ordered `(name, version)` pairs of every input nut.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    /// Fingerprint explicit parts.
    pub fn new<'a>(
        workflow_id: &str,
        heap_id: &str,
        skip: &[Category],
        nuts: impl IntoIterator<Item = (&'a str, u64)>,
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        write_str(&mut hasher, workflow_id);
        write_str(&mut hasher, heap_id);

        let mut skip: Vec<u8> = skip.iter().map(|c| *c as u8).collect();
        skip.sort_unstable();
        skip.dedup();
        hasher.update(&(skip.len() as u64).to_le_bytes());
        hasher.update(&skip);

        for (name, version) in nuts {
            write_str(&mut hasher, name);
            hasher.update(&version.to_le_bytes());
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// Fingerprint a request, resolving every nut version.
    pub fn for_request(request: &EngineRequest) -> Result<Self> {
        let versions = request
            .nuts()
            .iter()
            .map(|n| n.version().get().map(|v| (n.name(), v)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(
            request.workflow_id(),
            request.heap().id(),
            request.skip(),
            versions,
        ))
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

/// Length-prefixed so `("ab", "c")` and `("a", "bc")` differ.
fn write_str(hasher: &mut blake3::Hasher, s: &str) {
    hasher.update(&(s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex()[..16])
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable() {
        let a = CacheKey::new("wf", "h", &[], [("a.js", 1), ("b.js", 2)]);
        let b = CacheKey::new("wf", "h", &[], vec![("a.js", 1), ("b.js", 2)]);
        assert_eq!(a, b);
        assert_eq!(a.to_hex(), b.to_hex());
    }

    #[test]
    fn test_any_version_change_changes_key() {
        let a = CacheKey::new("wf", "h", &[], [("a.js", 1), ("b.js", 2)]);
        let b = CacheKey::new("wf", "h", &[], [("a.js", 1), ("b.js", 3)]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_order_and_boundaries_matter() {
        let a = CacheKey::new("wf", "h", &[], [("a.js", 1), ("b.js", 2)]);
        let b = CacheKey::new("wf", "h", &[], [("b.js", 2), ("a.js", 1)]);
        assert_ne!(a, b);

        let c = CacheKey::new("ab", "c", &[], []);
        let d = CacheKey::new("a", "bc", &[], []);
        assert_ne!(c, d);
    }

    #[test]
    fn test_skip_set_is_order_insensitive() {
        let a = CacheKey::new("wf", "h", &[Category::Cache, Category::Compression], []);
        let b = CacheKey::new("wf", "h", &[Category::Compression, Category::Cache], []);
        let c = CacheKey::new("wf", "h", &[], []);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
