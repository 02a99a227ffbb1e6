//! The immutable nut: name, type, version and a way to read its bytes.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::{Cursor, Read};
use std::sync::Arc;

use super::{NutType, Version};
use crate::error::{Error, Result};
use crate::utils::hash::content_version;

/// Opens a fresh byte stream on each call.
pub type Opener = Arc<dyn Fn() -> Result<Box<dyn Read + Send>> + Send + Sync>;

/// A named, typed, versioned unit of content.
///
/// # Invariants
/// - `name` and `nut_type` never change after construction
/// - equality and hashing only consider `name`
#[derive(Clone)]
pub struct Nut {
    name: Arc<str>,
    nut_type: NutType,
    version: Version,
    opener: Opener,
    dynamic: bool,
    proxy_uri: Option<Arc<str>>,
}

impl Nut {
    /// Create a nut from its identity, version and content opener.
    pub fn new(name: impl Into<Arc<str>>, nut_type: NutType, version: Version, opener: Opener) -> Self {
        Self {
            name: name.into(),
            nut_type,
            version,
            opener,
            dynamic: false,
            proxy_uri: None,
        }
    }

    /// In-memory nut, versioned by its content hash.
    pub fn from_bytes(name: impl Into<Arc<str>>, nut_type: NutType, bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes: Arc<[u8]> = bytes.into();
        let version = Version::fixed(content_version(&bytes));
        Self::with_bytes(name, nut_type, version, bytes)
    }

    /// In-memory nut with an explicit version.
    pub fn with_bytes(
        name: impl Into<Arc<str>>,
        nut_type: NutType,
        version: Version,
        bytes: impl Into<Arc<[u8]>>,
    ) -> Self {
        let bytes: Arc<[u8]> = bytes.into();
        let opener: Opener = Arc::new(move || {
            Ok(Box::new(Cursor::new(Arc::clone(&bytes))) as Box<dyn Read + Send>)
        });
        Self::new(name, nut_type, version, opener)
    }

    /// Mark the nut as dynamic: its content can't be resolved ahead of time.
    pub fn dynamic(mut self, dynamic: bool) -> Self {
        self.dynamic = dynamic;
        self
    }

    /// Externally resolvable address that bypasses normal serving.
    pub fn with_proxy_uri(mut self, uri: impl Into<Arc<str>>) -> Self {
        self.proxy_uri = Some(uri.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nut_type(&self) -> NutType {
        self.nut_type
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn proxy_uri(&self) -> Option<&str> {
        self.proxy_uri.as_deref()
    }

    /// Open a new byte stream on the content.
    pub fn open(&self) -> Result<Box<dyn Read + Send>> {
        (self.opener)()
    }

    /// Read the whole content.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut reader = self.open()?;
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .map_err(|e| Error::io(self.name(), e))?;
        Ok(bytes)
    }
}

impl PartialEq for Nut {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Nut {}

impl Hash for Nut {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Debug for Nut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Nut")
            .field("name", &self.name)
            .field("type", &self.nut_type)
            .field("version", &self.version)
            .field("dynamic", &self.dynamic)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashSet;

    #[test]
    fn test_equality_by_name_only() {
        let a = Nut::from_bytes("a.js", NutType::Javascript, b"var a;".to_vec());
        let b = Nut::from_bytes("a.js", NutType::Javascript, b"var other;".to_vec());
        let c = Nut::from_bytes("c.js", NutType::Javascript, b"var a;".to_vec());
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: FxHashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_same_content_same_version() {
        let a = Nut::from_bytes("a.js", NutType::Javascript, b"var x;".to_vec());
        let b = Nut::from_bytes("b.js", NutType::Javascript, b"var x;".to_vec());
        assert_eq!(a.version().get().unwrap(), b.version().get().unwrap());
    }

    #[test]
    fn test_read_all_reopens() {
        let nut = Nut::from_bytes("a.css", NutType::Css, b"a{}".to_vec());
        assert_eq!(nut.read_all().unwrap(), b"a{}");
        assert_eq!(nut.read_all().unwrap(), b"a{}");
    }

    #[test]
    fn test_flags() {
        let nut = Nut::from_bytes("a.css", NutType::Css, b"".to_vec())
            .dynamic(true)
            .with_proxy_uri("https://cdn/a.css");
        assert!(nut.is_dynamic());
        assert_eq!(nut.proxy_uri(), Some("https://cdn/a.css"));
    }
}
