//! Directory-backed store.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use jwalk::WalkDir;

use super::{BackendStore, StoreBackend, StoreOptions};
use crate::error::{Error, Result};
use crate::utils::path::simplify;

/// Store reading nuts from a directory tree.
pub type DiskStore = BackendStore<DiskBackend>;

const IGNORED_FILES: &[&str] = &[".DS_Store"];

/// Files under a root directory, addressed by `/`-separated relative paths.
pub struct DiskBackend {
    root: PathBuf,
}

impl DiskBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &str) -> Option<PathBuf> {
        let relative = simplify(path.trim_start_matches('/'))?;
        Some(self.root.join(relative))
    }

    fn locate(&self, path: &str) -> Result<PathBuf> {
        self.full_path(path).ok_or_else(|| Error::NotFound {
            store: self.name(),
            path: path.to_string(),
        })
    }
}

impl StoreBackend for DiskBackend {
    fn name(&self) -> String {
        format!("disk:{}", self.root.display())
    }

    fn list_all(&self) -> Result<Vec<String>> {
        let mut paths: Vec<String> = WalkDir::new(&self.root)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                let name = e.file_name().to_str().unwrap_or_default();
                !IGNORED_FILES.contains(&name)
            })
            .filter_map(|e| {
                let path = e.path();
                let relative = path.strip_prefix(&self.root).ok()?;
                let parts: Vec<&str> = relative
                    .components()
                    .filter_map(|c| c.as_os_str().to_str())
                    .collect();
                Some(parts.join("/"))
            })
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn read(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        let full = self.locate(path)?;
        let file = File::open(&full).map_err(|e| Error::io(path, e))?;
        Ok(Box::new(file))
    }

    fn last_modified(&self, path: &str) -> Result<u64> {
        let full = self.locate(path)?;
        let modified = full
            .metadata()
            .and_then(|m| m.modified())
            .map_err(|e| Error::io(path, e))?;
        Ok(modified
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64))
    }

    fn exists(&self, path: &str) -> bool {
        self.full_path(path).is_some_and(|p| p.is_file())
    }
}

impl DiskStore {
    pub fn open_dir(root: impl Into<PathBuf>, options: StoreOptions) -> Result<Self> {
        Self::new(DiskBackend::new(root), options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{PatternMode, Store};
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("css")).unwrap();
        fs::create_dir_all(dir.path().join("img")).unwrap();
        fs::write(dir.path().join("css/main.css"), "body{}").unwrap();
        fs::write(dir.path().join("img/bg.png"), [0u8, 1, 2]).unwrap();
        fs::write(dir.path().join("css/.DS_Store"), "").unwrap();
        dir
    }

    #[test]
    fn test_list_all_relative_and_sorted() {
        let dir = setup();
        let backend = DiskBackend::new(dir.path());
        assert_eq!(backend.list_all().unwrap(), vec!["css/main.css", "img/bg.png"]);
    }

    #[test]
    fn test_resolve_and_read() {
        let dir = setup();
        let store = DiskStore::open_dir(
            dir.path(),
            StoreOptions {
                wildcard: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(store.pattern_mode(), PatternMode::Wildcard);

        let nuts = store.resolve("css/*", PatternMode::Wildcard).unwrap();
        assert_eq!(nuts.len(), 1);
        assert_eq!(nuts[0].read_all().unwrap(), b"body{}");
        assert!(store.last_modified("css/main.css").unwrap() > 0);
    }

    #[test]
    fn test_paths_outside_root_are_missing() {
        let dir = setup();
        let backend = DiskBackend::new(dir.path().join("css"));
        assert!(!backend.exists("../img/bg.png"));
        assert!(backend.read("../img/bg.png").is_err());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = setup();
        let backend = DiskBackend::new(dir.path());
        assert!(matches!(backend.read("nope.css"), Err(Error::Io(..))));
    }
}
