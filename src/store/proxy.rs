//! Store overlay serving selected paths from elsewhere.
//!
//! Used by the HTML inspector to give inline `<style>`/`<script>` bodies a
//! path-like identity, and by configuration to route a path to another
//! registered store.

use std::io::Read;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::{Matcher, PatternMode, Store, StoreListener};
use crate::error::{Error, Result};
use crate::nut::Nut;

enum Target {
    Nut(Nut),
    Store(Arc<dyn Store>),
}

/// Delegating store with per-path overrides.
pub struct ProxyStore {
    name: String,
    delegate: Option<Arc<dyn Store>>,
    targets: RwLock<FxHashMap<String, Target>>,
}

impl ProxyStore {
    pub fn new(name: impl Into<String>, delegate: Option<Arc<dyn Store>>) -> Self {
        Self {
            name: name.into(),
            delegate,
            targets: RwLock::new(FxHashMap::default()),
        }
    }

    /// Serve `path` from an in-memory nut.
    pub fn proxy_nut(&self, path: impl Into<String>, nut: Nut) {
        self.targets.write().insert(path.into(), Target::Nut(nut));
    }

    /// Serve `path` from another store.
    pub fn proxy_store(&self, path: impl Into<String>, store: Arc<dyn Store>) {
        self.targets.write().insert(path.into(), Target::Store(store));
    }

    fn missing(&self, path: &str) -> Error {
        Error::NotFound {
            store: self.name.clone(),
            path: path.to_string(),
        }
    }

    fn delegate(&self, path: &str) -> Result<&Arc<dyn Store>> {
        self.delegate.as_ref().ok_or_else(|| self.missing(path))
    }

    fn stores(&self) -> Vec<Arc<dyn Store>> {
        let mut stores: Vec<Arc<dyn Store>> = self
            .targets
            .read()
            .values()
            .filter_map(|t| match t {
                Target::Store(s) => Some(Arc::clone(s)),
                Target::Nut(_) => None,
            })
            .collect();
        stores.extend(self.delegate.iter().cloned());
        stores
    }
}

impl Store for ProxyStore {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn pattern_mode(&self) -> PatternMode {
        self.delegate
            .as_ref()
            .map_or(PatternMode::Exact, |d| d.pattern_mode())
    }

    fn list(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = Matcher::new(pattern, self.pattern_mode())?;
        let mut paths: Vec<String> = self
            .targets
            .read()
            .keys()
            .filter(|p| matcher.is_match(p))
            .cloned()
            .collect();
        if let Some(delegate) = &self.delegate {
            paths.extend(delegate.list(pattern)?);
        }
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    fn resolve(&self, path: &str, mode: PatternMode) -> Result<Vec<Nut>> {
        if mode == PatternMode::Exact {
            match self.targets.read().get(path) {
                Some(Target::Nut(nut)) => return Ok(vec![nut.clone()]),
                Some(Target::Store(store)) => return store.resolve(path, mode),
                None => {}
            }
            return self.delegate(path)?.resolve(path, mode);
        }

        let matcher = Matcher::new(path, mode)?;
        let mut nuts = Vec::new();
        for (key, target) in self.targets.read().iter() {
            if !matcher.is_match(key) {
                continue;
            }
            match target {
                Target::Nut(nut) => nuts.push(nut.clone()),
                Target::Store(store) => nuts.extend(store.resolve(key, PatternMode::Exact)?),
            }
        }
        if let Some(delegate) = &self.delegate {
            match delegate.resolve(path, mode) {
                Ok(found) => nuts.extend(found),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        if nuts.is_empty() {
            return Err(self.missing(path));
        }
        nuts.sort_by(|a, b| a.name().cmp(b.name()));
        nuts.dedup_by(|a, b| a == b);
        Ok(nuts)
    }

    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        match self.targets.read().get(path) {
            Some(Target::Nut(nut)) => nut.open(),
            Some(Target::Store(store)) => store.open(path),
            None => self.delegate(path)?.open(path),
        }
    }

    fn exists(&self, path: &str) -> bool {
        match self.targets.read().get(path) {
            Some(Target::Nut(_)) => true,
            Some(Target::Store(store)) => store.exists(path),
            None => self.delegate.as_ref().is_some_and(|d| d.exists(path)),
        }
    }

    fn last_modified(&self, path: &str) -> Result<u64> {
        match self.targets.read().get(path) {
            Some(Target::Nut(nut)) => nut.version().get(),
            Some(Target::Store(store)) => store.last_modified(path),
            None => self.delegate(path)?.last_modified(path),
        }
    }

    fn watch(&self, path: &str, listener: Arc<dyn StoreListener>) {
        match self.targets.read().get(path) {
            Some(Target::Nut(_)) => {}
            Some(Target::Store(store)) => store.watch(path, listener),
            None => {
                if let Some(d) = &self.delegate {
                    d.watch(path, listener);
                }
            }
        }
    }

    fn unwatch(&self, listener: &Arc<dyn StoreListener>) {
        for store in self.stores() {
            store.unwatch(listener);
        }
    }

    fn set_polling_interval(&self, secs: i64) {
        if let Some(d) = &self.delegate {
            d.set_polling_interval(secs);
        }
    }

    fn poll_now(&self) {
        for store in self.stores() {
            store.poll_now();
        }
    }

    fn free(&self) {
        self.targets.write().retain(|_, t| matches!(t, Target::Nut(_)));
    }

    fn proxy_uri(&self, path: &str) -> Option<String> {
        match self.targets.read().get(path) {
            Some(Target::Nut(nut)) => nut.proxy_uri().map(str::to_string),
            Some(Target::Store(store)) => store.proxy_uri(path),
            None => self.delegate.as_ref().and_then(|d| d.proxy_uri(path)),
        }
    }
}
