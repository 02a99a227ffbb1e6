//! Generic store built on a minimal byte backend.

use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::polling::Watches;
use super::{Matcher, PatternMode, Store, StoreListener, StoreOptions};
use crate::error::{Error, Result};
use crate::nut::{Nut, NutType, Opener, Version, VersionStrategy};
use crate::utils::hash::content_version_reader;
use crate::utils::path::merge_path;
use crate::utils::schedule::{Periodic, period_from_secs};
use crate::debug;

/// Raw access to stored bytes.
pub trait StoreBackend: Send + Sync + 'static {
    fn name(&self) -> String;

    /// Every path held by the backend.
    fn list_all(&self) -> Result<Vec<String>>;

    fn read(&self, path: &str) -> Result<Box<dyn Read + Send>>;

    /// Modification timestamp in milliseconds.
    fn last_modified(&self, path: &str) -> Result<u64>;

    fn exists(&self, path: &str) -> bool;
}

struct Inner<B> {
    backend: B,
    mode: PatternMode,
    options: StoreOptions,
    interval: AtomicI64,
    watches: Watches,
}

/// [`Store`] implementation shared by memory and disk stores.
pub struct BackendStore<B: StoreBackend> {
    inner: Arc<Inner<B>>,
    poller: Mutex<Option<Periodic>>,
}

impl<B: StoreBackend> BackendStore<B> {
    /// Fails when the options ask for both wildcard and regex patterns.
    pub fn new(backend: B, options: StoreOptions) -> Result<Self> {
        let mode = options.pattern_mode()?;
        Ok(Self::with_mode(backend, mode, options))
    }

    pub(super) fn with_mode(backend: B, mode: PatternMode, options: StoreOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                mode,
                interval: AtomicI64::new(options.polling_interval),
                options,
                watches: Watches::default(),
            }),
            poller: Mutex::new(None),
        }
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    pub fn options(&self) -> &StoreOptions {
        &self.inner.options
    }

    fn nut(&self, path: &str, nut_type: NutType) -> Nut {
        let inner = Arc::clone(&self.inner);
        let name = path.to_string();
        let opener: Opener = Arc::new(move || inner.backend.read(&name));

        let version = match self.inner.options.version_strategy {
            VersionStrategy::Fixed(v) => Version::fixed(v),
            VersionStrategy::ContentHash => {
                let opener = Arc::clone(&opener);
                let name = path.to_string();
                Version::lazy(path, move || {
                    content_version_reader(opener()?).map_err(|e| Error::io(name, e))
                })
            }
            VersionStrategy::Timestamp => {
                let inner = Arc::clone(&self.inner);
                let name = path.to_string();
                Version::lazy(path, move || inner.backend.last_modified(&name))
            }
        };

        let nut = Nut::new(path, nut_type, version, opener);
        match self.proxy_uri(path) {
            Some(uri) => nut.with_proxy_uri(uri),
            None => nut,
        }
    }

    fn ensure_polling(&self) {
        let Some(period) = period_from_secs(self.inner.interval.load(Ordering::Relaxed)) else {
            return;
        };
        let mut poller = self.poller.lock();
        if poller.is_none() {
            *poller = Some(self.spawn_poller(period));
        }
    }

    fn spawn_poller(&self, period: Duration) -> Periodic {
        let inner = Arc::downgrade(&self.inner);
        Periodic::start("poll", period, move || {
            if let Some(inner) = inner.upgrade() {
                poll(&inner);
            }
        })
    }
}

fn poll<B: StoreBackend>(inner: &Inner<B>) {
    inner
        .watches
        .poll(&inner.backend.name(), |path| inner.backend.last_modified(path).ok());
}

impl<B: StoreBackend> Store for BackendStore<B> {
    fn name(&self) -> String {
        self.inner.backend.name()
    }

    fn pattern_mode(&self) -> PatternMode {
        self.inner.mode
    }

    fn list(&self, pattern: &str) -> Result<Vec<String>> {
        list_matching(&self.inner.backend, pattern, self.inner.mode)
    }

    fn resolve(&self, path: &str, mode: PatternMode) -> Result<Vec<Nut>> {
        let paths = list_matching(&self.inner.backend, path, mode)?;
        let nuts: Vec<Nut> = paths
            .iter()
            .filter_map(|p| match NutType::from_name(p) {
                Some(t) => Some(self.nut(p, t)),
                None => {
                    debug!("store"; "ignoring {} (unknown type)", p);
                    None
                }
            })
            .collect();

        if nuts.is_empty() {
            return Err(Error::NotFound {
                store: self.name(),
                path: path.to_string(),
            });
        }
        Ok(nuts)
    }

    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        self.inner.backend.read(path)
    }

    fn exists(&self, path: &str) -> bool {
        self.inner.backend.exists(path)
    }

    fn last_modified(&self, path: &str) -> Result<u64> {
        self.inner.backend.last_modified(path)
    }

    fn watch(&self, path: &str, listener: Arc<dyn StoreListener>) {
        let stamp = self.inner.backend.last_modified(path).ok();
        self.inner.watches.add(path, listener, stamp);
        self.ensure_polling();
    }

    fn unwatch(&self, listener: &Arc<dyn StoreListener>) {
        self.inner.watches.remove(listener);
    }

    fn set_polling_interval(&self, secs: i64) {
        self.inner.interval.store(secs, Ordering::Relaxed);
        let mut poller = self.poller.lock();
        match (period_from_secs(secs), poller.as_ref()) {
            (Some(period), Some(p)) => p.set_interval(period),
            (Some(period), None) => {
                if !self.inner.watches.is_empty() {
                    *poller = Some(self.spawn_poller(period));
                }
            }
            (None, _) => {
                if let Some(p) = poller.take() {
                    p.stop();
                }
            }
        }
    }

    fn poll_now(&self) {
        poll(&self.inner);
    }

    fn free(&self) {
        self.inner.watches.clear();
        if let Some(p) = self.poller.lock().take() {
            p.stop();
        }
    }

    fn proxy_uri(&self, path: &str) -> Option<String> {
        self.inner
            .options
            .proxy_base
            .as_deref()
            .map(|base| merge_path(&[base, path]))
    }
}

/// Sorted backend paths matching `pattern`.
fn list_matching<B: StoreBackend>(backend: &B, pattern: &str, mode: PatternMode) -> Result<Vec<String>> {
    if mode == PatternMode::Exact {
        return Ok(if backend.exists(pattern) {
            vec![pattern.to_string()]
        } else {
            Vec::new()
        });
    }
    let matcher = Matcher::new(pattern, mode)?;
    let mut paths: Vec<String> = backend
        .list_all()?
        .into_iter()
        .filter(|p| matcher.is_match(p))
        .collect();
    paths.sort();
    Ok(paths)
}
