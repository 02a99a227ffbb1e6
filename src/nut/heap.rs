//! Heaps: named, ordered groups of nuts backed by stores.
//!
//! A heap lists paths in one or more stores and may compose other heaps.
//! Resolution is lazy and memoized until the heap is freed. Resolved paths
//! are watched, so a store change frees the heap and notifies its listeners
//! (which purge cached results).

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashSet;

use super::Nut;
use crate::error::{Error, Result};
use crate::store::{ListenerAction, Store, StoreListener};
use crate::{debug, log};

/// Called with the id of a heap whose content changed.
pub type HeapListener = Arc<dyn Fn(&str) + Send + Sync>;

/// A store together with its registration id.
#[derive(Clone)]
pub struct StoreRef {
    pub id: String,
    pub store: Arc<dyn Store>,
}

impl StoreRef {
    pub fn new(id: impl Into<String>, store: Arc<dyn Store>) -> Self {
        Self {
            id: id.into(),
            store,
        }
    }
}

impl fmt::Debug for StoreRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StoreRef").field(&self.id).finish()
    }
}

#[derive(Debug, Clone)]
struct Entry {
    path: String,
    store: Option<StoreRef>,
}

struct HeapInner {
    id: String,
    /// Id reported to listeners (the root heap for derived heaps).
    notify_id: String,
    store: Option<StoreRef>,
    entries: Vec<Entry>,
    composition: Vec<NutsHeap>,
    resolved: RwLock<Option<Vec<(Nut, StoreRef)>>>,
    watcher: Mutex<Option<Arc<dyn StoreListener>>>,
    listeners: Arc<RwLock<Vec<HeapListener>>>,
    /// Root of a derived heap. `None` for heaps built from a registration.
    root: Option<Weak<HeapInner>>,
    /// Heaps derived from this root, kept alive while they are watched.
    derived: Mutex<Vec<NutsHeap>>,
}

/// Shared handle to a heap.
#[derive(Clone)]
pub struct NutsHeap(Arc<HeapInner>);

// ============================================================================
// Builder
// ============================================================================

/// Incremental heap definition.
pub struct HeapBuilder {
    id: String,
    store: Option<StoreRef>,
    entries: Vec<Entry>,
    composition: Vec<NutsHeap>,
}

impl HeapBuilder {
    /// Default store for paths without an override.
    pub fn store(mut self, store: StoreRef) -> Self {
        self.store = Some(store);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.entries.push(Entry {
            path: path.into(),
            store: None,
        });
        self
    }

    pub fn paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entries.extend(paths.into_iter().map(|p| Entry {
            path: p.into(),
            store: None,
        }));
        self
    }

    /// Path resolved in a specific store instead of the default one.
    pub fn path_in(mut self, path: impl Into<String>, store: StoreRef) -> Self {
        self.entries.push(Entry {
            path: path.into(),
            store: Some(store),
        });
        self
    }

    /// Append another heap's nuts after this heap's own paths.
    pub fn compose(mut self, heap: NutsHeap) -> Self {
        self.composition.push(heap);
        self
    }

    pub fn build(self) -> Result<NutsHeap> {
        if self.store.is_none() && self.entries.iter().any(|e| e.store.is_none()) {
            return Err(Error::ConfigurationConflict(format!(
                "heap `{}` lists paths but has no store",
                self.id
            )));
        }
        if self.composition.iter().any(|h| h.heap_ids().contains(&self.id)) {
            return Err(Error::CycleDetected(format!(
                "heap `{}` composes itself",
                self.id
            )));
        }
        Ok(NutsHeap(Arc::new(HeapInner {
            notify_id: self.id.clone(),
            id: self.id,
            store: self.store,
            entries: self.entries,
            composition: self.composition,
            resolved: RwLock::new(None),
            watcher: Mutex::new(None),
            listeners: Arc::new(RwLock::new(Vec::new())),
            root: None,
            derived: Mutex::new(Vec::new()),
        })))
    }
}

// ============================================================================
// NutsHeap
// ============================================================================

impl NutsHeap {
    pub fn builder(id: impl Into<String>) -> HeapBuilder {
        HeapBuilder {
            id: id.into(),
            store: None,
            entries: Vec::new(),
            composition: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn store(&self) -> Option<&StoreRef> {
        self.0.store.as_ref()
    }

    /// Registered paths (own entries only).
    pub fn paths(&self) -> Vec<&str> {
        self.0.entries.iter().map(|e| e.path.as_str()).collect()
    }

    pub fn composition(&self) -> &[NutsHeap] {
        &self.0.composition
    }

    /// This heap's id followed by every composed heap id, depth first.
    pub fn heap_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        let mut seen = FxHashSet::default();
        self.collect_ids(&mut ids, &mut seen);
        ids
    }

    fn collect_ids(&self, ids: &mut Vec<String>, seen: &mut FxHashSet<String>) {
        if !seen.insert(self.0.id.clone()) {
            return;
        }
        ids.push(self.0.id.clone());
        for heap in &self.0.composition {
            heap.collect_ids(ids, seen);
        }
    }

    /// Ids of every store this heap (or a composed heap) reads from.
    pub fn store_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        let mut push = |id: &str| {
            if !ids.iter().any(|i| i == id) {
                ids.push(id.to_string());
            }
        };
        if let Some(s) = &self.0.store {
            push(&s.id);
        }
        for e in &self.0.entries {
            if let Some(s) = &e.store {
                push(&s.id);
            }
        }
        for heap in &self.0.composition {
            for id in heap.store_ids() {
                push(&id);
            }
        }
        ids
    }

    /// Register a callback invoked when this heap's content changes.
    pub fn add_listener(&self, listener: HeapListener) {
        self.0.listeners.write().push(listener);
    }

    pub fn is_resolved(&self) -> bool {
        self.0.resolved.read().is_some()
    }

    /// Resolved nuts: own paths first, then composed heaps, in order.
    ///
    /// A heap resolving to nothing is a [`Error::NotFound`].
    pub fn nuts(&self) -> Result<Vec<Nut>> {
        let mut nuts: Vec<Nut> = self.own_nuts()?.into_iter().map(|(n, _)| n).collect();
        for heap in &self.0.composition {
            match heap.nuts() {
                Ok(more) => nuts.extend(more),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        let mut seen = FxHashSet::default();
        nuts.retain(|n| seen.insert(n.name().to_string()));

        if nuts.is_empty() {
            return Err(Error::NotFound {
                store: self
                    .0
                    .store
                    .as_ref()
                    .map_or_else(|| self.0.id.clone(), |s| s.id.clone()),
                path: format!("heap `{}`", self.0.id),
            });
        }
        Ok(nuts)
    }

    /// Store a resolved nut came from (searching composed heaps too).
    pub fn store_for(&self, name: &str) -> Option<StoreRef> {
        if let Ok(own) = self.own_nuts()
            && let Some((_, s)) = own.iter().find(|(n, _)| n.name() == name)
        {
            return Some(s.clone());
        }
        self.0
            .composition
            .iter()
            .find_map(|h| h.store_for(name))
            .or_else(|| self.0.store.clone())
    }

    fn own_nuts(&self) -> Result<Vec<(Nut, StoreRef)>> {
        if let Some(resolved) = self.0.resolved.read().as_ref() {
            return Ok(resolved.clone());
        }

        let mut resolved: Vec<(Nut, StoreRef)> = Vec::new();
        for entry in &self.0.entries {
            let Some(store) = entry.store.as_ref().or(self.0.store.as_ref()) else {
                continue;
            };
            let mode = store.store.pattern_mode();
            match store.store.resolve(&entry.path, mode) {
                Ok(nuts) => resolved.extend(nuts.into_iter().map(|n| (n, store.clone()))),
                Err(e) if e.is_not_found() => {
                    log!("store"; "heap {}: nothing matches {} in {}", self.0.id, entry.path, store.id);
                }
                Err(e) => return Err(e),
            }
        }

        self.watch(&resolved);
        debug!("store"; "heap {} resolved {} nut(s)", self.0.id, resolved.len());

        let mut slot = self.0.resolved.write();
        Ok(slot.get_or_insert(resolved).clone())
    }

    /// Take `nuts`, already resolved by the caller, as this heap's content
    /// and watch them. A heap that is already resolved is left as is.
    pub fn adopt(&self, nuts: &[Nut]) {
        let Some(store) = self.0.store.clone() else {
            return;
        };
        let mut slot = self.0.resolved.write();
        if slot.is_some() {
            return;
        }
        let resolved: Vec<(Nut, StoreRef)> =
            nuts.iter().map(|n| (n.clone(), store.clone())).collect();
        self.watch(&resolved);
        *slot = Some(resolved);
    }

    fn watch(&self, resolved: &[(Nut, StoreRef)]) {
        let mut watcher = self.0.watcher.lock();
        let listener: Arc<dyn StoreListener> = match watcher.as_ref() {
            Some(l) => Arc::clone(l),
            None => {
                let l: Arc<dyn StoreListener> = Arc::new(HeapWatcher {
                    heap: Arc::downgrade(&self.0),
                });
                *watcher = Some(Arc::clone(&l));
                l
            }
        };
        for (nut, store) in resolved {
            store.store.watch(nut.name(), Arc::clone(&listener));
        }
    }

    /// Drop the resolution and stop watching. The next `nuts()` resolves again.
    ///
    /// Freeing a root also frees and forgets every heap derived from it.
    pub fn free(&self) {
        self.0.resolved.write().take();
        if let Some(listener) = self.0.watcher.lock().take() {
            for store in self.stores() {
                store.store.unwatch(&listener);
            }
        }
        let derived = std::mem::take(&mut *self.0.derived.lock());
        for heap in derived {
            heap.free();
        }
    }

    /// Whether both handles point to the same heap.
    pub fn ptr_eq(&self, other: &NutsHeap) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn stores(&self) -> Vec<StoreRef> {
        let mut stores: Vec<StoreRef> = self.0.store.iter().cloned().collect();
        stores.extend(self.0.entries.iter().filter_map(|e| e.store.clone()));
        stores
    }

    /// Content changed: free and tell listeners.
    pub fn notify_changed(&self) {
        self.free();
        let listeners = self.0.listeners.read().clone();
        for listener in listeners {
            listener(&self.0.notify_id);
        }
    }

    /// Single-store heap sharing this heap's listeners.
    ///
    /// Used for references discovered while scanning; a change in a
    /// referenced nut is reported under the root heap's id. The root keeps
    /// derived heaps alive until it is freed, and deriving the same id twice
    /// returns the existing heap.
    pub fn derive(&self, id: impl Into<String>, store: StoreRef, paths: Vec<String>) -> NutsHeap {
        let id = id.into();
        let root = match &self.0.root {
            Some(root) => root.clone(),
            None => Arc::downgrade(&self.0),
        };
        let owner = root.upgrade();
        if let Some(owner) = &owner
            && let Some(existing) = owner.derived.lock().iter().find(|h| h.0.id == id)
        {
            return existing.clone();
        }

        let heap = NutsHeap(Arc::new(HeapInner {
            id,
            notify_id: self.0.notify_id.clone(),
            store: Some(store),
            entries: paths
                .into_iter()
                .map(|path| Entry { path, store: None })
                .collect(),
            composition: Vec::new(),
            resolved: RwLock::new(None),
            watcher: Mutex::new(None),
            listeners: Arc::clone(&self.0.listeners),
            root: Some(root),
            derived: Mutex::new(Vec::new()),
        }));
        if let Some(owner) = owner {
            owner.derived.lock().push(heap.clone());
        }
        heap
    }
}

impl PartialEq for NutsHeap {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl fmt::Debug for NutsHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NutsHeap")
            .field("id", &self.0.id)
            .field("paths", &self.paths())
            .field("composition", &self.heap_ids())
            .finish()
    }
}

struct HeapWatcher {
    heap: Weak<HeapInner>,
}

impl StoreListener for HeapWatcher {
    fn nut_updated(&self, path: &str) -> ListenerAction {
        if let Some(inner) = self.heap.upgrade() {
            let heap = NutsHeap(inner);
            log!("store"; "{} changed, refreshing heap {}", path, heap.id());
            heap.notify_changed();
        }
        ListenerAction::Dispose
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreOptions};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mem() -> (Arc<MemoryStore>, StoreRef) {
        let store = Arc::new(MemoryStore::in_memory("mem"));
        store.put("a.js", b"var a;".to_vec());
        store.put("b.js", b"var b;".to_vec());
        store.put("c.css", b"c{}".to_vec());
        let r = StoreRef::new("mem", store.clone());
        (store, r)
    }

    fn names(nuts: &[Nut]) -> Vec<&str> {
        nuts.iter().map(Nut::name).collect()
    }

    #[test]
    fn test_resolution_order_and_memo() {
        let (_, store) = mem();
        let heap = NutsHeap::builder("h")
            .store(store)
            .paths(["b.js", "a.js"])
            .build()
            .unwrap();
        assert!(!heap.is_resolved());
        assert_eq!(names(&heap.nuts().unwrap()), vec!["b.js", "a.js"]);
        assert!(heap.is_resolved());
        heap.free();
        assert!(!heap.is_resolved());
    }

    #[test]
    fn test_wildcard_store() {
        let store = Arc::new(
            MemoryStore::with_options(
                "wild",
                StoreOptions {
                    wildcard: true,
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        store.put("js/a.js", b"".to_vec());
        store.put("js/b.js", b"".to_vec());
        let heap = NutsHeap::builder("h")
            .store(StoreRef::new("wild", store))
            .path("js/*.js")
            .build()
            .unwrap();
        assert_eq!(names(&heap.nuts().unwrap()), vec!["js/a.js", "js/b.js"]);
    }

    #[test]
    fn test_composition() {
        let (_, store) = mem();
        let js = NutsHeap::builder("js")
            .store(store.clone())
            .paths(["a.js", "b.js"])
            .build()
            .unwrap();
        let css = NutsHeap::builder("css").store(store).path("c.css").build().unwrap();
        let all = NutsHeap::builder("all").compose(js).compose(css).build().unwrap();

        assert_eq!(names(&all.nuts().unwrap()), vec!["a.js", "b.js", "c.css"]);
        assert_eq!(all.heap_ids(), vec!["all", "js", "css"]);
        assert_eq!(all.store_ids(), vec!["mem"]);
        assert_eq!(all.store_for("c.css").map(|s| s.id), Some("mem".to_string()));
    }

    #[test]
    fn test_empty_heap_not_found() {
        let (_, store) = mem();
        let heap = NutsHeap::builder("h").store(store).path("missing.js").build().unwrap();
        assert!(heap.nuts().unwrap_err().is_not_found());
    }

    #[test]
    fn test_self_composition_rejected() {
        let (_, store) = mem();
        let inner = NutsHeap::builder("loop").store(store).path("a.js").build().unwrap();
        let err = NutsHeap::builder("loop").compose(inner).build().unwrap_err();
        assert!(matches!(err, Error::CycleDetected(_)));
    }

    #[test]
    fn test_paths_without_store_rejected() {
        let err = NutsHeap::builder("h").path("a.js").build().unwrap_err();
        assert!(matches!(err, Error::ConfigurationConflict(_)));
    }

    #[test]
    fn test_store_change_notifies_listeners() {
        let (raw, store) = mem();
        let heap = NutsHeap::builder("h").store(store.clone()).path("a.js").build().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        heap.add_listener(Arc::new(move |id| {
            assert_eq!(id, "h");
            h.fetch_add(1, Ordering::SeqCst);
        }));

        heap.nuts().unwrap();
        raw.put("a.js", b"var a2;".to_vec());
        raw.poll_now();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!heap.is_resolved());

        let derived = heap.derive("h#b.js", store, vec!["b.js".into()]);
        derived.nuts().unwrap();
        raw.put("b.js", b"var b2;".to_vec());
        raw.poll_now();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_adopted_nuts_watched_after_handle_dropped() {
        let (raw, store) = mem();
        let heap = NutsHeap::builder("h").store(store.clone()).path("a.js").build().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        heap.add_listener(Arc::new(move |id| {
            assert_eq!(id, "h");
            h.fetch_add(1, Ordering::SeqCst);
        }));

        {
            let found = store.store.resolve("c.css", crate::store::PatternMode::Exact).unwrap();
            let derived = heap.derive("h:c.css", store.clone(), vec!["c.css".into()]);
            derived.adopt(&found);
            assert!(derived.is_resolved());
            let again = heap.derive("h:c.css", store.clone(), vec!["c.css".into()]);
            assert!(again.ptr_eq(&derived));
        }

        raw.put("c.css", b"c{color:red}".to_vec());
        raw.poll_now();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_free_root_stops_derived_watches() {
        let (raw, store) = mem();
        let heap = NutsHeap::builder("h").store(store.clone()).path("a.js").build().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        heap.add_listener(Arc::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        heap.derive("h:b.js", store, vec!["b.js".into()]).nuts().unwrap();
        heap.free();
        raw.put("b.js", b"var b2;".to_vec());
        raw.poll_now();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
