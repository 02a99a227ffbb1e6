//! Cache stage: memoizes everything downstream of it.
//!
//! Entries are keyed by [`CacheKey`] and hold fully materialized nuts
//! (transformed bytes, resolved versions, referenced nuts). A miss triggers
//! at most one concurrent full computation per key; other requesters for the
//! same key wait for it.
//!
//! In best-effort mode a request with dynamic nuts is answered immediately
//! with a cached value or an approximation computed from the static nuts
//! only, and the full computation is left to a background task.

use std::fmt;
use std::sync::Arc;

use crossbeam::channel::{self, Sender};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;

use super::{CacheKey, EngineRequest, Next};
use crate::error::Result;
use crate::nut::{
    ConvertibleNut, Nut, NutType, SourceMap, TransformContext, Transformer, Version,
};
use crate::utils::schedule::{Periodic, period_from_secs};
use crate::{debug, log};

// =============================================================================
// Cached values
// =============================================================================

/// A materialized nut: bytes and version are final.
#[derive(Debug, Clone)]
pub struct CachedNut {
    name: String,
    nut_type: NutType,
    bytes: Arc<[u8]>,
    version: u64,
    referenced: Vec<CachedNut>,
    compressed: bool,
    sub_resource: bool,
    proxy_uri: Option<String>,
    source_map: Option<SourceMap>,
}

impl CachedNut {
    /// Transform `nut` (and, recursively, what it references) into a value.
    pub fn materialize(mut nut: ConvertibleNut) -> Result<Self> {
        let bytes = nut.transform(Vec::new())?;
        let version = nut.version().get()?;
        let referenced = nut
            .take_referenced()
            .into_iter()
            .map(Self::materialize)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name: nut.name().to_string(),
            nut_type: nut.nut_type(),
            bytes: bytes.into(),
            version,
            referenced,
            compressed: nut.is_compressed(),
            sub_resource: nut.is_sub_resource(),
            proxy_uri: nut.proxy_uri().map(str::to_string),
            source_map: nut.source_map().cloned(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nut_type(&self) -> NutType {
        self.nut_type
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn referenced(&self) -> &[CachedNut] {
        &self.referenced
    }

    /// Fresh convertible nut delivering the cached bytes.
    ///
    /// Referenced nuts and the source map reappear when it is transformed.
    pub fn to_convertible(&self) -> ConvertibleNut {
        let nut = Nut::with_bytes(
            self.name.as_str(),
            self.nut_type,
            Version::fixed(self.version),
            Arc::clone(&self.bytes),
        );
        let mut out = ConvertibleNut::new(nut);
        out.set_compressed(self.compressed);
        out.set_sub_resource(self.sub_resource);
        out.set_proxy_uri(self.proxy_uri.clone());
        if !self.referenced.is_empty() || self.source_map.is_some() {
            out.add_transformer(Arc::new(Restore {
                referenced: self.referenced.clone(),
                source_map: Mutex::new(self.source_map.clone()),
            }));
        }
        out
    }
}

/// Re-attaches what a cached nut referenced when it was computed.
struct Restore {
    referenced: Vec<CachedNut>,
    source_map: Mutex<Option<SourceMap>>,
}

impl Transformer for Restore {
    fn name(&self) -> &str {
        "restore"
    }

    fn transform(&self, input: Vec<u8>, cx: &mut TransformContext<'_>) -> Result<Vec<u8>> {
        for nut in &self.referenced {
            cx.add_referenced(nut.to_convertible());
        }
        if let Some(map) = self.source_map.lock().take() {
            cx.set_source_map(map);
        }
        Ok(input)
    }
}

// =============================================================================
// NutCache
// =============================================================================

struct CacheEntry {
    full: Option<Arc<[CachedNut]>>,
    best_effort: Option<Arc<[CachedNut]>>,
    workflow_id: String,
    heap_ids: Vec<String>,
    store_ids: Vec<String>,
}

/// Shared key → materialized result map.
///
/// Entries remember which workflow, heaps and stores they were built from so
/// configuration changes can purge them.
#[derive(Default)]
pub struct NutCache {
    entries: DashMap<CacheKey, CacheEntry>,
    in_flight: DashMap<CacheKey, Vec<Sender<()>>>,
}

impl NutCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<[CachedNut]>> {
        self.entries.get(key).and_then(|e| e.full.clone())
    }

    /// Store the full result computed for `request`.
    pub fn put(&self, key: CacheKey, request: &EngineRequest, value: Arc<[CachedNut]>) {
        match self.entries.entry(key) {
            Entry::Occupied(mut e) => e.get_mut().full = Some(value),
            Entry::Vacant(e) => {
                e.insert(CacheEntry {
                    full: Some(value),
                    ..Self::entry_for(request)
                });
            }
        }
    }

    pub fn best_effort(&self, key: &CacheKey) -> Option<Arc<[CachedNut]>> {
        self.entries.get(key).and_then(|e| e.best_effort.clone())
    }

    pub fn put_best_effort(&self, key: CacheKey, request: &EngineRequest, value: Arc<[CachedNut]>) {
        match self.entries.entry(key) {
            Entry::Occupied(mut e) => e.get_mut().best_effort = Some(value),
            Entry::Vacant(e) => {
                e.insert(CacheEntry {
                    best_effort: Some(value),
                    ..Self::entry_for(request)
                });
            }
        }
    }

    pub fn invalidate(&self, key: &CacheKey) {
        self.entries.remove(key);
    }

    /// Drop every entry built from heap `heap_id` (directly or composed).
    pub fn purge_heap(&self, heap_id: &str) -> usize {
        self.purge(|e| e.heap_ids.iter().any(|h| h == heap_id))
    }

    /// Drop every entry whose nuts come from store `store_id`.
    pub fn purge_store(&self, store_id: &str) -> usize {
        self.purge(|e| e.store_ids.iter().any(|s| s == store_id))
    }

    pub fn purge_workflow(&self, workflow_id: &str) -> usize {
        self.purge(|e| e.workflow_id == workflow_id)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn purge(&self, matches: impl Fn(&CacheEntry) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !matches(e));
        before.saturating_sub(self.entries.len())
    }

    fn entry_for(request: &EngineRequest) -> CacheEntry {
        CacheEntry {
            full: None,
            best_effort: None,
            workflow_id: request.workflow_id().to_string(),
            heap_ids: request.heap().heap_ids(),
            store_ids: request.heap().store_ids(),
        }
    }

    // -------------------------------------------------------------------------
    // In-flight tracking
    // -------------------------------------------------------------------------

    /// Become the computing party for `key`, or get a receiver signalled
    /// when the current one finishes.
    fn claim(&self, key: CacheKey) -> Claim<'_> {
        match self.in_flight.entry(key) {
            Entry::Occupied(mut e) => {
                let (tx, rx) = channel::bounded(1);
                e.get_mut().push(tx);
                Claim::Wait(rx)
            }
            Entry::Vacant(e) => {
                e.insert(Vec::new());
                Claim::Leader(InFlight { cache: self, key })
            }
        }
    }

    pub fn is_computing(&self, key: &CacheKey) -> bool {
        self.in_flight.contains_key(key)
    }
}

impl fmt::Debug for NutCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NutCache")
            .field("entries", &self.entries.len())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

enum Claim<'a> {
    Leader(InFlight<'a>),
    Wait(channel::Receiver<()>),
}

/// Releases the in-flight slot and wakes waiters, also on error paths.
struct InFlight<'a> {
    cache: &'a NutCache,
    key: CacheKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some((_, waiters)) = self.cache.in_flight.remove(&self.key) {
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
    }
}

// =============================================================================
// CacheStage
// =============================================================================

/// Head stage backed by a shared [`NutCache`].
pub struct CacheStage {
    cache: Arc<NutCache>,
    enabled: bool,
    clearing: Mutex<Option<Periodic>>,
}

impl CacheStage {
    /// `time_to_live` seconds between full clears; non-positive disables it.
    pub fn new(cache: Arc<NutCache>, enabled: bool, time_to_live: i64) -> Self {
        let stage = Self {
            cache,
            enabled,
            clearing: Mutex::new(None),
        };
        stage.set_time_to_live(time_to_live);
        stage
    }

    pub fn works(&self) -> bool {
        self.enabled
    }

    pub fn cache(&self) -> &Arc<NutCache> {
        &self.cache
    }

    /// Restart (or stop) the scheduled clearing.
    pub fn set_time_to_live(&self, secs: i64) {
        let mut clearing = self.clearing.lock();
        match (period_from_secs(secs), clearing.as_ref()) {
            (Some(period), Some(task)) if task.is_running() => task.set_interval(period),
            (Some(period), _) => {
                let cache = Arc::clone(&self.cache);
                *clearing = Some(Periodic::start("cache-ttl", period, move || {
                    debug!("cache"; "time to live elapsed, clearing {} entries", cache.len());
                    cache.clear();
                }));
            }
            (None, _) => {
                if let Some(task) = clearing.take() {
                    task.stop();
                }
            }
        }
    }

    pub(crate) fn run(
        &self,
        request: &EngineRequest,
        nuts: Vec<ConvertibleNut>,
        next: Next,
    ) -> Result<Vec<ConvertibleNut>> {
        let key = CacheKey::for_request(request)?;
        if let Some(hit) = self.cache.get(&key) {
            debug!("cache"; "hit {} for workflow {}", key, request.workflow_id());
            return self.deliver(request, &hit, next);
        }

        // Without dynamic nuts the approximation is the full value, so the
        // request goes through the regular single-leader path.
        if request.is_best_effort() && request.nuts().iter().any(Nut::is_dynamic) {
            return self.best_effort(key, request, nuts, next);
        }

        debug!("cache"; "miss {} for workflow {}", key, request.workflow_id());
        let mut nuts = Some(nuts);
        loop {
            match self.cache.claim(key) {
                Claim::Leader(guard) => {
                    // Another leader may have finished between our lookup and the claim.
                    if let Some(hit) = self.cache.get(&key) {
                        drop(guard);
                        return self.deliver(request, &hit, next);
                    }
                    let input = nuts.take().unwrap_or_else(|| fresh(request));
                    let (value, dynamic) = compute(request, input, next)?;
                    self.cache.put(key, request, Arc::clone(&value));
                    drop(guard);
                    return Ok(restored(&value, dynamic));
                }
                Claim::Wait(rx) => {
                    let _ = rx.recv();
                    if let Some(hit) = self.cache.get(&key) {
                        return self.deliver(request, &hit, next);
                    }
                    // Leader failed: retry, possibly as the new leader.
                }
            }
        }
    }

    /// Serve a cached value, recomputing the dynamic nuts of the request.
    fn deliver(
        &self,
        request: &EngineRequest,
        value: &[CachedNut],
        next: Next,
    ) -> Result<Vec<ConvertibleNut>> {
        let dynamic: Vec<Nut> = request.nuts().iter().filter(|n| n.is_dynamic()).cloned().collect();
        let mut out = Vec::new();
        if !dynamic.is_empty() {
            let sub = request.derive().nuts(dynamic.clone()).build();
            out = next.run(&sub, dynamic.into_iter().map(ConvertibleNut::new).collect())?;
        }
        out.extend(value.iter().map(CachedNut::to_convertible));
        Ok(out)
    }

    fn best_effort(
        &self,
        key: CacheKey,
        request: &EngineRequest,
        nuts: Vec<ConvertibleNut>,
        next: Next,
    ) -> Result<Vec<ConvertibleNut>> {
        self.spawn_full(key, request, next.clone());

        if let Some(value) = self.cache.best_effort(&key) {
            debug!("cache"; "best effort hit {}", key);
            return Ok(restored(&value, Vec::new()));
        }

        let statics: Vec<ConvertibleNut> = nuts.into_iter().filter(|n| !n.is_dynamic()).collect();
        let names: Vec<Nut> = request.nuts().iter().filter(|n| !n.is_dynamic()).cloned().collect();
        log!("cache"; "serving best effort result for workflow {} ({} static nut(s))", request.workflow_id(), names.len());
        let sub = request.derive().nuts(names).build();
        let (value, _) = compute(&sub, statics, next)?;
        self.cache.put_best_effort(key, request, Arc::clone(&value));
        Ok(restored(&value, Vec::new()))
    }

    /// Run the full computation on the rayon pool unless one is in flight.
    fn spawn_full(&self, key: CacheKey, request: &EngineRequest, next: Next) {
        if self.cache.is_computing(&key) {
            return;
        }
        let cache = Arc::clone(&self.cache);
        let request = request.derive().without_best_effort().build();
        rayon::spawn(move || {
            let Claim::Leader(guard) = cache.claim(key) else {
                return;
            };
            if cache.get(&key).is_some() {
                return;
            }
            match compute(&request, fresh(&request), next) {
                Ok((value, _)) => {
                    debug!("cache"; "background computation stored {}", key);
                    cache.put(key, &request, value);
                }
                Err(e) => log!("cache"; "background computation for {} failed: {}", request.workflow_id(), e),
            }
            drop(guard);
        });
    }
}

impl fmt::Debug for CacheStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStage")
            .field("enabled", &self.enabled)
            .field("cache", &self.cache)
            .finish()
    }
}

/// Convertible nuts for every input of `request`.
fn fresh(request: &EngineRequest) -> Vec<ConvertibleNut> {
    request.nuts().iter().cloned().map(ConvertibleNut::new).collect()
}

/// Run downstream and materialize the static outputs.
///
/// Dynamic outputs are returned untouched; they are never cached.
fn compute(
    request: &EngineRequest,
    nuts: Vec<ConvertibleNut>,
    next: Next,
) -> Result<(Arc<[CachedNut]>, Vec<ConvertibleNut>)> {
    let mut dynamic = Vec::new();
    let mut value = Vec::new();
    for nut in next.run(request, nuts)? {
        if nut.is_dynamic() {
            dynamic.push(nut);
        } else {
            value.push(CachedNut::materialize(nut)?);
        }
    }
    Ok((value.into(), dynamic))
}

fn restored(value: &[CachedNut], mut dynamic: Vec<ConvertibleNut>) -> Vec<ConvertibleNut> {
    dynamic.extend(value.iter().map(CachedNut::to_convertible));
    dynamic
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Aggregator, Category, Stage, StageHandler, StageKind, StageOrigin, Workflow};
    use crate::nut::{NutsHeap, StoreRef};
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counts downstream runs, optionally sleeping to widen race windows.
    struct Counter {
        runs: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl StageHandler for Counter {
        fn run(&self, request: &EngineRequest, nuts: Vec<ConvertibleNut>, next: Next) -> Result<Vec<ConvertibleNut>> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            next.run(request, nuts)
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        cache: Arc<NutCache>,
        runs: Arc<AtomicUsize>,
        workflow: Workflow,
    }

    fn fixture(delay: Duration) -> Fixture {
        let store = Arc::new(MemoryStore::in_memory("mem"));
        store.put("a.js", b"var a;".to_vec());
        store.put("b.js", b"var b;".to_vec());
        let heap = NutsHeap::builder("h")
            .store(StoreRef::new("mem", store.clone()))
            .paths(["a.js", "b.js"])
            .build()
            .unwrap();

        let cache = Arc::new(NutCache::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let stages = [
            Stage::new(
                "cache",
                Category::Cache,
                [NutType::Javascript],
                StageOrigin::Core,
                StageKind::Cache(Arc::new(CacheStage::new(cache.clone(), true, 0))),
            ),
            Stage::new(
                "counter",
                Category::Converter,
                [NutType::Javascript],
                StageOrigin::Extension,
                StageKind::Custom(Arc::new(Counter { runs: runs.clone(), delay })),
            ),
            Stage::new(
                "aggregator",
                Category::Aggregator,
                [NutType::Javascript],
                StageOrigin::Core,
                StageKind::Aggregator(Arc::new(Aggregator::new(true))),
            ),
        ];
        let workflow = Workflow::new("wf", heap, &stages);
        Fixture { store, cache, runs, workflow }
    }

    fn content(mut nut: ConvertibleNut) -> Vec<u8> {
        nut.transform(Vec::new()).unwrap()
    }

    #[test]
    fn test_hit_skips_downstream() {
        let f = fixture(Duration::ZERO);
        let first = f.workflow.execute(&f.workflow.request().build().unwrap()).unwrap();
        let second = f.workflow.execute(&f.workflow.request().build().unwrap()).unwrap();
        assert_eq!(f.runs.load(Ordering::SeqCst), 1);
        assert_eq!(f.cache.len(), 1);

        assert_eq!(second[0].name(), "aggregate.js");
        let a = first.into_iter().next().unwrap();
        let b = second.into_iter().next().unwrap();
        assert_eq!(a.version().get().unwrap(), b.version().get().unwrap());
        assert_eq!(content(a), b"var a;var b;");
        assert_eq!(content(b), b"var a;var b;");
    }

    #[test]
    fn test_referenced_restored_on_transform() {
        let f = fixture(Duration::ZERO);
        f.workflow.execute(&f.workflow.request().build().unwrap()).unwrap();
        let mut out = f.workflow.execute(&f.workflow.request().build().unwrap()).unwrap();
        let nut = &mut out[0];
        assert!(nut.referenced().is_empty());
        nut.transform(Vec::new()).unwrap();
        assert_eq!(nut.referenced()[0].name(), "aggregate.js.map");
        assert!(nut.source_map().is_some());
    }

    #[test]
    fn test_version_change_misses() {
        let f = fixture(Duration::ZERO);
        f.workflow.execute(&f.workflow.request().build().unwrap()).unwrap();
        f.store.put("b.js", b"var c;".to_vec());
        let out = f.workflow.execute(&f.workflow.request().build().unwrap()).unwrap();
        assert_eq!(f.runs.load(Ordering::SeqCst), 2);
        assert_eq!(content(out.into_iter().next().unwrap()), b"var a;var c;");
    }

    #[test]
    fn test_purge_by_heap_and_store() {
        let f = fixture(Duration::ZERO);
        f.workflow.execute(&f.workflow.request().build().unwrap()).unwrap();
        assert_eq!(f.cache.purge_heap("other"), 0);
        assert_eq!(f.cache.purge_store("mem"), 1);
        assert!(f.cache.is_empty());

        f.workflow.execute(&f.workflow.request().build().unwrap()).unwrap();
        assert_eq!(f.cache.purge_heap("h"), 1);
        f.workflow.execute(&f.workflow.request().build().unwrap()).unwrap();
        assert_eq!(f.cache.purge_workflow("wf"), 1);
    }

    #[test]
    fn test_concurrent_misses_compute_once() {
        let f = fixture(Duration::from_millis(100));
        let (tx, rx) = channel::unbounded();
        std::thread::scope(|s| {
            for _ in 0..4 {
                let tx = tx.clone();
                let wf = &f.workflow;
                s.spawn(move || {
                    let out = wf.execute(&wf.request().build().unwrap()).unwrap();
                    tx.send(out.len()).unwrap();
                });
            }
        });
        drop(tx);
        let lens: Vec<usize> = rx.iter().collect();
        assert_eq!(lens, vec![1, 1, 1, 1]);
        assert_eq!(f.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_best_effort_then_full() {
        let f = fixture(Duration::ZERO);
        let live = Nut::from_bytes("live.js", NutType::Javascript, b"var now;".to_vec()).dynamic(true);
        let base = f.workflow.request().build().unwrap();
        let mut nuts = base.nuts().to_vec();
        nuts.push(live);
        let request = f.workflow.request().nuts(nuts).best_effort(true).build().unwrap();

        let out = f.workflow.execute(&request).unwrap();
        let names: Vec<_> = out.iter().map(ConvertibleNut::name).collect();
        assert_eq!(names, vec!["aggregate.js"]);

        let key = CacheKey::for_request(&request).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while f.cache.get(&key).is_none() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(f.cache.get(&key).is_some());

        let request = f.workflow.request().nuts(request.nuts().to_vec()).build().unwrap();
        let out = f.workflow.execute(&request).unwrap();
        let names: Vec<_> = out.iter().map(ConvertibleNut::name).collect();
        assert_eq!(names, vec!["live.js", "aggregate.js"]);
    }

    #[test]
    fn test_best_effort_without_dynamic_nuts_computes_once() {
        let f = fixture(Duration::from_millis(100));
        let request = f.workflow.request().best_effort(true).build().unwrap();
        let out = f.workflow.execute(&request).unwrap();
        assert_eq!(content(out.into_iter().next().unwrap()), b"var a;var b;");

        let key = CacheKey::for_request(&request).unwrap();
        assert!(f.cache.get(&key).is_some());
        assert!(!f.cache.is_computing(&key));
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(f.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_time_to_live_clears() {
        let f = fixture(Duration::ZERO);
        f.workflow.execute(&f.workflow.request().build().unwrap()).unwrap();
        let stage = CacheStage::new(f.cache.clone(), true, 1);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !f.cache.is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(f.cache.is_empty());
        stage.set_time_to_live(0);
    }
}
