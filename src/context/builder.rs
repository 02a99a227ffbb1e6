//! Mutable configuration and its compilation into a [`Context`].

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};

use super::setting::{ContextSetting, HeapRegistration, RegistrationKind, TemplateRegistration};
use super::tagged::TaggedSettings;
use super::{Context, RequestDefaults};
use crate::config::PipelineConfig;
use crate::engine::{
    Aggregator, CacheStage, Category, Compressor, InspectorStage, Minifier, NutCache, Stage,
    StageKind, StageOrigin, Workflow,
};
use crate::error::{Error, Result};
use crate::nut::{HeapListener, NutType, NutsHeap, StoreRef};
use crate::store::{ProxyStore, Store};
use crate::{debug, debug_do, log};

/// Tag holding the built-in stages registered by [`ContextBuilder::configure_default`].
pub const DEFAULT_TAG: &str = "default";

pub const CACHE_STAGE: &str = "cache";
pub const INSPECTOR_STAGE: &str = "inspector";
pub const AGGREGATOR_STAGE: &str = "aggregator";
pub const MINIFIER_STAGE: &str = "minifier";
pub const GZIP_STAGE: &str = "gzip";

// ============================================================================
// ContextBuilder
// ============================================================================

pub(crate) struct BuilderInner {
    settings: RwLock<TaggedSettings>,
    cache: Arc<NutCache>,
    /// Bumped on every change; contexts built from an older value are stale.
    pub(crate) generation: AtomicU64,
    built: Mutex<Built>,
    defaults: RwLock<RequestDefaults>,
}

/// What the last `build()` created, with the owning tag.
#[derive(Default)]
struct Built {
    heaps: Vec<(String, NutsHeap)>,
    workflows: Vec<(String, String)>,
}

/// Entry point for registering configuration by tag.
///
/// Cloning is cheap and shares state.
#[derive(Clone)]
pub struct ContextBuilder(Arc<BuilderInner>);

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self(Arc::new(BuilderInner {
            settings: RwLock::new(TaggedSettings::new()),
            cache: Arc::new(NutCache::new()),
            generation: AtomicU64::new(0),
            built: Mutex::new(Built::default()),
            defaults: RwLock::new(RequestDefaults::default()),
        }))
    }

    /// Cache shared by every cache stage created through this builder.
    pub fn cache(&self) -> &Arc<NutCache> {
        &self.0.cache
    }

    pub fn generation(&self) -> u64 {
        self.0.generation.load(Ordering::Acquire)
    }

    pub fn tags(&self) -> Vec<String> {
        self.0.settings.read().tags().map(str::to_string).collect()
    }

    /// Tags that would be refreshed together with `tag`.
    pub fn dependents(&self, tag: &str) -> Vec<String> {
        self.0.settings.read().dependents(tag)
    }

    pub fn set_request_defaults(&self, defaults: RequestDefaults) {
        *self.0.defaults.write() = defaults;
        self.0.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Register (or replace) the setting of `tag`.
    ///
    /// The tag and every tag referencing it, before or after the change,
    /// are refreshed.
    pub fn register(&self, tag: &str, setting: ContextSetting) -> Result<()> {
        let previous = {
            let mut settings = self.0.settings.write();
            let previous = settings.get(tag).cloned();
            settings.put(tag, setting)?;
            previous
        };
        self.0.invalidate(tag, previous.as_deref());
        Ok(())
    }

    /// Remove the setting of `tag`. Returns whether it was registered.
    pub fn clear(&self, tag: &str) -> bool {
        let removed = self.0.settings.write().remove(tag);
        match removed {
            Some(setting) => {
                self.0.invalidate(tag, Some(&setting));
                true
            }
            None => false,
        }
    }

    /// Free `tag` and its dependents and purge what the cache built from them.
    pub fn refresh(&self, tag: &str) {
        self.0.invalidate(tag, None);
    }

    /// Register the built-in stages under [`DEFAULT_TAG`].
    pub fn configure_default(&self, config: &PipelineConfig) -> Result<()> {
        let engine = &config.engine;
        let cache = CacheStage::new(
            Arc::clone(&self.0.cache),
            config.cache.enabled,
            config.cache.time_to_live,
        );
        let inspector = InspectorStage::with_defaults(engine.inspect);
        let inspected = inspector.nut_types();
        let scripts = [NutType::Javascript, NutType::Css];
        let texts = NutType::ALL.into_iter().filter(|t| t.is_text());

        let setting = ContextSetting::new()
            .stage(core(
                CACHE_STAGE,
                Category::Cache,
                NutType::ALL,
                StageKind::Cache(Arc::new(cache)),
            ))
            .stage(core(
                INSPECTOR_STAGE,
                Category::Inspector,
                inspected,
                StageKind::Inspector(Arc::new(inspector)),
            ))
            .stage(core(
                AGGREGATOR_STAGE,
                Category::Aggregator,
                scripts,
                StageKind::Aggregator(Arc::new(Aggregator::new(engine.aggregate))),
            ))
            .stage(core(
                MINIFIER_STAGE,
                Category::Minification,
                scripts,
                StageKind::Minifier(Arc::new(Minifier::new(engine.minify))),
            ))
            .stage(core(
                GZIP_STAGE,
                Category::Compression,
                texts,
                StageKind::Compressor(Arc::new(Compressor::new(engine.compress))),
            ));

        *self.0.defaults.write() = RequestDefaults {
            context_path: config.request.context_path.clone(),
            charset: config.request.charset.clone(),
            best_effort: engine.best_effort,
        };
        self.register(DEFAULT_TAG, setting)
    }

    /// Compile every registration into an immutable [`Context`].
    ///
    /// Heaps of the previous build are freed.
    pub fn build(&self) -> Result<Context> {
        let generation = self.generation();
        let settings = self.0.settings.read();

        let stores = build_stores(&settings)?;
        let heaps = build_heaps(&settings, &stores)?;
        for (tag, heap) in &heaps {
            heap.add_listener(self.0.listener(tag));
        }
        let workflows = build_workflows(&settings, &stores, &heaps)?;
        drop(settings);

        // composites built for a workflow over several heaps
        let mut heaps = heaps;
        for (tag, wf) in &workflows {
            if !heaps.iter().any(|(_, h)| h.ptr_eq(wf.heap())) {
                wf.heap().add_listener(self.0.listener(tag));
                heaps.push((tag.clone(), wf.heap().clone()));
            }
        }

        let built = Built {
            heaps: heaps.clone(),
            workflows: workflows
                .iter()
                .map(|(tag, wf)| (tag.clone(), wf.id().to_string()))
                .collect(),
        };
        let previous = mem::replace(&mut *self.0.built.lock(), built);
        for (_, heap) in previous.heaps {
            heap.free();
        }

        debug!(
            "context"; "built {} workflow(s) over {} heap(s)",
            workflows.len(),
            heaps.len()
        );
        debug_do! {
            for (tag, wf) in &workflows {
                debug!("context"; "  [{}] {} <- heap {}", tag, wf.id(), wf.heap().id());
            }
        }
        Ok(Context::new(
            workflows.into_iter().map(|(_, wf)| wf).collect(),
            generation,
            Arc::downgrade(&self.0),
            self.0.defaults.read().clone(),
        ))
    }
}

fn core(
    id: &str,
    category: Category,
    nut_types: impl IntoIterator<Item = NutType>,
    kind: StageKind,
) -> Stage {
    Stage::new(id, category, nut_types, StageOrigin::Core, kind)
}

// ============================================================================
// Invalidation
// ============================================================================

impl BuilderInner {
    /// Heap listener refreshing the tag that registered the heap.
    fn listener(self: &Arc<Self>, tag: &str) -> HeapListener {
        let weak: Weak<Self> = Arc::downgrade(self);
        let tag = tag.to_string();
        Arc::new(move |heap_id: &str| {
            if let Some(inner) = weak.upgrade() {
                log!("context"; "heap {} changed", heap_id);
                inner.invalidate(&tag, None);
            }
        })
    }

    /// Cascade a change of `tag`.
    ///
    /// `old` is the setting the tag had before the change, if it differs
    /// from the registered one.
    fn invalidate(&self, tag: &str, old: Option<&ContextSetting>) {
        let settings = self.settings.read();
        let mut tags = vec![tag.to_string()];
        for dependent in old
            .map(|s| settings.dependents_of(tag, Some(s)))
            .into_iter()
            .flatten()
            .chain(settings.dependents(tag))
        {
            if !tags.contains(&dependent) {
                tags.push(dependent);
            }
        }

        let mut purged = 0;
        if let Some(old) = old {
            purged += self.release(old);
        }
        for t in &tags {
            if let Some(setting) = settings.get(t) {
                purged += self.release(setting);
            }
        }
        drop(settings);

        let affected: FxHashSet<&str> = tags.iter().map(String::as_str).collect();
        {
            let built = self.built.lock();
            for (owner, heap) in &built.heaps {
                if affected.contains(owner.as_str()) {
                    heap.free();
                    purged += self.cache.purge_heap(heap.id());
                }
            }
            for (owner, workflow) in &built.workflows {
                if affected.contains(owner.as_str()) {
                    purged += self.cache.purge_workflow(workflow);
                }
            }
        }

        self.generation.fetch_add(1, Ordering::AcqRel);
        log!("context"; "refreshed {} ({} cache entries purged)", tags.join(", "), purged);
    }

    /// Free stores and purge cache entries built from a setting.
    fn release(&self, setting: &ContextSetting) -> usize {
        let mut purged = 0;
        for (id, registration) in &setting.stores {
            registration.store.free();
            purged += self.cache.purge_store(id);
        }
        for (id, _) in &setting.heaps {
            purged += self.cache.purge_heap(id);
        }
        purged
    }
}

// ============================================================================
// Compilation
// ============================================================================

fn unknown(kind: RegistrationKind, id: &str) -> Error {
    Error::UnknownId {
        kind: kind.name(),
        id: id.to_string(),
    }
}

/// Registered stores by id, proxies wired to their targets.
fn build_stores(settings: &TaggedSettings) -> Result<FxHashMap<String, StoreRef>> {
    let registered: FxHashMap<&str, &Arc<dyn Store>> = settings
        .iter()
        .flat_map(|(_, s)| s.stores.iter())
        .map(|(id, r)| (id.as_str(), &r.store))
        .collect();

    let mut stores = FxHashMap::default();
    for (_, setting) in settings.iter() {
        for (id, registration) in &setting.stores {
            let store: Arc<dyn Store> = if registration.proxied.is_empty() {
                Arc::clone(&registration.store)
            } else {
                let proxy = ProxyStore::new(id.clone(), Some(Arc::clone(&registration.store)));
                for (path, target) in &registration.proxied {
                    let target = registered
                        .get(target.as_str())
                        .ok_or_else(|| unknown(RegistrationKind::Store, target))?;
                    proxy.proxy_store(path.clone(), Arc::clone(target));
                }
                Arc::new(proxy)
            };
            stores.insert(id.clone(), StoreRef::new(id.clone(), store));
        }
    }
    Ok(stores)
}

/// Heaps in registration order, each with its tag.
///
/// Plain heaps are built first, then composites once everything they
/// compose exists.
fn build_heaps(
    settings: &TaggedSettings,
    stores: &FxHashMap<String, StoreRef>,
) -> Result<Vec<(String, NutsHeap)>> {
    let registrations: Vec<(&str, &str, &HeapRegistration)> = settings
        .iter()
        .flat_map(|(tag, s)| s.heaps.iter().map(move |(id, h)| (tag, id.as_str(), h)))
        .collect();
    let known: FxHashSet<&str> = registrations.iter().map(|(_, id, _)| *id).collect();

    let mut built: FxHashMap<&str, NutsHeap> = FxHashMap::default();
    let (plain, mut pending): (Vec<_>, Vec<_>) = registrations
        .iter()
        .copied()
        .partition(|(_, _, h)| !h.is_composite());

    for (_, id, registration) in plain {
        built.insert(id, heap(id, registration, stores, &built)?);
    }

    while !pending.is_empty() {
        let (ready, waiting): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .partition(|(_, _, h)| h.heap_ids.iter().all(|c| built.contains_key(c.as_str())));
        if ready.is_empty() {
            let (_, id, registration) = waiting[0];
            if let Some(missing) = registration
                .heap_ids
                .iter()
                .find(|c| !known.contains(c.as_str()))
            {
                return Err(unknown(RegistrationKind::Heap, missing));
            }
            return Err(Error::CycleDetected(format!(
                "heap `{}` composes itself through {}",
                id,
                waiting
                    .iter()
                    .map(|(_, id, _)| *id)
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        for (_, id, registration) in ready {
            built.insert(id, heap(id, registration, stores, &built)?);
        }
        pending = waiting;
    }

    Ok(registrations
        .iter()
        .filter_map(|(tag, id, _)| built.get(id).map(|h| (tag.to_string(), h.clone())))
        .collect())
}

fn heap(
    id: &str,
    registration: &HeapRegistration,
    stores: &FxHashMap<String, StoreRef>,
    built: &FxHashMap<&str, NutsHeap>,
) -> Result<NutsHeap> {
    let mut builder = NutsHeap::builder(id);
    if let Some(store_id) = &registration.store_id {
        let store = stores
            .get(store_id)
            .ok_or_else(|| unknown(RegistrationKind::Store, store_id))?;
        builder = builder.store(store.clone()).paths(registration.paths.iter().cloned());
    }
    for composed in &registration.heap_ids {
        if let Some(h) = built.get(composed.as_str()) {
            builder = builder.compose(h.clone());
        }
    }
    builder.build()
}

/// Stages selected by a template, in registration order.
///
/// Without a template every registered stage is used.
fn select_stages(
    all: &[Stage],
    template: Option<(&str, &TemplateRegistration)>,
    stores: &FxHashMap<String, StoreRef>,
) -> Result<Vec<Stage>> {
    let Some((_, template)) = template else {
        return Ok(all.to_vec());
    };
    if let Some(missing) = template
        .stage_ids
        .iter()
        .find(|id| !all.iter().any(|s| s.id() == id.as_str()))
    {
        return Err(unknown(RegistrationKind::Stage, missing));
    }
    if let Some(missing) = template.store_ids.iter().find(|id| !stores.contains_key(*id)) {
        return Err(unknown(RegistrationKind::Store, missing));
    }

    Ok(all
        .iter()
        .filter(|s| {
            let named = template.stage_ids.iter().any(|id| id == s.id());
            let default = template.include_defaults && s.origin() == StageOrigin::Core;
            (named || default) && !template.exclusions.iter().any(|id| id == s.id())
        })
        .cloned()
        .collect())
}

/// Workflows with their tag: registered ones first, then a default
/// workflow per heap no registration covers.
fn build_workflows(
    settings: &TaggedSettings,
    stores: &FxHashMap<String, StoreRef>,
    heaps: &[(String, NutsHeap)],
) -> Result<Vec<(String, Workflow)>> {
    let stages: Vec<Stage> = settings
        .iter()
        .flat_map(|(_, s)| s.stages.iter().cloned())
        .collect();
    let templates: FxHashMap<&str, &TemplateRegistration> = settings
        .iter()
        .flat_map(|(_, s)| s.templates.iter())
        .map(|(id, t)| (id.as_str(), t))
        .collect();

    let mut out: Vec<(String, Workflow)> = Vec::new();
    let mut ids: FxHashSet<String> = FxHashSet::default();
    let mut covered: FxHashSet<&str> = FxHashSet::default();
    let mut push = |tag: &str, wf: Workflow, out: &mut Vec<(String, Workflow)>| -> Result<()> {
        if !ids.insert(wf.id().to_string()) {
            return Err(Error::ConfigurationConflict(format!(
                "workflow `{}` produced twice",
                wf.id()
            )));
        }
        out.push((tag.to_string(), wf));
        Ok(())
    };

    for (tag, setting) in settings.iter() {
        for (id, registration) in &setting.workflows {
            let template = match registration.template_id.as_deref() {
                Some(t) => Some((
                    t,
                    *templates
                        .get(t)
                        .ok_or_else(|| unknown(RegistrationKind::Template, t))?,
                )),
                None => None,
            };
            let selected = select_stages(&stages, template, stores)?;

            let regex = registration.heap_regex()?;
            let matching: Vec<&NutsHeap> = heaps
                .iter()
                .map(|(_, h)| h)
                .filter(|h| regex.is_match(h.id()))
                .collect();
            if matching.is_empty() {
                return Err(Error::UnknownId {
                    kind: "heap pattern",
                    id: registration.heap_pattern.clone(),
                });
            }
            covered.extend(matching.iter().map(|h| h.id()));

            if registration.for_each_heap {
                for heap in matching {
                    let wf_id = format!("{}{}", registration.id_prefix, heap.id());
                    push(tag, Workflow::new(wf_id, heap.clone(), &selected), &mut out)?;
                }
            } else {
                let wf_id = if registration.id_prefix.is_empty() {
                    id.clone()
                } else {
                    registration.id_prefix.clone()
                };
                let heap = match matching.as_slice() {
                    [single] => (*single).clone(),
                    many => many
                        .iter()
                        .fold(NutsHeap::builder(wf_id.clone()), |b, h| b.compose((*h).clone()))
                        .build()?,
                };
                push(tag, Workflow::new(wf_id, heap, &selected), &mut out)?;
            }
        }
    }

    for (tag, heap) in heaps {
        if covered.contains(heap.id()) {
            continue;
        }
        push(tag, Workflow::new(heap.id(), heap.clone(), &stages), &mut out)?;
    }
    Ok(out)
}
