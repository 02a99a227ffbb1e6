//! Engine requests and their builder.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::{Category, Chain};
use crate::error::Result;
use crate::nut::{Nut, NutType, NutsHeap, TransformContext, Transformer};
use crate::utils::path::merge_path;

/// Opaque host value passed through to custom stages.
pub type ProcessContext = Arc<dyn Any + Send + Sync>;

// ============================================================================
// URL provider
// ============================================================================

/// Builds the public URL of a processed nut.
pub trait UrlProvider: Send + Sync {
    fn url(&self, context_path: &str, workflow_id: &str, version: u64, name: &str) -> String;
}

/// `/{context_path}/{workflow_id}/{version}/{name}`
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultUrlProvider;

impl UrlProvider for DefaultUrlProvider {
    fn url(&self, context_path: &str, workflow_id: &str, version: u64, name: &str) -> String {
        merge_path(&["/", context_path, workflow_id, &version.to_string(), name])
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Clone)]
pub struct TransformerStat {
    pub nut: String,
    pub transformer: String,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct StageStat {
    pub stage: String,
    pub nut_type: NutType,
    pub nuts: usize,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct HeapStat {
    pub heap: String,
    pub nuts: usize,
    pub duration: Duration,
}

/// Accumulators shared by a request and all its sub-requests.
#[derive(Debug, Default)]
pub struct RequestStats {
    transformers: Mutex<Vec<TransformerStat>>,
    stages: Mutex<Vec<StageStat>>,
    heaps: Mutex<Vec<HeapStat>>,
}

impl RequestStats {
    pub fn record_transformer(&self, stat: TransformerStat) {
        self.transformers.lock().push(stat);
    }

    pub fn record_stage(&self, stat: StageStat) {
        self.stages.lock().push(stat);
    }

    pub fn record_heap(&self, stat: HeapStat) {
        self.heaps.lock().push(stat);
    }

    pub fn transformers(&self) -> Vec<TransformerStat> {
        self.transformers.lock().clone()
    }

    pub fn stages(&self) -> Vec<StageStat> {
        self.stages.lock().clone()
    }

    pub fn heaps(&self) -> Vec<HeapStat> {
        self.heaps.lock().clone()
    }
}

/// Transformer recording its running time in the request statistics.
struct Timed {
    inner: Arc<dyn Transformer>,
    stats: Arc<RequestStats>,
}

impl Transformer for Timed {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn transform(&self, input: Vec<u8>, cx: &mut TransformContext<'_>) -> Result<Vec<u8>> {
        let start = std::time::Instant::now();
        let nut = cx.name().to_string();
        let out = self.inner.transform(input, cx);
        self.stats.record_transformer(TransformerStat {
            nut,
            transformer: self.inner.name().to_string(),
            duration: start.elapsed(),
        });
        out
    }
}

// ============================================================================
// EngineRequest
// ============================================================================

struct RequestInner {
    nuts: Vec<Nut>,
    heap: NutsHeap,
    workflow_id: String,
    chains: Arc<FxHashMap<NutType, Arc<Chain>>>,
    skip: SmallVec<[Category; 4]>,
    best_effort: bool,
    context_path: String,
    charset: String,
    stats: Arc<RequestStats>,
    process_context: Option<ProcessContext>,
    url_provider: Arc<dyn UrlProvider>,
    origin: Arc<[String]>,
}

/// Immutable snapshot of everything a stage needs. Cheap to clone.
#[derive(Clone)]
pub struct EngineRequest(Arc<RequestInner>);

impl EngineRequest {
    /// Start a request for `heap` in `workflow_id`.
    pub fn builder(workflow_id: impl Into<String>, heap: NutsHeap) -> EngineRequestBuilder {
        EngineRequestBuilder {
            nuts: None,
            heap,
            workflow_id: workflow_id.into(),
            chains: Arc::new(FxHashMap::default()),
            skip: SmallVec::new(),
            best_effort: false,
            context_path: String::new(),
            charset: "UTF-8".to_string(),
            stats: Arc::new(RequestStats::default()),
            process_context: None,
            url_provider: Arc::new(DefaultUrlProvider),
            origin: Arc::from(Vec::new()),
        }
    }

    /// Builder for a recursive sub-call.
    ///
    /// Every field is copied; only nuts, heap and skip-set are meant to be
    /// overridden.
    pub fn derive(&self) -> SubRequestBuilder {
        SubRequestBuilder {
            base: self.clone(),
            nuts: None,
            heap: None,
            skip: None,
            best_effort: None,
            origin: None,
        }
    }

    pub fn nuts(&self) -> &[Nut] {
        &self.0.nuts
    }

    pub fn heap(&self) -> &NutsHeap {
        &self.0.heap
    }

    pub fn workflow_id(&self) -> &str {
        &self.0.workflow_id
    }

    pub fn chain(&self, nut_type: NutType) -> Option<&Arc<Chain>> {
        self.0.chains.get(&nut_type)
    }

    pub fn chains(&self) -> &Arc<FxHashMap<NutType, Arc<Chain>>> {
        &self.0.chains
    }

    pub fn skip(&self) -> &[Category] {
        &self.0.skip
    }

    pub fn skips(&self, category: Category) -> bool {
        self.0.skip.contains(&category)
    }

    pub fn is_best_effort(&self) -> bool {
        self.0.best_effort
    }

    pub fn context_path(&self) -> &str {
        &self.0.context_path
    }

    pub fn charset(&self) -> &str {
        &self.0.charset
    }

    pub fn stats(&self) -> &Arc<RequestStats> {
        &self.0.stats
    }

    pub fn process_context(&self) -> Option<&ProcessContext> {
        self.0.process_context.as_ref()
    }

    /// Names of the nuts whose inspection led to this request.
    pub fn origin(&self) -> &[String] {
        &self.0.origin
    }

    /// Public URL of a processed nut.
    pub fn url_for(&self, version: u64, name: &str) -> String {
        self.0
            .url_provider
            .url(&self.0.context_path, &self.0.workflow_id, version, name)
    }

    /// Wrap a transformer so its timing lands in this request's statistics.
    pub fn timed(&self, transformer: Arc<dyn Transformer>) -> Arc<dyn Transformer> {
        Arc::new(Timed {
            inner: transformer,
            stats: Arc::clone(&self.0.stats),
        })
    }

    pub(crate) fn record_stage(&self, stage: &str, nut_type: NutType, nuts: usize, duration: Duration) {
        self.0.stats.record_stage(StageStat {
            stage: stage.to_string(),
            nut_type,
            nuts,
            duration,
        });
    }
}

impl fmt::Debug for EngineRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineRequest")
            .field("workflow", &self.0.workflow_id)
            .field("heap", &self.0.heap.id())
            .field("nuts", &self.0.nuts.len())
            .field("skip", &self.0.skip)
            .field("best_effort", &self.0.best_effort)
            .finish()
    }
}

// ============================================================================
// Builders
// ============================================================================

/// Mutable request under construction.
pub struct EngineRequestBuilder {
    nuts: Option<Vec<Nut>>,
    heap: NutsHeap,
    workflow_id: String,
    chains: Arc<FxHashMap<NutType, Arc<Chain>>>,
    skip: SmallVec<[Category; 4]>,
    best_effort: bool,
    context_path: String,
    charset: String,
    stats: Arc<RequestStats>,
    process_context: Option<ProcessContext>,
    url_provider: Arc<dyn UrlProvider>,
    origin: Arc<[String]>,
}

impl EngineRequestBuilder {
    /// Nuts to process. Defaults to the heap's resolved nuts.
    pub fn nuts(mut self, nuts: Vec<Nut>) -> Self {
        self.nuts = Some(nuts);
        self
    }

    pub fn chains(mut self, chains: Arc<FxHashMap<NutType, Arc<Chain>>>) -> Self {
        self.chains = chains;
        self
    }

    pub fn skip(mut self, skip: impl IntoIterator<Item = Category>) -> Self {
        self.skip = skip.into_iter().collect();
        self
    }

    pub fn best_effort(mut self, best_effort: bool) -> Self {
        self.best_effort = best_effort;
        self
    }

    pub fn context_path(mut self, context_path: impl Into<String>) -> Self {
        self.context_path = context_path.into();
        self
    }

    pub fn charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = charset.into();
        self
    }

    pub fn process_context(mut self, cx: Option<ProcessContext>) -> Self {
        self.process_context = cx;
        self
    }

    pub fn url_provider(mut self, provider: Arc<dyn UrlProvider>) -> Self {
        self.url_provider = provider;
        self
    }

    /// Resolves the heap when no nuts were set.
    pub fn build(self) -> Result<EngineRequest> {
        let nuts = match self.nuts {
            Some(nuts) => nuts,
            None => {
                let start = std::time::Instant::now();
                let nuts = self.heap.nuts()?;
                self.stats.record_heap(HeapStat {
                    heap: self.heap.id().to_string(),
                    nuts: nuts.len(),
                    duration: start.elapsed(),
                });
                nuts
            }
        };
        Ok(EngineRequest(Arc::new(RequestInner {
            nuts,
            heap: self.heap,
            workflow_id: self.workflow_id,
            chains: self.chains,
            skip: self.skip,
            best_effort: self.best_effort,
            context_path: self.context_path,
            charset: self.charset,
            stats: self.stats,
            process_context: self.process_context,
            url_provider: self.url_provider,
            origin: self.origin,
        })))
    }
}

/// Builder for a request derived from another one.
pub struct SubRequestBuilder {
    base: EngineRequest,
    nuts: Option<Vec<Nut>>,
    heap: Option<NutsHeap>,
    skip: Option<SmallVec<[Category; 4]>>,
    best_effort: Option<bool>,
    origin: Option<Arc<[String]>>,
}

impl SubRequestBuilder {
    pub fn nuts(mut self, nuts: Vec<Nut>) -> Self {
        self.nuts = Some(nuts);
        self
    }

    pub fn heap(mut self, heap: NutsHeap) -> Self {
        self.heap = Some(heap);
        self
    }

    pub fn skip(mut self, skip: impl IntoIterator<Item = Category>) -> Self {
        self.skip = Some(skip.into_iter().collect());
        self
    }

    /// Used by the cache for its background full computation.
    pub(crate) fn without_best_effort(mut self) -> Self {
        self.best_effort = Some(false);
        self
    }

    /// Record `referencer` as the nut whose inspection spawned this request.
    pub(crate) fn referenced_from(mut self, referencer: &str) -> Self {
        let mut origin: Vec<String> = self.base.origin().to_vec();
        origin.push(referencer.to_string());
        self.origin = Some(Arc::from(origin));
        self
    }

    pub fn build(self) -> EngineRequest {
        let base = &self.base.0;
        EngineRequest(Arc::new(RequestInner {
            nuts: self.nuts.unwrap_or_else(|| base.nuts.clone()),
            heap: self.heap.unwrap_or_else(|| base.heap.clone()),
            workflow_id: base.workflow_id.clone(),
            chains: Arc::clone(&base.chains),
            skip: self.skip.unwrap_or_else(|| base.skip.clone()),
            best_effort: self.best_effort.unwrap_or(base.best_effort),
            context_path: base.context_path.clone(),
            charset: base.charset.clone(),
            stats: Arc::clone(&base.stats),
            process_context: base.process_context.clone(),
            url_provider: Arc::clone(&base.url_provider),
            origin: self.origin.unwrap_or_else(|| Arc::clone(&base.origin)),
        }))
    }
}
