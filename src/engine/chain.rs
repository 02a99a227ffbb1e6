//! Chain construction and execution.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use super::{Category, EngineRequest, EngineRequestBuilder, Stage, StageOrigin};
use crate::error::{Error, Result};
use crate::nut::{ConvertibleNut, NutType, NutsHeap};

// ============================================================================
// Chain
// ============================================================================

/// Stages applied to one nut type, ordered by category.
pub struct Chain {
    nut_type: NutType,
    stages: Vec<Stage>,
}

impl Chain {
    /// Stable sort: registration order is kept within a category.
    pub fn new(nut_type: NutType, mut stages: Vec<Stage>) -> Self {
        stages.sort_by_key(Stage::category);
        Self { nut_type, stages }
    }

    pub fn nut_type(&self) -> NutType {
        self.nut_type
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Whether the stage at `index` works in this chain.
    ///
    /// A stage works when its own configuration enables it. A minifier also
    /// reports `false` once an earlier stage of the chain is a working
    /// minifier, so at most one minification runs per nut.
    pub fn works(&self, index: usize) -> bool {
        let Some(stage) = self.stages.get(index) else {
            return false;
        };
        if !stage.works() {
            return false;
        }
        stage.category() != Category::Minification
            || !self.stages[..index]
                .iter()
                .any(|s| s.category() == Category::Minification && s.works())
    }

    /// Run the whole chain on `nuts`.
    pub fn execute(
        self: &Arc<Self>,
        request: &EngineRequest,
        nuts: Vec<ConvertibleNut>,
    ) -> Result<Vec<ConvertibleNut>> {
        self.run_from(0, request, nuts)
    }

    fn run_from(
        self: &Arc<Self>,
        mut index: usize,
        request: &EngineRequest,
        nuts: Vec<ConvertibleNut>,
    ) -> Result<Vec<ConvertibleNut>> {
        loop {
            let Some(stage) = self.stages.get(index) else {
                return Ok(nuts);
            };
            if request.skips(stage.category()) || !self.works(index) {
                index += 1;
                continue;
            }
            if let Some(nut) = nuts.iter().find(|n| !stage.supports(n.nut_type())) {
                return Err(Error::UnsupportedType {
                    stage: stage.id().to_string(),
                    nut_type: nut.nut_type(),
                    name: nut.name().to_string(),
                });
            }
            let next = Next(Step::Stage {
                chain: Arc::clone(self),
                index: index + 1,
            });
            return stage.run(request, nuts, next);
        }
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<&str> = self.stages.iter().map(Stage::id).collect();
        f.debug_struct("Chain")
            .field("type", &self.nut_type)
            .field("stages", &ids)
            .finish()
    }
}

// ============================================================================
// Next
// ============================================================================

#[derive(Clone)]
enum Step {
    Chains,
    Stage { chain: Arc<Chain>, index: usize },
}

/// Continuation handed to a stage: everything downstream of it.
#[derive(Clone)]
pub struct Next(Step);

impl Next {
    /// Continuation running the per-type chains (what follows a head stage).
    pub fn chains() -> Self {
        Self(Step::Chains)
    }

    pub fn run(self, request: &EngineRequest, nuts: Vec<ConvertibleNut>) -> Result<Vec<ConvertibleNut>> {
        match self.0 {
            Step::Chains => run_chains(request, nuts),
            Step::Stage { chain, index } => chain.run_from(index, request, nuts),
        }
    }
}

/// Group `nuts` by type (first appearance order) and run each group through
/// its chain. Types without a chain pass through.
pub fn run_chains(request: &EngineRequest, nuts: Vec<ConvertibleNut>) -> Result<Vec<ConvertibleNut>> {
    let mut groups: Vec<(NutType, Vec<ConvertibleNut>)> = Vec::new();
    for nut in nuts {
        let nut_type = nut.nut_type();
        match groups.iter_mut().find(|(t, _)| *t == nut_type) {
            Some((_, group)) => group.push(nut),
            None => groups.push((nut_type, vec![nut])),
        }
    }

    let mut out = Vec::new();
    for (nut_type, group) in groups {
        match request.chain(nut_type) {
            Some(chain) => out.extend(chain.execute(request, group)?),
            None => out.extend(group),
        }
    }
    Ok(out)
}

// ============================================================================
// Construction
// ============================================================================

/// Split stages into the head and one chain per declared nut type.
///
/// - Cache stages are head candidates: the last extension wins, otherwise
///   the last core stage.
/// - An extension stage in a (type, category) slot removes the core stages
///   of that slot; stages of the same origin are all kept.
pub fn build_chains(stages: &[Stage]) -> (Option<Stage>, FxHashMap<NutType, Arc<Chain>>) {
    let heads: Vec<&Stage> = stages
        .iter()
        .filter(|s| s.category() == Category::Cache)
        .collect();
    let head = heads
        .iter()
        .rev()
        .find(|s| s.origin() == StageOrigin::Extension)
        .or_else(|| heads.last())
        .map(|s| (*s).clone());

    let body: Vec<&Stage> = stages
        .iter()
        .filter(|s| s.category() != Category::Cache)
        .collect();
    let types: BTreeSet<NutType> = body
        .iter()
        .flat_map(|s| s.nut_types().iter().copied())
        .collect();

    let mut chains = FxHashMap::default();
    for nut_type in types {
        let candidates: Vec<&Stage> = body
            .iter()
            .copied()
            .filter(|s| s.supports(nut_type))
            .collect();
        let overridden: FxHashSet<Category> = candidates
            .iter()
            .filter(|s| s.origin() == StageOrigin::Extension)
            .map(|s| s.category())
            .collect();
        let picked: Vec<Stage> = candidates
            .into_iter()
            .filter(|s| s.origin() == StageOrigin::Extension || !overridden.contains(&s.category()))
            .cloned()
            .collect();
        chains.insert(nut_type, Arc::new(Chain::new(nut_type, picked)));
    }
    (head, chains)
}

// ============================================================================
// Workflow
// ============================================================================

/// A heap bound to a head stage and its per-type chains.
#[derive(Clone)]
pub struct Workflow {
    id: String,
    heap: NutsHeap,
    head: Option<Stage>,
    chains: Arc<FxHashMap<NutType, Arc<Chain>>>,
}

impl Workflow {
    pub fn new(id: impl Into<String>, heap: NutsHeap, stages: &[Stage]) -> Self {
        let (head, chains) = build_chains(stages);
        Self {
            id: id.into(),
            heap,
            head,
            chains: Arc::new(chains),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn heap(&self) -> &NutsHeap {
        &self.heap
    }

    pub fn head(&self) -> Option<&Stage> {
        self.head.as_ref()
    }

    pub fn chain(&self, nut_type: NutType) -> Option<&Arc<Chain>> {
        self.chains.get(&nut_type)
    }

    /// Request builder pre-filled with this workflow's id, heap and chains.
    pub fn request(&self) -> EngineRequestBuilder {
        EngineRequest::builder(self.id.clone(), self.heap.clone()).chains(Arc::clone(&self.chains))
    }

    /// Run the head (if any) and the chains on the request's nuts.
    pub fn execute(&self, request: &EngineRequest) -> Result<Vec<ConvertibleNut>> {
        let nuts: Vec<ConvertibleNut> = request
            .nuts()
            .iter()
            .cloned()
            .map(ConvertibleNut::new)
            .collect();
        match &self.head {
            Some(head) if !request.skips(head.category()) && head.works() => {
                head.run(request, nuts, Next::chains())
            }
            _ => run_chains(request, nuts),
        }
    }
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("id", &self.id)
            .field("heap", &self.heap.id())
            .field("head", &self.head.as_ref().map(Stage::id))
            .field("chains", &self.chains.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Minifier, StageHandler, StageKind};
    use crate::nut::{Nut, StoreRef};
    use crate::store::MemoryStore;
    use parking_lot::Mutex;

    struct Record {
        id: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        enabled: bool,
    }

    impl StageHandler for Record {
        fn works(&self) -> bool {
            self.enabled
        }

        fn run(&self, request: &EngineRequest, nuts: Vec<ConvertibleNut>, next: Next) -> Result<Vec<ConvertibleNut>> {
            self.log.lock().push(self.id);
            next.run(request, nuts)
        }
    }

    fn stage(
        id: &'static str,
        category: Category,
        origin: StageOrigin,
        log: &Arc<Mutex<Vec<&'static str>>>,
    ) -> Stage {
        Stage::new(
            id,
            category,
            [NutType::Javascript, NutType::Css],
            origin,
            StageKind::Custom(Arc::new(Record {
                id,
                log: Arc::clone(log),
                enabled: true,
            })),
        )
    }

    fn heap() -> NutsHeap {
        let store = MemoryStore::in_memory("mem");
        store.put("a.js", b"var a;".to_vec());
        store.put("logo.png", vec![1u8, 2, 3]);
        NutsHeap::builder("h")
            .store(StoreRef::new("mem", Arc::new(store)))
            .paths(["a.js", "logo.png"])
            .build()
            .unwrap()
    }

    #[test]
    fn test_categories_run_in_order_regardless_of_registration() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stages = vec![
            stage("c", Category::Minification, StageOrigin::Core, &log),
            stage("a", Category::Converter, StageOrigin::Core, &log),
            stage("b", Category::Aggregator, StageOrigin::Core, &log),
        ];
        let wf = Workflow::new("wf", heap(), &stages);
        let req = wf.request().build().unwrap();
        wf.execute(&req).unwrap();
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_same_category_keeps_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stages = vec![
            stage("x1", Category::Converter, StageOrigin::Core, &log),
            stage("x2", Category::Converter, StageOrigin::Core, &log),
        ];
        let wf = Workflow::new("wf", heap(), &stages);
        wf.execute(&wf.request().build().unwrap()).unwrap();
        assert_eq!(*log.lock(), vec!["x1", "x2"]);
    }

    #[test]
    fn test_extension_overrides_core_in_slot() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stages = vec![
            stage("core-conv", Category::Converter, StageOrigin::Core, &log),
            stage("ext-conv", Category::Converter, StageOrigin::Extension, &log),
            stage("core-agg", Category::Aggregator, StageOrigin::Core, &log),
        ];
        let wf = Workflow::new("wf", heap(), &stages);
        wf.execute(&wf.request().build().unwrap()).unwrap();
        assert_eq!(*log.lock(), vec!["ext-conv", "core-agg"]);
    }

    #[test]
    fn test_head_selection() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stages = vec![
            stage("ext-cache", Category::Cache, StageOrigin::Extension, &log),
            stage("core-cache-1", Category::Cache, StageOrigin::Core, &log),
            stage("core-cache-2", Category::Cache, StageOrigin::Core, &log),
        ];
        let (head, chains) = build_chains(&stages);
        assert_eq!(head.unwrap().id(), "ext-cache");
        assert!(chains.is_empty());

        let (head, _) = build_chains(&stages[1..]);
        assert_eq!(head.unwrap().id(), "core-cache-2");
    }

    #[test]
    fn test_skip_and_disabled_stages_pass_through() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let disabled = Stage::new(
            "off",
            Category::Aggregator,
            [NutType::Javascript],
            StageOrigin::Core,
            StageKind::Custom(Arc::new(Record {
                id: "off",
                log: Arc::clone(&log),
                enabled: false,
            })),
        );
        let stages = vec![
            stage("conv", Category::Converter, StageOrigin::Core, &log),
            disabled,
            stage("min", Category::Minification, StageOrigin::Core, &log),
        ];
        let wf = Workflow::new("wf", heap(), &stages);
        let req = wf.request().skip([Category::Converter]).build().unwrap();
        let out = wf.execute(&req).unwrap();
        assert_eq!(*log.lock(), vec!["min"]);
        // png has no chain and passes through
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_unsupported_type_fails_fast() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = Arc::new(Chain::new(
            NutType::Javascript,
            vec![stage("conv", Category::Converter, StageOrigin::Core, &log)],
        ));
        let wf = Workflow::new("wf", heap(), &[]);
        let req = wf.request().build().unwrap();
        let png = ConvertibleNut::new(Nut::from_bytes("logo.png", NutType::Png, vec![1u8]));
        let err = chain.execute(&req, vec![png]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedType { nut_type: NutType::Png, .. }));
    }

    #[test]
    fn test_only_first_working_minifier_works() {
        let m = |id: &'static str, on: bool| {
            Stage::new(
                id,
                Category::Minification,
                [NutType::Javascript],
                StageOrigin::Core,
                StageKind::Minifier(Arc::new(Minifier::new(on))),
            )
        };
        let chain = Chain::new(
            NutType::Javascript,
            vec![m("m0", false), m("m1", true), m("m2", true)],
        );
        assert!(!chain.works(0));
        assert!(chain.works(1));
        assert!(!chain.works(2));
        // the stage itself is still enabled; only this chain drops it
        assert!(chain.stages()[2].works());
        assert!(!chain.works(3));
    }
}
