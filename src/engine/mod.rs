//! Stage pipeline.
//!
//! A workflow owns an optional head stage (the cache) and one [`Chain`] per
//! nut type. Stages are plain data ([`Stage`]) interpreted by the chain:
//!
//! ```text
//! request ─► head (cache) ─► run_chains ─┬─► chain[js]  : inspect ─► aggregate ─► minify ─► gzip
//!                                        ├─► chain[css] : inspect ─► aggregate ─► minify ─► gzip
//!                                        └─► (no chain) : pass through
//! ```

mod aggregate;
mod cache;
mod chain;
mod compress;
pub mod inspect;
mod key;
mod minify;
mod request;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use smallvec::SmallVec;

use crate::error::Result;
use crate::nut::{ConvertibleNut, NutType};

pub use aggregate::Aggregator;
pub use cache::{CacheStage, CachedNut, NutCache};
pub use chain::{Chain, Next, Workflow, build_chains, run_chains};
pub use compress::Compressor;
pub use inspect::InspectorStage;
pub use key::CacheKey;
pub use minify::{Minifier, minify};
pub use request::{
    DefaultUrlProvider, EngineRequest, EngineRequestBuilder, HeapStat, ProcessContext,
    RequestStats, StageStat, SubRequestBuilder, TransformerStat, UrlProvider,
};

// ============================================================================
// Category
// ============================================================================

/// Processing kind of a stage. Lower categories run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Cache = 0,
    Converter = 1,
    Inspector = 2,
    Aggregator = 3,
    Minification = 4,
    Compression = 5,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Self::Cache,
        Self::Converter,
        Self::Inspector,
        Self::Aggregator,
        Self::Minification,
        Self::Compression,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Converter => "converter",
            Self::Inspector => "inspector",
            Self::Aggregator => "aggregator",
            Self::Minification => "minification",
            Self::Compression => "compression",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Built-in stages can be overridden by extension stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOrigin {
    Core,
    Extension,
}

// ============================================================================
// Stage
// ============================================================================

/// User supplied stage behavior.
pub trait StageHandler: Send + Sync {
    /// `false` makes the chain pass input straight to the next stage.
    fn works(&self) -> bool {
        true
    }

    fn run(
        &self,
        request: &EngineRequest,
        nuts: Vec<ConvertibleNut>,
        next: Next,
    ) -> Result<Vec<ConvertibleNut>>;
}

/// Stage behavior, dispatched by the chain.
#[derive(Clone)]
pub enum StageKind {
    Cache(Arc<CacheStage>),
    Inspector(Arc<InspectorStage>),
    Aggregator(Arc<Aggregator>),
    Minifier(Arc<Minifier>),
    Compressor(Arc<Compressor>),
    Custom(Arc<dyn StageHandler>),
}

/// One configured pipeline stage.
#[derive(Clone)]
pub struct Stage {
    id: Arc<str>,
    category: Category,
    nut_types: SmallVec<[NutType; 4]>,
    origin: StageOrigin,
    kind: StageKind,
}

impl Stage {
    pub fn new(
        id: impl Into<Arc<str>>,
        category: Category,
        nut_types: impl IntoIterator<Item = NutType>,
        origin: StageOrigin,
        kind: StageKind,
    ) -> Self {
        Self {
            id: id.into(),
            category,
            nut_types: nut_types.into_iter().collect(),
            origin,
            kind,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn nut_types(&self) -> &[NutType] {
        &self.nut_types
    }

    pub fn origin(&self) -> StageOrigin {
        self.origin
    }

    pub fn kind(&self) -> &StageKind {
        &self.kind
    }

    pub fn supports(&self, nut_type: NutType) -> bool {
        self.nut_types.contains(&nut_type)
    }

    /// Whether the stage is enabled by its own configuration.
    pub fn works(&self) -> bool {
        match &self.kind {
            StageKind::Cache(s) => s.works(),
            StageKind::Inspector(s) => s.works(),
            StageKind::Aggregator(s) => s.works(),
            StageKind::Minifier(s) => s.works(),
            StageKind::Compressor(s) => s.works(),
            StageKind::Custom(s) => s.works(),
        }
    }

    pub(crate) fn run(
        &self,
        request: &EngineRequest,
        nuts: Vec<ConvertibleNut>,
        next: Next,
    ) -> Result<Vec<ConvertibleNut>> {
        let out = match &self.kind {
            StageKind::Cache(s) => return s.run(request, nuts, next),
            StageKind::Custom(s) => return s.run(request, nuts, next),
            StageKind::Inspector(s) => self.measured(request, nuts, |n| s.run(request, n))?,
            StageKind::Aggregator(s) => self.measured(request, nuts, |n| s.run(request, n))?,
            StageKind::Minifier(s) => self.measured(request, nuts, |n| s.run(request, n)),
            StageKind::Compressor(s) => self.measured(request, nuts, |n| s.run(request, n)),
        };
        next.run(request, out)
    }

    /// Time the stage's own work (not what runs downstream).
    fn measured<T>(
        &self,
        request: &EngineRequest,
        nuts: Vec<ConvertibleNut>,
        f: impl FnOnce(Vec<ConvertibleNut>) -> T,
    ) -> T {
        let nut_type = nuts.first().map(ConvertibleNut::nut_type);
        let count = nuts.len();
        let start = Instant::now();
        let out = f(nuts);
        if let Some(nut_type) = nut_type {
            request.record_stage(&self.id, nut_type, count, start.elapsed());
        }
        out
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("types", &self.nut_types)
            .field("origin", &self.origin)
            .finish()
    }
}
