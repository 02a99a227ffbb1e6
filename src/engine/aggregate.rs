//! Aggregation: concatenating the static nuts of a chain into one nut.

use std::sync::Arc;

use super::EngineRequest;
use crate::error::Result;
use crate::nut::{
    ConvertibleNut, Nut, NutType, Opener, SourceMap, TransformContext, Transformer, Version,
    VersionCallback,
};
use crate::utils::hash::combine;
use crate::{debug, log};

/// Name of the aggregate produced for `nut_type`.
pub fn aggregation_name(nut_type: NutType) -> String {
    format!("aggregate{}", nut_type.extension())
}

/// Concatenates static nuts; dynamic nuts pass through ahead of the result.
#[derive(Debug)]
pub struct Aggregator {
    enabled: bool,
}

impl Aggregator {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn works(&self) -> bool {
        self.enabled
    }

    pub(crate) fn run(&self, request: &EngineRequest, nuts: Vec<ConvertibleNut>) -> Result<Vec<ConvertibleNut>> {
        let (mut out, statics): (Vec<_>, Vec<_>) = nuts.into_iter().partition(ConvertibleNut::is_dynamic);

        // A lone nut keeps its own name so references to it stay valid.
        if statics.len() <= 1 {
            out.extend(statics);
            return Ok(out);
        }

        let Some(nut_type) = statics.first().map(ConvertibleNut::nut_type) else {
            return Ok(out);
        };
        let name = aggregation_name(nut_type);
        log!("aggregate"; "{} nut(s) into {} for workflow {}", statics.len(), name, request.workflow_id());

        let mut aggregate = ConvertibleNut::composite(name, nut_type, statics);
        let version = aggregate.version().clone();
        aggregate.add_transformer(request.timed(Arc::new(SourceMapper { version })));
        out.push(aggregate);
        Ok(out)
    }
}

/// Builds the aggregate's source map and publishes it as a sub-resource.
struct SourceMapper {
    version: Version,
}

impl Transformer for SourceMapper {
    fn name(&self) -> &str {
        "source-map"
    }

    fn transform(&self, input: Vec<u8>, cx: &mut TransformContext<'_>) -> Result<Vec<u8>> {
        let map = SourceMap::from_parts(cx.name(), &input, cx.parts());
        let map_name = format!("{}.map", cx.name());
        debug!("aggregate"; "source map {} with {} source(s)", map_name, map.sources().len());

        let json: Arc<[u8]> = map.to_json().into_bytes().into();
        let opener: Opener = Arc::new(move || {
            Ok(Box::new(std::io::Cursor::new(Arc::clone(&json))) as Box<dyn std::io::Read + Send>)
        });

        // The map is versioned after the aggregate it describes.
        let aggregate = self.version.clone();
        let tracking: VersionCallback = Arc::new(move |_: &str, base: u64| -> Result<u64> {
            Ok(combine([base, aggregate.get()?]))
        });
        let mut map_nut = ConvertibleNut::new(Nut::new(map_name, NutType::Map, Version::fixed(0), opener));
        map_nut.add_version_callback(cx.name(), tracking);

        cx.add_referenced(map_nut);
        cx.set_source_map(map);
        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Category, Stage, StageKind, StageOrigin, Workflow};
    use crate::nut::{NutsHeap, StoreRef};
    use crate::store::MemoryStore;

    fn workflow(enabled: bool) -> Workflow {
        let store = MemoryStore::in_memory("mem");
        store.put("a.js", b"var a;".to_vec());
        store.put("b.js", b"var b;".to_vec());
        let heap = NutsHeap::builder("h")
            .store(StoreRef::new("mem", Arc::new(store)))
            .paths(["a.js", "b.js"])
            .build()
            .unwrap();
        let stage = Stage::new(
            "aggregator",
            Category::Aggregator,
            [NutType::Javascript, NutType::Css],
            StageOrigin::Core,
            StageKind::Aggregator(Arc::new(Aggregator::new(enabled))),
        );
        Workflow::new("wf", heap, &[stage])
    }

    #[test]
    fn test_aggregates_in_heap_order() {
        let wf = workflow(true);
        let req = wf.request().build().unwrap();
        let mut out = wf.execute(&req).unwrap();
        assert_eq!(out.len(), 1);

        let nut = &mut out[0];
        assert_eq!(nut.name(), "aggregate.js");
        assert!(nut.referenced().is_empty());
        assert_eq!(nut.transform(Vec::new()).unwrap(), b"var a;var b;");

        let expected = combine([
            req.nuts()[0].version().get().unwrap(),
            req.nuts()[1].version().get().unwrap(),
        ]);
        assert_eq!(nut.version().get().unwrap(), expected);
    }

    #[test]
    fn test_source_map_sub_resource() {
        let wf = workflow(true);
        let mut out = wf.execute(&wf.request().build().unwrap()).unwrap();
        let nut = &mut out[0];
        nut.transform(Vec::new()).unwrap();

        let map = nut.source_map().unwrap();
        assert_eq!(map.sources(), &["a.js".to_string(), "b.js".to_string()]);
        assert_eq!(map.source_at(0, 6), Some("b.js"));

        let refs = nut.referenced();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name(), "aggregate.js.map");
        assert!(refs[0].is_sub_resource());
        let aggregate_version = nut.version().get().unwrap();
        assert_eq!(
            refs[0].version().get().unwrap(),
            combine([0, aggregate_version])
        );
    }

    #[test]
    fn test_disabled_passes_through() {
        let wf = workflow(false);
        let out = wf.execute(&wf.request().build().unwrap()).unwrap();
        let names: Vec<_> = out.iter().map(ConvertibleNut::name).collect();
        assert_eq!(names, vec!["a.js", "b.js"]);
    }

    #[test]
    fn test_dynamic_nuts_are_not_aggregated() {
        let wf = workflow(true);
        let req = wf.request().build().unwrap();
        let mut nuts = req.nuts().to_vec();
        nuts.push(Nut::from_bytes("live.js", NutType::Javascript, b"var now;".to_vec()).dynamic(true));
        let req = req.derive().nuts(nuts).build();
        let out = wf.execute(&req).unwrap();
        let names: Vec<_> = out.iter().map(ConvertibleNut::name).collect();
        assert_eq!(names, vec!["live.js", "aggregate.js"]);
    }
}
