//! Convertible nuts: a nut plus the transformations stages attach to it.
//!
//! Stages never rewrite bytes directly. They register [`Transformer`]s, and
//! the bytes flow through them once, when `transform()` is called by the
//! cache or by the delivery layer.

use std::fmt;
use std::sync::Arc;

use super::{Nut, NutType, SourceMap, Version, VersionCallback};
use crate::error::{Error, Result};
use crate::utils::hash::combine;

/// A `bytes -> bytes` step registered by a stage.
pub trait Transformer: Send + Sync {
    /// Short name used in statistics and logs.
    fn name(&self) -> &str;

    /// Transform the whole content of one nut.
    fn transform(&self, input: Vec<u8>, cx: &mut TransformContext<'_>) -> Result<Vec<u8>>;
}

/// Callback invoked with the final bytes of a transformation.
pub type OnReady = Box<dyn FnOnce(&[u8]) + Send>;

// =============================================================================
// TransformContext
// =============================================================================

/// Borrowed view of the nut under transformation.
pub struct TransformContext<'a> {
    name: &'a str,
    nut_type: NutType,
    version: &'a Version,
    parts: &'a [PartSpan],
    referenced: Vec<ConvertibleNut>,
    source_map: Option<SourceMap>,
}

/// Byte span of one part inside a composite's concatenated content.
#[derive(Debug, Clone)]
struct PartSpan {
    end: usize,
    name: String,
}

impl TransformContext<'_> {
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn nut_type(&self) -> NutType {
        self.nut_type
    }

    /// Resolved version of the nut under transformation.
    pub fn version(&self) -> Result<u64> {
        self.version.get()
    }

    /// Name of the nut owning byte `position`.
    ///
    /// For a composite this is the part whose content covers the position;
    /// otherwise the nut itself.
    pub fn nut_at(&self, position: usize) -> &str {
        let idx = self.parts.partition_point(|p| p.end <= position);
        self.parts.get(idx).map_or(self.name, |p| p.name.as_str())
    }

    /// `(start offset, name)` of each composed part, in order.
    pub fn parts(&self) -> impl Iterator<Item = (usize, &str)> + '_ {
        let starts = std::iter::once(0).chain(self.parts.iter().map(|p| p.end));
        starts.zip(self.parts.iter()).map(|(start, p)| (start, p.name.as_str()))
    }

    /// Attach a nut discovered while transforming.
    pub fn add_referenced(&mut self, mut nut: ConvertibleNut) {
        nut.sub_resource = true;
        self.referenced.push(nut);
    }

    /// Record the position table of the produced content.
    pub fn set_source_map(&mut self, map: SourceMap) {
        self.source_map = Some(map);
    }
}

// =============================================================================
// ConvertibleNut
// =============================================================================

enum Origin {
    Nut(Nut),
    Composite(Vec<CompositePart>),
}

struct CompositePart {
    nut: ConvertibleNut,
    output: Option<Vec<u8>>,
}

/// A nut decorated with transformers, referenced nuts and delivery flags.
///
/// # Invariants
/// - `transform()` succeeds at most once per instance
/// - referenced nuts only appear as a side effect of `transform()`
pub struct ConvertibleNut {
    name: String,
    nut_type: NutType,
    origin: Origin,
    base_version: Version,
    version: Version,
    version_callbacks: Vec<(String, VersionCallback)>,
    transformers: Vec<Arc<dyn Transformer>>,
    ready_callbacks: Vec<OnReady>,
    referenced: Vec<ConvertibleNut>,
    compressed: bool,
    sub_resource: bool,
    dynamic: bool,
    proxy_uri: Option<String>,
    source_map: Option<SourceMap>,
    transformed: bool,
}

impl ConvertibleNut {
    /// Wrap a nut with an empty transformation layer.
    pub fn new(nut: Nut) -> Self {
        let version = nut.version().clone();
        Self {
            name: nut.name().to_string(),
            nut_type: nut.nut_type(),
            base_version: version.clone(),
            version,
            version_callbacks: Vec::new(),
            transformers: Vec::new(),
            ready_callbacks: Vec::new(),
            referenced: Vec::new(),
            compressed: false,
            sub_resource: false,
            dynamic: nut.is_dynamic(),
            proxy_uri: nut.proxy_uri().map(str::to_string),
            source_map: None,
            transformed: false,
            origin: Origin::Nut(nut),
        }
    }

    /// Nut whose content is the concatenated output of `parts`, in order.
    ///
    /// The version is derived from the parts' versions.
    pub fn composite(name: impl Into<String>, nut_type: NutType, parts: Vec<ConvertibleNut>) -> Self {
        let name = name.into();
        let versions: Vec<Version> = parts.iter().map(|p| p.version().clone()).collect();
        let version = Version::lazy(name.clone(), move || {
            let resolved = versions.iter().map(Version::get).collect::<Result<Vec<_>>>()?;
            Ok(combine(resolved))
        });
        Self {
            name,
            nut_type,
            base_version: version.clone(),
            version,
            version_callbacks: Vec::new(),
            transformers: Vec::new(),
            ready_callbacks: Vec::new(),
            referenced: Vec::new(),
            compressed: false,
            sub_resource: false,
            dynamic: false,
            proxy_uri: None,
            source_map: None,
            transformed: false,
            origin: Origin::Composite(
                parts
                    .into_iter()
                    .map(|nut| CompositePart { nut, output: None })
                    .collect(),
            ),
        }
    }

    // -------------------------------------------------------------------------
    // Identity
    // -------------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nut_type(&self) -> NutType {
        self.nut_type
    }

    /// Version, including registered version callbacks.
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Names of the composed parts (empty for a plain nut).
    pub fn part_names(&self) -> Vec<&str> {
        match &self.origin {
            Origin::Nut(_) => Vec::new(),
            Origin::Composite(parts) => parts.iter().map(|p| p.nut.name()).collect(),
        }
    }

    /// The wrapped nut, if this is not a composite.
    pub fn origin_nut(&self) -> Option<&Nut> {
        match &self.origin {
            Origin::Nut(nut) => Some(nut),
            Origin::Composite(_) => None,
        }
    }

    // -------------------------------------------------------------------------
    // Decoration
    // -------------------------------------------------------------------------

    /// Register a transformer. Registering the same instance twice is a no-op.
    pub fn add_transformer(&mut self, transformer: Arc<dyn Transformer>) {
        if !self
            .transformers
            .iter()
            .any(|t| Arc::ptr_eq(t, &transformer))
        {
            self.transformers.push(transformer);
        }
    }

    pub fn transformers(&self) -> &[Arc<dyn Transformer>] {
        &self.transformers
    }

    /// Callback invoked with the final bytes when `transform()` runs.
    pub fn on_ready(&mut self, callback: OnReady) {
        self.ready_callbacks.push(callback);
    }

    /// Make this nut's version track `referencer` through `callback`, which
    /// receives the referencer's name.
    pub fn add_version_callback(&mut self, referencer: impl Into<String>, callback: VersionCallback) {
        self.version_callbacks.push((referencer.into(), callback));
        self.version = self
            .base_version
            .derive(self.name.clone(), self.version_callbacks.clone());
    }

    pub fn referenced(&self) -> &[ConvertibleNut] {
        &self.referenced
    }

    /// Move the referenced nuts out (used when materializing results).
    pub fn take_referenced(&mut self) -> Vec<ConvertibleNut> {
        std::mem::take(&mut self.referenced)
    }

    /// Attach a nut that was produced next to this one (e.g. a source map).
    pub fn add_sub_resource(&mut self, mut nut: ConvertibleNut) {
        nut.sub_resource = true;
        self.referenced.push(nut);
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn set_compressed(&mut self, compressed: bool) {
        self.compressed = compressed;
    }

    pub fn is_sub_resource(&self) -> bool {
        self.sub_resource
    }

    pub fn set_sub_resource(&mut self, sub_resource: bool) {
        self.sub_resource = sub_resource;
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn proxy_uri(&self) -> Option<&str> {
        self.proxy_uri.as_deref()
    }

    pub fn set_proxy_uri(&mut self, uri: Option<String>) {
        self.proxy_uri = uri;
    }

    pub fn source_map(&self) -> Option<&SourceMap> {
        self.source_map.as_ref()
    }

    pub fn set_source_map(&mut self, map: SourceMap) {
        self.source_map = Some(map);
    }

    pub fn is_transformed(&self) -> bool {
        self.transformed
    }

    // -------------------------------------------------------------------------
    // Transformation
    // -------------------------------------------------------------------------

    /// Run every transformer once and hand the result to all callbacks.
    ///
    /// Fails with [`Error::AlreadyTransformed`] on a second call. If the
    /// content can't be opened the nut stays untransformed and the call can
    /// be retried.
    pub fn transform(&mut self, callbacks: Vec<OnReady>) -> Result<Vec<u8>> {
        if self.transformed {
            return Err(Error::AlreadyTransformed(self.name.clone()));
        }

        let (mut bytes, spans, mut referenced) = self.open_content()?;
        self.transformed = true;

        let mut cx = TransformContext {
            name: &self.name,
            nut_type: self.nut_type,
            version: &self.base_version,
            parts: &spans,
            referenced: Vec::new(),
            source_map: None,
        };
        for transformer in &self.transformers {
            bytes = transformer.transform(bytes, &mut cx)?;
        }
        referenced.append(&mut cx.referenced);
        if let Some(map) = cx.source_map.take() {
            self.source_map = Some(map);
        }
        self.referenced.append(&mut referenced);

        for callback in self.ready_callbacks.drain(..).chain(callbacks) {
            callback(&bytes);
        }
        Ok(bytes)
    }

    /// Raw content before this nut's own transformers.
    fn open_content(&mut self) -> Result<(Vec<u8>, Vec<PartSpan>, Vec<ConvertibleNut>)> {
        match &mut self.origin {
            Origin::Nut(nut) => Ok((nut.read_all()?, Vec::new(), Vec::new())),
            Origin::Composite(parts) => {
                let mut bytes = Vec::new();
                let mut spans = Vec::with_capacity(parts.len());
                let mut referenced = Vec::new();
                for part in parts.iter_mut() {
                    if part.output.is_none() {
                        part.output = Some(part.nut.transform(Vec::new())?);
                        referenced.append(&mut part.nut.take_referenced());
                    }
                    if let Some(output) = &part.output {
                        bytes.extend_from_slice(output);
                    }
                    spans.push(PartSpan {
                        end: bytes.len(),
                        name: part.nut.name().to_string(),
                    });
                }
                Ok((bytes, spans, referenced))
            }
        }
    }
}

impl fmt::Debug for ConvertibleNut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConvertibleNut")
            .field("name", &self.name)
            .field("type", &self.nut_type)
            .field("transformers", &self.transformers.len())
            .field("referenced", &self.referenced.len())
            .field("transformed", &self.transformed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io;

    struct Append(&'static str);

    impl Transformer for Append {
        fn name(&self) -> &str {
            "append"
        }

        fn transform(&self, mut input: Vec<u8>, _cx: &mut TransformContext<'_>) -> Result<Vec<u8>> {
            input.extend_from_slice(self.0.as_bytes());
            Ok(input)
        }
    }

    struct Reference;

    impl Transformer for Reference {
        fn name(&self) -> &str {
            "reference"
        }

        fn transform(&self, input: Vec<u8>, cx: &mut TransformContext<'_>) -> Result<Vec<u8>> {
            let nut = Nut::from_bytes("img/bg.png", NutType::Png, vec![1, 2, 3]);
            cx.add_referenced(ConvertibleNut::new(nut));
            Ok(input)
        }
    }

    fn js(name: &str, content: &str) -> ConvertibleNut {
        ConvertibleNut::new(Nut::from_bytes(
            name.to_string(),
            NutType::Javascript,
            content.as_bytes().to_vec(),
        ))
    }

    #[test]
    fn test_identity_transform() {
        let mut nut = js("a.js", "var a;");
        assert_eq!(nut.transform(Vec::new()).unwrap(), b"var a;");
        assert!(nut.is_transformed());
    }

    #[test]
    fn test_transformers_run_in_order() {
        let mut nut = js("a.js", "x");
        nut.add_transformer(Arc::new(Append("1")));
        nut.add_transformer(Arc::new(Append("2")));
        assert_eq!(nut.transform(Vec::new()).unwrap(), b"x12");
    }

    #[test]
    fn test_same_transformer_registered_once() {
        let mut nut = js("a.js", "x");
        let t: Arc<dyn Transformer> = Arc::new(Append("!"));
        nut.add_transformer(Arc::clone(&t));
        nut.add_transformer(t);
        assert_eq!(nut.transformers().len(), 1);
        assert_eq!(nut.transform(Vec::new()).unwrap(), b"x!");
    }

    #[test]
    fn test_second_transform_fails_and_callbacks_run_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut nut = js("a.js", "var a;");
        nut.add_transformer(Arc::new(Append(";")));

        let s = Arc::clone(&seen);
        nut.on_ready(Box::new(move |b| s.lock().push(b.to_vec())));
        let s = Arc::clone(&seen);
        nut.on_ready(Box::new(move |b| s.lock().push(b.to_vec())));
        let s = Arc::clone(&seen);
        let passed: OnReady = Box::new(move |b| s.lock().push(b.to_vec()));

        nut.transform(vec![passed]).unwrap();
        let err = nut.transform(Vec::new()).unwrap_err();
        assert!(matches!(err, Error::AlreadyTransformed(ref n) if n == "a.js"));

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|b| b == b"var a;;"));
    }

    #[test]
    fn test_open_failure_is_retryable() {
        let attempts = Arc::new(Mutex::new(0));
        let a = Arc::clone(&attempts);
        let opener: super::super::Opener = Arc::new(move || {
            let mut n = a.lock();
            *n += 1;
            if *n == 1 {
                Err(Error::io("flaky.js", io::Error::new(io::ErrorKind::Other, "busy")))
            } else {
                Ok(Box::new(io::Cursor::new(b"ok".to_vec())) as Box<dyn io::Read + Send>)
            }
        });
        let nut = Nut::new("flaky.js", NutType::Javascript, Version::fixed(1), opener);
        let mut convertible = ConvertibleNut::new(nut);

        assert!(matches!(convertible.transform(Vec::new()), Err(Error::Io(..))));
        assert!(!convertible.is_transformed());
        assert_eq!(convertible.transform(Vec::new()).unwrap(), b"ok");
    }

    #[test]
    fn test_referenced_only_after_transform() {
        let mut nut = js("a.css", "a{}");
        nut.add_transformer(Arc::new(Reference));
        assert!(nut.referenced().is_empty());
        nut.transform(Vec::new()).unwrap();
        assert_eq!(nut.referenced().len(), 1);
        assert!(nut.referenced()[0].is_sub_resource());
    }

    #[test]
    fn test_composite_concatenates_and_propagates_references() {
        let mut a = js("a.js", "var a;");
        a.add_transformer(Arc::new(Reference));
        let b = js("b.js", "var b;");

        let mut composite = ConvertibleNut::composite("aggregate.js", NutType::Javascript, vec![a, b]);
        assert_eq!(composite.part_names(), vec!["a.js", "b.js"]);
        assert_eq!(composite.transform(Vec::new()).unwrap(), b"var a;var b;");
        assert_eq!(composite.referenced().len(), 1);
    }

    #[test]
    fn test_composite_version_derived_from_parts() {
        let make = |b: &str| {
            ConvertibleNut::composite(
                "aggregate.js",
                NutType::Javascript,
                vec![js("a.js", "var a;"), js("b.js", b)],
            )
        };
        let v1 = make("var b;").version().get().unwrap();
        let v2 = make("var b;").version().get().unwrap();
        let v3 = make("var c;").version().get().unwrap();
        assert_eq!(v1, v2);
        assert_ne!(v1, v3);
    }

    #[test]
    fn test_nut_at_in_composite() {
        struct Probe(Arc<Mutex<Vec<String>>>);
        impl Transformer for Probe {
            fn name(&self) -> &str {
                "probe"
            }
            fn transform(&self, input: Vec<u8>, cx: &mut TransformContext<'_>) -> Result<Vec<u8>> {
                let mut seen = self.0.lock();
                seen.push(cx.nut_at(0).to_string());
                seen.push(cx.nut_at(5).to_string());
                seen.push(cx.nut_at(6).to_string());
                seen.push(cx.nut_at(100).to_string());
                Ok(input)
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut composite = ConvertibleNut::composite(
            "aggregate.js",
            NutType::Javascript,
            vec![js("dir/a.js", "var a;"), js("other/b.js", "var b;")],
        );
        composite.add_transformer(Arc::new(Probe(Arc::clone(&seen))));
        composite.transform(Vec::new()).unwrap();
        assert_eq!(
            *seen.lock(),
            vec!["dir/a.js", "dir/a.js", "other/b.js", "aggregate.js"]
        );
    }

    #[test]
    fn test_version_callback_tracks_referencer() {
        let mut map = js("aggregate.js.map", "{}");
        let base = map.version().get().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        map.add_version_callback(
            "aggregate.js",
            Arc::new(move |referencer: &str, v: u64| -> Result<u64> {
                record.lock().push(referencer.to_string());
                Ok(v.wrapping_add(1))
            }),
        );
        assert_eq!(map.version().get().unwrap(), base.wrapping_add(1));
        assert_eq!(*seen.lock(), vec!["aggregate.js"]);
    }
}
