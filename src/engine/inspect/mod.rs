//! Reference inspection: find, resolve and rewrite embedded references.
//!
//! A [`LineInspector`] only finds references. The [`InspectorStage`]
//! resolves each one against the referencer's store, runs what it finds
//! through the request's chains (cache skipped), and rewrites the text.
//!
//! Replacements of one inspector are committed from the highest start
//! position to the lowest, so no commit shifts a position still to be
//! used. Inspectors attached to the same nut type run one full pass after
//! the other.

mod css;
mod html;
mod source_map;

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

pub use css::CssInspector;
pub use html::HtmlInspector;
pub use source_map::SourceMapInspector;

use super::{Category, EngineRequest, run_chains};
use crate::error::{Error, Result};
use crate::nut::{ConvertibleNut, Nut, NutType, StoreRef, TransformContext, Transformer};
use crate::store::{PatternMode, ProxyStore, Store};
use crate::utils::path::{decode, is_external_link, merge_path, parent_dir, simplify, split_suffix};
use crate::{debug, log};

// =============================================================================
// Inspector contract
// =============================================================================

/// What a reference points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A path, possibly relative, possibly with `?query`/`#fragment`.
    Path(String),
    /// Embedded content of another type (inline `<style>`, `<script>`).
    Inline { nut_type: NutType, content: String },
}

/// What happens to a reference that can't be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// Keep the text, appending the referencer's version as a query.
    VersionQuery,
    /// Delete the byte range `start..end`.
    Remove { start: usize, end: usize },
}

/// One match: `start..end` is the byte range replaced on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub start: usize,
    pub end: usize,
    pub target: Target,
    pub fallback: Fallback,
}

impl Reference {
    pub fn path(start: usize, end: usize, path: impl Into<String>) -> Self {
        Self {
            start,
            end,
            target: Target::Path(path.into()),
            fallback: Fallback::VersionQuery,
        }
    }
}

/// Lexical scanner for one kind of reference.
///
/// Scanners may carry state between lines (open comments); the stage calls
/// `new_inspection` once before each independent text.
pub trait LineInspector: Send {
    fn name(&self) -> &str;

    /// Reset state carried between lines.
    fn new_inspection(&mut self);

    /// References in `text`, which starts at byte `offset` of the content.
    fn inspect(&mut self, text: &str, offset: usize) -> Vec<Reference>;

    /// `false` makes the stage pass the whole content in a single call.
    fn line_based(&self) -> bool {
        true
    }
}

/// Creates a fresh inspector for each transformation.
pub type InspectorFactory = Arc<dyn Fn() -> Box<dyn LineInspector> + Send + Sync>;

/// Run `inspector` over `text`, line by line if it asks for it.
pub fn collect(inspector: &mut dyn LineInspector, text: &str) -> Vec<Reference> {
    inspector.new_inspection();
    if !inspector.line_based() {
        return inspector.inspect(text, 0);
    }
    let mut refs = Vec::new();
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        refs.extend(inspector.inspect(line, offset));
        offset += line.len();
    }
    refs
}

/// A resolved rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

/// Commit `replacements` from the highest start to the lowest.
///
/// A replacement overlapping one already committed is dropped.
pub fn apply(mut text: String, mut replacements: Vec<Replacement>) -> String {
    replacements.sort_by(|a, b| b.start.cmp(&a.start).then(b.end.cmp(&a.end)));
    let mut floor = usize::MAX;
    for r in replacements {
        if r.end > floor || r.start > r.end || r.end > text.len() {
            continue;
        }
        text.replace_range(r.start..r.end, &r.text);
        floor = r.start;
    }
    text
}

/// `path` with `versionNumber=<version>` added to its query, before any fragment.
pub fn version_query(path: &str, version: u64) -> String {
    let (head, fragment) = path.find('#').map_or((path, ""), |pos| path.split_at(pos));
    let sep = if head.contains('?') { '&' } else { '?' };
    format!("{head}{sep}versionNumber={version}{fragment}")
}

// =============================================================================
// InspectorStage
// =============================================================================

/// Stage attaching reference-rewriting transformers to text nuts.
pub struct InspectorStage {
    enabled: bool,
    inspectors: FxHashMap<NutType, Vec<InspectorFactory>>,
}

impl InspectorStage {
    /// Stage without any inspector.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            inspectors: FxHashMap::default(),
        }
    }

    /// Built-in inspectors: CSS urls, HTML tags and source map comments.
    pub fn with_defaults(enabled: bool) -> Self {
        Self::new(enabled)
            .with_inspector(NutType::Css, Arc::new(|| Box::new(CssInspector::default())))
            .with_inspector(NutType::Css, Arc::new(|| Box::new(SourceMapInspector)))
            .with_inspector(NutType::Javascript, Arc::new(|| Box::new(SourceMapInspector)))
            .with_inspector(NutType::Html, Arc::new(|| Box::new(HtmlInspector)))
    }

    /// Attach another inspector for `nut_type`, after the existing ones.
    pub fn with_inspector(mut self, nut_type: NutType, factory: InspectorFactory) -> Self {
        self.inspectors.entry(nut_type).or_default().push(factory);
        self
    }

    /// Types with at least one inspector.
    pub fn nut_types(&self) -> Vec<NutType> {
        let mut types: Vec<NutType> = self.inspectors.keys().copied().collect();
        types.sort();
        types
    }

    pub fn works(&self) -> bool {
        self.enabled
    }

    pub(crate) fn run(&self, request: &EngineRequest, mut nuts: Vec<ConvertibleNut>) -> Result<Vec<ConvertibleNut>> {
        for nut in &mut nuts {
            let Some(factories) = self.inspectors.get(&nut.nut_type()) else {
                continue;
            };
            nut.add_transformer(request.timed(Arc::new(Inspect {
                request: request.clone(),
                factories: factories.clone(),
            })));
        }
        Ok(nuts)
    }
}

impl fmt::Debug for InspectorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InspectorStage")
            .field("enabled", &self.enabled)
            .field("types", &self.nut_types())
            .finish()
    }
}

// =============================================================================
// Inspect transformer
// =============================================================================

struct Inspect {
    request: EngineRequest,
    factories: Vec<InspectorFactory>,
}

impl Transformer for Inspect {
    fn name(&self) -> &str {
        "inspect"
    }

    fn transform(&self, input: Vec<u8>, cx: &mut TransformContext<'_>) -> Result<Vec<u8>> {
        let mut text = match String::from_utf8(input) {
            Ok(text) => text,
            Err(e) => {
                debug!("inspect"; "{} is not UTF-8, left as is", cx.name());
                return Ok(e.into_bytes());
            }
        };

        let mut inline_index = 0;
        for factory in &self.factories {
            let mut inspector = factory();
            let refs = collect(inspector.as_mut(), &text);
            debug!("inspect"; "{} found {} reference(s) in {}", inspector.name(), refs.len(), cx.name());

            let mut replacements = Vec::with_capacity(refs.len());
            for reference in refs {
                let replacement = match &reference.target {
                    Target::Path(path) => self.resolve_path(&reference, path, &text, cx)?,
                    Target::Inline { nut_type, content } => {
                        inline_index += 1;
                        Some(self.process_inline(&reference, *nut_type, content, inline_index - 1, cx)?)
                    }
                };
                replacements.extend(replacement);
            }
            text = apply(text, replacements);
        }
        Ok(text.into_bytes())
    }
}

impl Inspect {
    fn resolve_path(
        &self,
        reference: &Reference,
        raw: &str,
        text: &str,
        cx: &mut TransformContext<'_>,
    ) -> Result<Option<Replacement>> {
        let raw = raw.trim();
        if raw.is_empty() || is_external_link(raw) {
            return Ok(None);
        }

        let owner = cx.nut_at(reference.start).to_string();
        let (path, suffix) = split_suffix(raw);
        let decoded = decode(path);
        let joined = match decoded.strip_prefix('/') {
            Some(absolute) => absolute.to_string(),
            None => merge_path(&[parent_dir(&owner), &decoded]),
        };
        let resolved = simplify(&joined).ok_or_else(|| Error::UnreachablePath {
            referencer: cx.name().to_string(),
            path: raw.to_string(),
        })?;

        let heap = self.request.heap();
        let Some(store) = heap.store_for(&owner) else {
            return self.fallback(reference, raw, text, cx).map(Some);
        };
        let nuts = match store.store.resolve(&resolved, PatternMode::Exact) {
            Ok(nuts) => nuts,
            Err(e) if e.is_not_found() => {
                log!("inspect"; "{} references {} which can't be resolved in {}, keeping it", cx.name(), raw, store.id);
                return self.fallback(reference, raw, text, cx).map(Some);
            }
            Err(e) => return Err(e),
        };

        // A reference back to a nut being inspected up the call stack.
        if resolved == cx.name() || self.request.origin().iter().any(|o| *o == resolved) {
            let version = nuts.first().map_or_else(|| cx.version(), |n| n.version().get())?;
            let url = self.request.url_for(version, &resolved);
            return Ok(Some(Replacement {
                start: reference.start,
                end: reference.end,
                text: format!("{url}{suffix}"),
            }));
        }

        let skip: Vec<Category> = self
            .request
            .skip()
            .iter()
            .copied()
            .chain([Category::Cache])
            .collect();
        let results = self.process(cx.name(), &resolved, store, nuts, skip)?;
        let Some(first) = results.first() else {
            return self.fallback(reference, raw, text, cx).map(Some);
        };
        let url = match first.proxy_uri() {
            Some(uri) => uri.to_string(),
            None => self.request.url_for(first.version().get()?, first.name()),
        };
        for nut in results {
            cx.add_referenced(nut);
        }
        Ok(Some(Replacement {
            start: reference.start,
            end: reference.end,
            text: format!("{url}{suffix}"),
        }))
    }

    /// Run `nuts` through the chains in a request derived for `path`.
    fn process(
        &self,
        referencer: &str,
        path: &str,
        store: StoreRef,
        nuts: Vec<Nut>,
        skip: Vec<Category>,
    ) -> Result<Vec<ConvertibleNut>> {
        let heap_id = format!("{}:{}", self.request.heap().id(), path);
        let heap = self.request.heap().derive(heap_id, store, vec![path.to_string()]);
        heap.adopt(&nuts);
        let sub = self
            .request
            .derive()
            .heap(heap)
            .nuts(nuts.clone())
            .skip(skip)
            .referenced_from(referencer)
            .build();
        run_chains(&sub, nuts.into_iter().map(ConvertibleNut::new).collect())
    }

    /// Process embedded content and return its text in place of the original.
    fn process_inline(
        &self,
        reference: &Reference,
        nut_type: NutType,
        content: &str,
        index: usize,
        cx: &mut TransformContext<'_>,
    ) -> Result<Replacement> {
        let name = format!("{}{}{}", cx.name(), index, nut_type.extension());
        let nut = Nut::from_bytes(name.as_str(), nut_type, content.as_bytes().to_vec());

        let delegate = self
            .request
            .heap()
            .store_for(cx.nut_at(reference.start))
            .map(|s| s.store);
        let proxy = ProxyStore::new(format!("inline:{}", cx.name()), delegate);
        proxy.proxy_nut(name.as_str(), nut.clone());
        let proxy: Arc<dyn Store> = Arc::new(proxy);

        let skip: Vec<Category> = self
            .request
            .skip()
            .iter()
            .copied()
            .chain([Category::Cache, Category::Compression])
            .collect();
        let results = self.process(cx.name(), &name, StoreRef::new(name.as_str(), proxy), vec![nut], skip)?;

        let mut processed = None;
        for mut result in results {
            if processed.is_none() && result.nut_type() == nut_type {
                let bytes = result.transform(Vec::new())?;
                processed = Some(String::from_utf8_lossy(&bytes).into_owned());
                for referenced in result.take_referenced() {
                    cx.add_referenced(referenced);
                }
            } else {
                cx.add_referenced(result);
            }
        }
        debug!("inspect"; "inline {} of {} processed", name, cx.name());
        Ok(Replacement {
            start: reference.start,
            end: reference.end,
            text: processed.unwrap_or_else(|| content.to_string()),
        })
    }

    fn fallback(
        &self,
        reference: &Reference,
        raw: &str,
        text: &str,
        cx: &TransformContext<'_>,
    ) -> Result<Replacement> {
        match reference.fallback {
            Fallback::Remove { start, end } => Ok(Replacement {
                start,
                end,
                text: String::new(),
            }),
            Fallback::VersionQuery => {
                let original = text.get(reference.start..reference.end).unwrap_or(raw);
                Ok(Replacement {
                    start: reference.start,
                    end: reference.end,
                    text: version_query(original, cx.version()?),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests;
