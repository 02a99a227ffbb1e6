//! Registrations bundled under one configuration tag.

use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::engine::Stage;
use crate::error::{Error, Result};
use crate::store::Store;

// ============================================================================
// Registrations
// ============================================================================

/// A store, optionally routing some paths to other registered stores.
#[derive(Clone)]
pub struct StoreRegistration {
    pub store: Arc<dyn Store>,
    /// `(path, store id)` pairs served by another store.
    pub proxied: Vec<(String, String)>,
}

impl StoreRegistration {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            proxied: Vec::new(),
        }
    }

    /// Serve `path` from the store registered as `store_id`.
    pub fn proxy(mut self, path: impl Into<String>, store_id: impl Into<String>) -> Self {
        self.proxied.push((path.into(), store_id.into()));
        self
    }
}

impl fmt::Debug for StoreRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreRegistration")
            .field("store", &self.store.name())
            .field("proxied", &self.proxied)
            .finish()
    }
}

/// Paths in a store and/or other heaps to compose.
#[derive(Debug, Clone, Default)]
pub struct HeapRegistration {
    pub store_id: Option<String>,
    pub paths: Vec<String>,
    pub heap_ids: Vec<String>,
}

impl HeapRegistration {
    pub fn new<I, S>(store_id: impl Into<String>, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            store_id: Some(store_id.into()),
            paths: paths.into_iter().map(Into::into).collect(),
            heap_ids: Vec::new(),
        }
    }

    /// Heap made only of other heaps.
    pub fn composite<I, S>(heap_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            store_id: None,
            paths: Vec::new(),
            heap_ids: heap_ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn compose(mut self, heap_id: impl Into<String>) -> Self {
        self.heap_ids.push(heap_id.into());
        self
    }

    pub fn is_composite(&self) -> bool {
        !self.heap_ids.is_empty()
    }
}

/// Stage selection shared by workflows.
#[derive(Debug, Clone)]
pub struct TemplateRegistration {
    pub stage_ids: Vec<String>,
    /// Start from every core stage before adding `stage_ids`.
    pub include_defaults: bool,
    pub exclusions: Vec<String>,
    pub store_ids: Vec<String>,
}

impl Default for TemplateRegistration {
    fn default() -> Self {
        Self {
            stage_ids: Vec::new(),
            include_defaults: true,
            exclusions: Vec::new(),
            store_ids: Vec::new(),
        }
    }
}

impl TemplateRegistration {
    pub fn stage(mut self, id: impl Into<String>) -> Self {
        self.stage_ids.push(id.into());
        self
    }

    pub fn exclude(mut self, id: impl Into<String>) -> Self {
        self.exclusions.push(id.into());
        self
    }

    pub fn without_defaults(mut self) -> Self {
        self.include_defaults = false;
        self
    }

    pub fn depends_on(mut self, store_id: impl Into<String>) -> Self {
        self.store_ids.push(store_id.into());
        self
    }
}

/// Binds heaps matching a pattern to a template.
#[derive(Debug, Clone)]
pub struct WorkflowRegistration {
    pub id_prefix: String,
    pub heap_pattern: String,
    pub template_id: Option<String>,
    /// One workflow per matching heap instead of one over all of them.
    pub for_each_heap: bool,
}

impl WorkflowRegistration {
    pub fn new(id_prefix: impl Into<String>, heap_pattern: impl Into<String>) -> Self {
        Self {
            id_prefix: id_prefix.into(),
            heap_pattern: heap_pattern.into(),
            template_id: None,
            for_each_heap: false,
        }
    }

    pub fn template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    pub fn for_each_heap(mut self, for_each_heap: bool) -> Self {
        self.for_each_heap = for_each_heap;
        self
    }

    /// Anchored regex over heap ids.
    pub fn heap_regex(&self) -> Result<Regex> {
        Regex::new(&format!("^(?:{})$", self.heap_pattern)).map_err(|source| {
            Error::InvalidPattern {
                pattern: self.heap_pattern.clone(),
                source,
            }
        })
    }
}

// ============================================================================
// ContextSetting
// ============================================================================

/// Kind of registration, used to scope id uniqueness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationKind {
    Store,
    Heap,
    Stage,
    Template,
    Workflow,
}

impl RegistrationKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::Heap => "heap",
            Self::Stage => "stage",
            Self::Template => "template",
            Self::Workflow => "workflow",
        }
    }
}

/// Every registration of one tag, in registration order.
#[derive(Debug, Clone, Default)]
pub struct ContextSetting {
    pub(crate) stores: Vec<(String, StoreRegistration)>,
    pub(crate) heaps: Vec<(String, HeapRegistration)>,
    pub(crate) stages: Vec<Stage>,
    pub(crate) templates: Vec<(String, TemplateRegistration)>,
    pub(crate) workflows: Vec<(String, WorkflowRegistration)>,
}

impl ContextSetting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(mut self, id: impl Into<String>, registration: StoreRegistration) -> Self {
        self.stores.push((id.into(), registration));
        self
    }

    pub fn heap(mut self, id: impl Into<String>, registration: HeapRegistration) -> Self {
        self.heaps.push((id.into(), registration));
        self
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn template(mut self, id: impl Into<String>, registration: TemplateRegistration) -> Self {
        self.templates.push((id.into(), registration));
        self
    }

    pub fn workflow(mut self, id: impl Into<String>, registration: WorkflowRegistration) -> Self {
        self.workflows.push((id.into(), registration));
        self
    }

    /// `(kind, id)` of every registration.
    pub fn ids(&self) -> impl Iterator<Item = (RegistrationKind, &str)> {
        let stores = self.stores.iter().map(|(id, _)| (RegistrationKind::Store, id.as_str()));
        let heaps = self.heaps.iter().map(|(id, _)| (RegistrationKind::Heap, id.as_str()));
        let stages = self.stages.iter().map(|s| (RegistrationKind::Stage, s.id()));
        let templates = self
            .templates
            .iter()
            .map(|(id, _)| (RegistrationKind::Template, id.as_str()));
        let workflows = self
            .workflows
            .iter()
            .map(|(id, _)| (RegistrationKind::Workflow, id.as_str()));
        stores.chain(heaps).chain(stages).chain(templates).chain(workflows)
    }

    pub fn has(&self, kind: RegistrationKind, id: &str) -> bool {
        self.ids().any(|(k, i)| k == kind && i == id)
    }

    pub fn is_empty(&self) -> bool {
        self.ids().next().is_none()
    }

    /// Whether any registration here points at something `other` registers.
    pub(crate) fn references(&self, other: &ContextSetting) -> bool {
        let store = |id: &str| other.has(RegistrationKind::Store, id);
        let heap = |id: &str| other.has(RegistrationKind::Heap, id);

        let stores = self
            .stores
            .iter()
            .any(|(_, s)| s.proxied.iter().any(|(_, id)| store(id.as_str())));
        let heaps = self.heaps.iter().any(|(_, h)| {
            h.store_id.as_deref().is_some_and(store)
                || h.heap_ids.iter().any(|id| heap(id.as_str()))
        });
        let templates = self.templates.iter().any(|(_, t)| {
            t.store_ids.iter().any(|id| store(id.as_str()))
                || t.stage_ids
                    .iter()
                    .chain(&t.exclusions)
                    .any(|id| other.has(RegistrationKind::Stage, id))
        });
        let workflows = self.workflows.iter().any(|(_, w)| {
            w.template_id
                .as_deref()
                .is_some_and(|id| other.has(RegistrationKind::Template, id))
                || w.heap_regex()
                    .is_ok_and(|re| other.heaps.iter().any(|(id, _)| re.is_match(id)))
        });
        stores || heaps || templates || workflows
    }
}
