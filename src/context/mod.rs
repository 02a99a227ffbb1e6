//! Configuration registry and the workflows compiled from it.
//!
//! # Module Structure
//!
//! ```text
//! context/
//! ├── setting    # Registrations of one tag (stores, heaps, stages, templates, workflows)
//! ├── tagged     # Tag -> setting map, id uniqueness and the dependency walk
//! ├── builder    # ContextBuilder: register/clear/refresh and build()
//! ├── facade     # Facade: lazily rebuilt snapshot behind an ArcSwap
//! └── mod.rs     # Context (this file)
//! ```
//!
//! Registrations arrive in batches named by a tag. When a tag changes, every
//! tag referencing it is refreshed too: stores and heaps are freed, cached
//! results purged, and contexts built before the change report
//! `is_up_to_date() == false`.

mod builder;
mod facade;
mod setting;
mod tagged;


use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use rustc_hash::FxHashMap;

use crate::engine::{DefaultUrlProvider, ProcessContext, UrlProvider, Workflow};
use crate::error::{Error, Result};
use crate::nut::ConvertibleNut;

pub use builder::{
    AGGREGATOR_STAGE, CACHE_STAGE, ContextBuilder, DEFAULT_TAG, GZIP_STAGE, INSPECTOR_STAGE,
    MINIFIER_STAGE,
};
pub use facade::Facade;
pub use setting::{
    ContextSetting, HeapRegistration, RegistrationKind, StoreRegistration, TemplateRegistration,
    WorkflowRegistration,
};
pub use tagged::TaggedSettings;

use builder::BuilderInner;

/// Request values applied to every workflow run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDefaults {
    pub context_path: String,
    pub charset: String,
    /// Answer cache misses with a partial result while computing the full one.
    pub best_effort: bool,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            context_path: String::new(),
            charset: "UTF-8".to_string(),
            best_effort: false,
        }
    }
}

// ============================================================================
// Context
// ============================================================================

/// Immutable snapshot of the workflows built from the registrations.
pub struct Context {
    workflows: Vec<Workflow>,
    index: FxHashMap<String, usize>,
    generation: u64,
    builder: Weak<BuilderInner>,
    defaults: RequestDefaults,
}

impl Context {
    pub(crate) fn new(
        workflows: Vec<Workflow>,
        generation: u64,
        builder: Weak<BuilderInner>,
        defaults: RequestDefaults,
    ) -> Self {
        let index = workflows
            .iter()
            .enumerate()
            .map(|(i, wf)| (wf.id().to_string(), i))
            .collect();
        Self {
            workflows,
            index,
            generation,
            builder,
            defaults,
        }
    }

    /// Workflow ids in build order.
    pub fn workflow_ids(&self) -> impl Iterator<Item = &str> {
        self.workflows.iter().map(Workflow::id)
    }

    pub fn get_workflow(&self, id: &str) -> Option<&Workflow> {
        self.index.get(id).map(|&i| &self.workflows[i])
    }

    pub fn defaults(&self) -> &RequestDefaults {
        &self.defaults
    }

    /// `false` once any registration changed after this snapshot was built.
    pub fn is_up_to_date(&self) -> bool {
        self.builder
            .upgrade()
            .is_some_and(|b| b.generation.load(Ordering::Acquire) == self.generation)
    }

    /// Run one workflow with the configured context path and URL layout.
    pub fn run_workflow(
        &self,
        workflow_id: &str,
        process_context: Option<ProcessContext>,
    ) -> Result<Vec<ConvertibleNut>> {
        let workflow = self.get_workflow(workflow_id).ok_or_else(|| Error::UnknownId {
            kind: "workflow",
            id: workflow_id.to_string(),
        })?;
        self.execute(
            workflow,
            &self.defaults.context_path,
            Arc::new(DefaultUrlProvider),
            process_context,
        )
    }

    /// Run a workflow by id, or every workflow whose heap id matches
    /// `workflow_id_or_pattern` (anchored regex), concatenating results.
    pub fn process(
        &self,
        context_path: &str,
        workflow_id_or_pattern: &str,
        url_provider: Arc<dyn UrlProvider>,
        process_context: Option<ProcessContext>,
    ) -> Result<Vec<ConvertibleNut>> {
        let selected = self.select(workflow_id_or_pattern)?;
        let mut out = Vec::new();
        for workflow in selected {
            out.extend(self.execute(
                workflow,
                context_path,
                Arc::clone(&url_provider),
                process_context.clone(),
            )?);
        }
        Ok(out)
    }

    fn select(&self, id_or_pattern: &str) -> Result<Vec<&Workflow>> {
        if let Some(workflow) = self.get_workflow(id_or_pattern) {
            return Ok(vec![workflow]);
        }
        let unknown = || Error::UnknownId {
            kind: "workflow",
            id: id_or_pattern.to_string(),
        };
        let Ok(regex) = regex::Regex::new(&format!("^(?:{id_or_pattern})$")) else {
            return Err(unknown());
        };
        let selected: Vec<&Workflow> = self
            .workflows
            .iter()
            .filter(|wf| regex.is_match(wf.heap().id()))
            .collect();
        if selected.is_empty() {
            return Err(unknown());
        }
        Ok(selected)
    }

    fn execute(
        &self,
        workflow: &Workflow,
        context_path: &str,
        url_provider: Arc<dyn UrlProvider>,
        process_context: Option<ProcessContext>,
    ) -> Result<Vec<ConvertibleNut>> {
        let request = workflow
            .request()
            .context_path(context_path)
            .charset(self.defaults.charset.clone())
            .best_effort(self.defaults.best_effort)
            .url_provider(url_provider)
            .process_context(process_context)
            .build()?;
        workflow.execute(&request)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("workflows", &self.workflows)
            .field("generation", &self.generation)
            .finish()
    }
}
