//! Context snapshot with atomic replacement.
//!
//! Uses `arc-swap` for lock-free reads. A stale snapshot is rebuilt on the
//! next access; when the rebuild fails the previous snapshot stays in effect.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use super::{Context, ContextBuilder, ContextSetting};
use crate::config::PipelineConfig;
use crate::engine::{ProcessContext, UrlProvider};
use crate::error::Result;
use crate::log;
use crate::nut::ConvertibleNut;
use crate::utils::hash;

/// Owns a [`ContextBuilder`] and the current [`Context`].
pub struct Facade {
    builder: ContextBuilder,
    context: ArcSwap<Context>,
    rebuilding: Mutex<()>,
    /// Hash of the last loaded config file content.
    config_hash: AtomicU64,
}

impl Facade {
    /// Build the first snapshot. Fails if it cannot be built.
    pub fn new(builder: ContextBuilder) -> Result<Self> {
        let context = builder.build()?;
        Ok(Self {
            builder,
            context: ArcSwap::from_pointee(context),
            rebuilding: Mutex::new(()),
            config_hash: AtomicU64::new(0),
        })
    }

    /// Builder with the built-in stages configured from `config`.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let builder = ContextBuilder::new();
        builder.configure_default(config)?;
        Self::new(builder)
    }

    pub fn builder(&self) -> &ContextBuilder {
        &self.builder
    }

    /// Current snapshot, rebuilt first if a registration changed.
    pub fn context(&self) -> Arc<Context> {
        let current = self.context.load_full();
        if current.is_up_to_date() {
            return current;
        }

        let _guard = self.rebuilding.lock();
        let current = self.context.load_full();
        if current.is_up_to_date() {
            return current;
        }
        match self.builder.build() {
            Ok(context) => {
                let context = Arc::new(context);
                self.context.store(Arc::clone(&context));
                context
            }
            Err(e) => {
                log!("error"; "rebuild failed, keeping previous context: {}", e);
                current
            }
        }
    }

    /// Register and rebuild eagerly, so configuration errors surface here.
    ///
    /// On a build error the registration stays and the previous snapshot is
    /// kept until a later change builds again.
    pub fn register(&self, tag: &str, setting: ContextSetting) -> Result<()> {
        self.builder.register(tag, setting)?;
        self.rebuild()
    }

    pub fn clear(&self, tag: &str) -> Result<bool> {
        let cleared = self.builder.clear(tag);
        self.rebuild()?;
        Ok(cleared)
    }

    fn rebuild(&self) -> Result<()> {
        let _guard = self.rebuilding.lock();
        let context = self.builder.build()?;
        self.context.store(Arc::new(context));
        Ok(())
    }

    /// Reload `path` if its content changed since the last call.
    ///
    /// Returns `Ok(true)` if the built-in stages were reconfigured.
    pub fn reload_config(&self, path: &Path) -> anyhow::Result<bool> {
        let content = std::fs::read_to_string(path)?;
        let new_hash = hash::compute(content.as_bytes());
        if new_hash == self.config_hash.load(Ordering::Relaxed) {
            return Ok(false);
        }

        let config = PipelineConfig::load(path)?;
        self.builder.configure_default(&config)?;
        self.rebuild()?;
        self.config_hash.store(new_hash, Ordering::Relaxed);
        Ok(true)
    }

    pub fn workflow_ids(&self) -> Vec<String> {
        self.context().workflow_ids().map(str::to_string).collect()
    }

    pub fn run_workflow(
        &self,
        workflow_id: &str,
        process_context: Option<ProcessContext>,
    ) -> Result<Vec<ConvertibleNut>> {
        self.context().run_workflow(workflow_id, process_context)
    }

    pub fn process(
        &self,
        context_path: &str,
        workflow_id_or_pattern: &str,
        url_provider: Arc<dyn UrlProvider>,
        process_context: Option<ProcessContext>,
    ) -> Result<Vec<ConvertibleNut>> {
        self.context()
            .process(context_path, workflow_id_or_pattern, url_provider, process_context)
    }
}
