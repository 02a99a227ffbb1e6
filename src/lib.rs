//! nutflow - an asset pipeline for web resources.
//!
//! Stores resolve paths into nuts, heaps group them, and workflows run each
//! heap through a chain of stages per nut type:
//!
//! ```text
//! Store ──► NutsHeap ──► Workflow ──► cache ─► inspect ─► aggregate ─► minify ─► gzip
//!                                        ▲         │
//!                                        │         └── referenced nuts re-enter the chains
//!                         ContextBuilder (tags, dependency cascade)
//! ```
//!
//! Configuration arrives in batches named by a tag ([`context::ContextBuilder::register`]);
//! a change to one tag frees and purges everything that depends on it.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod logger;
pub mod nut;
pub mod store;
pub mod utils;

pub use config::PipelineConfig;
pub use context::{Context, ContextBuilder, ContextSetting, Facade};
pub use engine::{Category, EngineRequest, Stage, StageKind, StageOrigin, Workflow};
pub use error::{Error, Result};
pub use nut::{ConvertibleNut, Nut, NutType, NutsHeap};
pub use store::{DiskStore, MemoryStore, ProxyStore, Store};
