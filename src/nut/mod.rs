//! Nut data model.
//!
//! - [`Nut`]: immutable named, typed, versioned content
//! - [`ConvertibleNut`]: transformation layer attached by stages
//! - [`NutsHeap`]: lazily resolved groups of nuts
//! - [`Version`]: memoized asynchronous version numbers

mod convertible;
mod heap;
mod kind;
mod resource;
mod source_map;
mod version;

pub use convertible::{ConvertibleNut, OnReady, TransformContext, Transformer};
pub use heap::{HeapBuilder, HeapListener, NutsHeap, StoreRef};
pub use kind::NutType;
pub use resource::{Nut, Opener};
pub use source_map::SourceMap;
pub use version::{Version, VersionCallback, VersionFn, VersionStrategy};
