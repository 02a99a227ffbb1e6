//! Shared helpers.
//!
//! - [`hash`]: content versions, version combination, FxHash
//! - [`path`]: `/`-separated nut path manipulation
//! - [`schedule`]: periodic tasks on dedicated threads

pub mod hash;
pub mod path;
pub mod schedule;
