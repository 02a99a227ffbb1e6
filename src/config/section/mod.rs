//! Configuration section definitions.
//!
//! Each module corresponds to a section in `nutflow.toml`:
//!
//! | Module    | TOML Section | Purpose                                  |
//! |-----------|--------------|------------------------------------------|
//! | `engine`  | `[engine]`   | Built-in stage switches                  |
//! | `cache`   | `[cache]`    | Result cache and scheduled clearing      |
//! | `store`   | `[store]`    | Polling and versioning of default stores |
//! | `request` | `[request]`  | Charset and URL context path             |

mod cache;
mod engine;
mod request;
mod store;

pub use cache::CacheSectionConfig;
pub use engine::EngineSectionConfig;
pub use request::RequestSectionConfig;
pub use store::StoreSectionConfig;
