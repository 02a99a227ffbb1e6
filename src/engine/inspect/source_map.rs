//! `sourceMappingURL` comments in scripts and stylesheets.

use std::sync::LazyLock;

use regex::Regex;

use super::{Fallback, LineInspector, Reference, Target};

static SOURCE_MAPPING_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?://|/\*)\s*[#@]\s*sourceMappingURL=([^\s*]+)[^\r\n]*").unwrap()
});

/// Rewrites source map comments; an unresolvable map removes the comment.
#[derive(Debug, Default, Clone, Copy)]
pub struct SourceMapInspector;

impl LineInspector for SourceMapInspector {
    fn name(&self) -> &str {
        "source-map"
    }

    fn new_inspection(&mut self) {}

    fn inspect(&mut self, text: &str, offset: usize) -> Vec<Reference> {
        SOURCE_MAPPING_URL
            .captures_iter(text)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let url = caps.get(1)?;
                Some(Reference {
                    start: offset + url.start(),
                    end: offset + url.end(),
                    target: Target::Path(url.as_str().to_string()),
                    fallback: Fallback::Remove {
                        start: offset + whole.start(),
                        end: offset + whole.end(),
                    },
                })
            })
            .collect()
    }
}
