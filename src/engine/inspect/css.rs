//! `url(...)` and `@import "..."` references in stylesheets.

use std::sync::LazyLock;

use regex::Regex;

use super::{LineInspector, Reference};

static URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"url\(\s*(?:"([^"]*)"|'([^']*)'|([^)'"\s]+))\s*\)"#).unwrap()
});

static IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"@import\s+(?:"([^"]*)"|'([^']*)')"#).unwrap());

/// Finds stylesheet references outside `/* ... */` comments.
///
/// Comments may span lines, so the open-comment state is carried over.
#[derive(Debug, Default)]
pub struct CssInspector {
    in_comment: bool,
}

impl CssInspector {
    /// Byte ranges of `line` covered by comments.
    fn comments(&mut self, line: &str) -> Vec<(usize, usize)> {
        let mut spans = Vec::new();
        let mut pos = 0;
        while pos < line.len() {
            if self.in_comment {
                match line[pos..].find("*/") {
                    Some(end) => {
                        spans.push((pos, pos + end + 2));
                        pos += end + 2;
                        self.in_comment = false;
                    }
                    None => {
                        spans.push((pos, line.len()));
                        break;
                    }
                }
            } else {
                match line[pos..].find("/*") {
                    Some(start) => {
                        pos += start;
                        self.in_comment = true;
                        // An empty comment body still needs its opening skipped.
                        spans.push((pos, pos + 2));
                        pos += 2;
                    }
                    None => break,
                }
            }
        }
        spans
    }
}

impl LineInspector for CssInspector {
    fn name(&self) -> &str {
        "css"
    }

    fn new_inspection(&mut self) {
        self.in_comment = false;
    }

    fn inspect(&mut self, text: &str, offset: usize) -> Vec<Reference> {
        let comments = self.comments(text);
        let commented = |pos: usize| comments.iter().any(|&(s, e)| pos >= s && pos < e);

        let mut refs = Vec::new();
        for caps in URL.captures_iter(text).chain(IMPORT.captures_iter(text)) {
            let Some(whole) = caps.get(0) else { continue };
            if commented(whole.start()) {
                continue;
            }
            if let Some(m) = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)) {
                refs.push(Reference::path(offset + m.start(), offset + m.end(), m.as_str()));
            }
        }
        refs.sort_by_key(|r| r.start);
        refs
    }
}
