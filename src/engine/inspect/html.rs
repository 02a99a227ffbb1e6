//! Markup references: `<script src>`, `<link href>`, `<img src>` and inline
//! `<script>`/`<style>` bodies. Commented-out markup is ignored.

use std::ops::Range;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use super::{Fallback, LineInspector, Reference, Target};
use crate::nut::NutType;

static COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());

static SCRIPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b([^>]*)>(.*?)</script\s*>").unwrap());

static STYLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style\b[^>]*>(.*?)</style\s*>").unwrap());

static LINK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<link\b([^>]*)>").unwrap());

static IMG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<img\b([^>]*)>").unwrap());

static ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:^|\s)([a-z-]+)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#).unwrap()
});

/// Whole-document inspector for HTML.
#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlInspector;

/// Value range (absolute) of attribute `name` inside captured attributes.
fn attribute(attrs: &regex::Match<'_>, name: &str) -> Option<(Range<usize>, String)> {
    ATTR.captures_iter(attrs.as_str()).find_map(|caps| {
        let key = caps.get(1)?;
        if !key.as_str().eq_ignore_ascii_case(name) {
            return None;
        }
        let value = caps.get(2).or_else(|| caps.get(3)).or_else(|| caps.get(4))?;
        let start = attrs.start() + value.start();
        Some((start..start + value.len(), value.as_str().to_string()))
    })
}

fn inline(caps: &Captures<'_>, group: usize, nut_type: NutType, offset: usize) -> Option<Reference> {
    let body = caps.get(group)?;
    if body.as_str().trim().is_empty() {
        return None;
    }
    Some(Reference {
        start: offset + body.start(),
        end: offset + body.end(),
        target: Target::Inline {
            nut_type,
            content: body.as_str().to_string(),
        },
        fallback: Fallback::VersionQuery,
    })
}

/// Inline scripts of a non-JavaScript type (templates, JSON data) are left alone.
fn is_script_type(attrs: &regex::Match<'_>) -> bool {
    attribute(attrs, "type").is_none_or(|(_, t)| {
        let t = t.to_ascii_lowercase();
        t.contains("javascript") || t == "module"
    })
}

impl LineInspector for HtmlInspector {
    fn name(&self) -> &str {
        "html"
    }

    fn new_inspection(&mut self) {}

    fn line_based(&self) -> bool {
        false
    }

    fn inspect(&mut self, text: &str, offset: usize) -> Vec<Reference> {
        let comments: Vec<Range<usize>> = COMMENT.find_iter(text).map(|m| m.range()).collect();
        let commented = |pos: usize| comments.iter().any(|r| r.contains(&pos));
        let path = |(range, value): (Range<usize>, String)| {
            Reference::path(offset + range.start, offset + range.end, value)
        };

        let mut refs = Vec::new();
        for caps in SCRIPT.captures_iter(text) {
            let (Some(whole), Some(attrs)) = (caps.get(0), caps.get(1)) else { continue };
            if commented(whole.start()) {
                continue;
            }
            match attribute(&attrs, "src") {
                Some(src) => refs.push(path(src)),
                None if is_script_type(&attrs) => refs.extend(inline(&caps, 2, NutType::Javascript, offset)),
                None => {}
            }
        }
        for caps in STYLE.captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            if !commented(whole.start()) {
                refs.extend(inline(&caps, 1, NutType::Css, offset));
            }
        }
        for (pattern, attr) in [(&*LINK, "href"), (&*IMG, "src")] {
            for caps in pattern.captures_iter(text) {
                let (Some(whole), Some(attrs)) = (caps.get(0), caps.get(1)) else { continue };
                if !commented(whole.start()) {
                    refs.extend(attribute(&attrs, attr).map(path));
                }
            }
        }
        refs.sort_by_key(|r| r.start);
        refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::inspect::collect;

    const PAGE: &str = r#"<html><head>
<link rel="stylesheet" href="css/site.css">
<script src='js/app.js'></script>
<style>body { color: red; }</style>
<!-- <script src="js/old.js"></script> -->
<script type="text/template"><b>{{x}}</b></script>
</head><body><img alt=logo src=img/logo.png><script>var inline = 1;</script></body></html>"#;

    #[test]
    fn test_finds_tag_references() {
        let refs = collect(&mut HtmlInspector, PAGE);
        let described: Vec<String> = refs
            .iter()
            .map(|r| match &r.target {
                Target::Path(p) => {
                    assert_eq!(&PAGE[r.start..r.end], p);
                    format!("path:{p}")
                }
                Target::Inline { nut_type, content } => {
                    assert_eq!(&PAGE[r.start..r.end], content);
                    format!("inline:{}", nut_type.name())
                }
            })
            .collect();
        assert_eq!(
            described,
            vec![
                "path:css/site.css",
                "path:js/app.js",
                "inline:css",
                "path:img/logo.png",
                "inline:js",
            ]
        );
    }

    #[test]
    fn test_empty_inline_ignored() {
        assert!(collect(&mut HtmlInspector, "<script> </script><style></style>").is_empty());
    }
}
