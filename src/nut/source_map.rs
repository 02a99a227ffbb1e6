//! Position to original-nut tables for aggregated content.

use serde::Serialize;

/// Ordered table mapping line ranges of a generated nut to its sources.
///
/// Serialized as an index-style source map:
///
/// ```json
/// {"version":3,"file":"aggregate.js","sources":["a.js","b.js"],
///  "sections":[{"offset":{"line":0,"column":0},"source":"a.js"}, ...]}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceMap {
    version: u8,
    file: String,
    sources: Vec<String>,
    sections: Vec<Section>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct Section {
    offset: Offset,
    source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
struct Offset {
    line: usize,
    column: usize,
}

impl SourceMap {
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            version: 3,
            file: file.into(),
            sources: Vec::new(),
            sections: Vec::new(),
        }
    }

    /// Record that `source` starts at zero-based `line` and `column`.
    pub fn push(&mut self, line: usize, column: usize, source: impl Into<String>) {
        let source = source.into();
        if !self.sources.contains(&source) {
            self.sources.push(source.clone());
        }
        self.sections.push(Section {
            offset: Offset { line, column },
            source,
        });
    }

    /// Section start for every byte offset of `parts` in `text`.
    pub fn from_parts<'a>(
        file: impl Into<String>,
        text: &[u8],
        parts: impl IntoIterator<Item = (usize, &'a str)>,
    ) -> Self {
        let mut map = Self::new(file);
        let (mut line, mut column, mut cursor) = (0, 0, 0);
        for (start, source) in parts {
            for &b in &text[cursor..start.min(text.len())] {
                if b == b'\n' {
                    line += 1;
                    column = 0;
                } else {
                    column += 1;
                }
            }
            cursor = start.min(text.len()).max(cursor);
            map.push(line, column, source);
        }
        map
    }

    /// Original nut owning the zero-based position.
    pub fn source_at(&self, line: usize, column: usize) -> Option<&str> {
        self.sections
            .iter()
            .rev()
            .find(|s| (s.offset.line, s.offset.column) <= (line, column))
            .map(|s| s.source.as_str())
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_at() {
        let mut map = SourceMap::new("aggregate.js");
        map.push(0, 0, "a.js");
        map.push(3, 0, "b.js");

        assert_eq!(map.source_at(0, 0), Some("a.js"));
        assert_eq!(map.source_at(2, 40), Some("a.js"));
        assert_eq!(map.source_at(3, 0), Some("b.js"));
        assert_eq!(map.source_at(99, 0), Some("b.js"));
        assert_eq!(map.sources(), &["a.js".to_string(), "b.js".to_string()]);
    }

    #[test]
    fn test_from_parts_tracks_columns() {
        let text = b"var a;\nvar b;var c;";
        let map = SourceMap::from_parts("aggregate.js", text, [(0, "a.js"), (7, "b.js"), (13, "c.js")]);
        assert_eq!(map.source_at(0, 3), Some("a.js"));
        assert_eq!(map.source_at(1, 2), Some("b.js"));
        assert_eq!(map.source_at(1, 6), Some("c.js"));
    }

    #[test]
    fn test_json_shape() {
        let mut map = SourceMap::new("aggregate.css");
        map.push(0, 0, "a.css");
        let value: serde_json::Value = serde_json::from_str(&map.to_json()).unwrap();
        assert_eq!(value["version"], 3);
        assert_eq!(value["file"], "aggregate.css");
        assert_eq!(value["sources"][0], "a.css");
        assert_eq!(value["sections"][0]["offset"]["line"], 0);
    }
}
