//! Nut type definitions.

use std::fmt;

/// Type of a nut, decides which chain processes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NutType {
    Javascript,
    Css,
    Html,
    Png,
    Gif,
    Jpeg,
    Svg,
    Ico,
    Woff,
    Woff2,
    Ttf,
    Eot,
    Map,
    Json,
}

impl NutType {
    /// All known types, in declaration order.
    pub const ALL: [NutType; 14] = [
        Self::Javascript,
        Self::Css,
        Self::Html,
        Self::Png,
        Self::Gif,
        Self::Jpeg,
        Self::Svg,
        Self::Ico,
        Self::Woff,
        Self::Woff2,
        Self::Ttf,
        Self::Eot,
        Self::Map,
        Self::Json,
    ];

    /// Detect type from an extension (with or without the dot).
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.extensions().contains(&ext.as_str()))
    }

    /// Detect type from a nut name.
    pub fn from_name(name: &str) -> Option<Self> {
        crate::utils::path::extension(name).and_then(Self::from_extension)
    }

    /// File extensions for this type, preferred first.
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            Self::Javascript => &["js", "mjs"],
            Self::Css => &["css"],
            Self::Html => &["html", "htm"],
            Self::Png => &["png"],
            Self::Gif => &["gif"],
            Self::Jpeg => &["jpg", "jpeg"],
            Self::Svg => &["svg"],
            Self::Ico => &["ico"],
            Self::Woff => &["woff"],
            Self::Woff2 => &["woff2"],
            Self::Ttf => &["ttf"],
            Self::Eot => &["eot"],
            Self::Map => &["map"],
            Self::Json => &["json"],
        }
    }

    /// Preferred extension with its leading dot.
    pub fn extension(self) -> String {
        format!(".{}", self.extensions()[0])
    }

    /// MIME type served for this nut type.
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Javascript => "text/javascript",
            Self::Css => "text/css",
            Self::Html => "text/html",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::Jpeg => "image/jpeg",
            Self::Svg => "image/svg+xml",
            Self::Ico => "image/x-icon",
            Self::Woff => "font/woff",
            Self::Woff2 => "font/woff2",
            Self::Ttf => "font/ttf",
            Self::Eot => "application/vnd.ms-fontobject",
            Self::Map | Self::Json => "application/json",
        }
    }

    /// Whether the content is text (can be scanned, minified, gzipped).
    pub fn is_text(self) -> bool {
        matches!(
            self,
            Self::Javascript | Self::Css | Self::Html | Self::Svg | Self::Map | Self::Json
        )
    }

    /// Display name for this type.
    pub fn name(self) -> &'static str {
        self.extensions()[0]
    }
}

impl fmt::Display for NutType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
