//! Minification stage for JavaScript and CSS.
//!
//! Uses oxc for JavaScript and lightningcss for CSS. Content that fails to
//! parse is delivered unchanged.

use std::sync::Arc;

use lightningcss::stylesheet::{ParserOptions, PrinterOptions, StyleSheet};
use oxc::allocator::Allocator;
use oxc::codegen::{Codegen, CodegenOptions, CommentOptions};
use oxc::mangler::MangleOptions;
use oxc::minifier::{CompressOptions, Minifier as OxcMinifier, MinifierOptions};
use oxc::parser::Parser;
use oxc::span::SourceType;

use super::EngineRequest;
use crate::debug;
use crate::error::Result;
use crate::nut::{ConvertibleNut, NutType, TransformContext, Transformer};

/// Minified text of `source`, or `None` if it does not parse or the type
/// has no minifier.
pub fn minify(nut_type: NutType, source: &str) -> Option<String> {
    match nut_type {
        NutType::Javascript => script(source),
        NutType::Css => stylesheet(source),
        _ => None,
    }
}

fn script(source: &str) -> Option<String> {
    let allocator = Allocator::default();
    let parsed = Parser::new(&allocator, source, SourceType::mjs()).parse();
    if !parsed.errors.is_empty() {
        return None;
    }
    let mut program = parsed.program;
    let minified = OxcMinifier::new(MinifierOptions {
        mangle: Some(MangleOptions::default()),
        compress: Some(CompressOptions::smallest()),
    })
    .minify(&allocator, &mut program);

    let codegen = CodegenOptions {
        minify: true,
        comments: CommentOptions::disabled(),
        ..CodegenOptions::default()
    };
    Some(
        Codegen::new()
            .with_options(codegen)
            .with_scoping(minified.scoping)
            .build(&program)
            .code,
    )
}

fn stylesheet(source: &str) -> Option<String> {
    let sheet = StyleSheet::parse(source, ParserOptions::default()).ok()?;
    let printer = PrinterOptions {
        minify: true,
        ..PrinterOptions::default()
    };
    sheet.to_css(printer).ok().map(|out| out.code)
}

/// Registers a minifying transformer on script and style nuts.
#[derive(Debug)]
pub struct Minifier {
    enabled: bool,
}

impl Minifier {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn works(&self) -> bool {
        self.enabled
    }

    pub(crate) fn run(&self, request: &EngineRequest, mut nuts: Vec<ConvertibleNut>) -> Vec<ConvertibleNut> {
        let transformer = request.timed(Arc::new(Minify));
        for nut in &mut nuts {
            if matches!(nut.nut_type(), NutType::Javascript | NutType::Css) {
                nut.add_transformer(Arc::clone(&transformer));
            }
        }
        nuts
    }
}

struct Minify;

impl Transformer for Minify {
    fn name(&self) -> &str {
        "minify"
    }

    fn transform(&self, input: Vec<u8>, cx: &mut TransformContext<'_>) -> Result<Vec<u8>> {
        let Ok(source) = std::str::from_utf8(&input) else {
            return Ok(input);
        };
        match minify(cx.nut_type(), source) {
            Some(code) => Ok(code.into_bytes()),
            None => {
                debug!("minify"; "keeping {} unminified (parse failed)", cx.name());
                Ok(input)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nut::Nut;

    #[test]
    fn test_minify_script() {
        let out = minify(
            NutType::Javascript,
            "function add(first, second) {\n  return first + second;\n}\n",
        )
        .unwrap();
        assert!(out.len() < 50);
        assert!(!out.contains('\n') || out.trim_end().lines().count() == 1);
    }

    #[test]
    fn test_minify_stylesheet() {
        let out = minify(NutType::Css, "body {\n  color: #ff0000;\n  margin: 0px;\n}\n").unwrap();
        assert_eq!(out, "body{color:red;margin:0}");
    }

    #[test]
    fn test_invalid_input_kept() {
        assert!(minify(NutType::Javascript, "function (").is_none());
        assert!(minify(NutType::Png, "body{}").is_none());
        let mut nut = ConvertibleNut::new(Nut::from_bytes(
            "broken.js",
            NutType::Javascript,
            b"function (".to_vec(),
        ));
        nut.add_transformer(Arc::new(Minify));
        assert_eq!(nut.transform(Vec::new()).unwrap(), b"function (");
    }
}
