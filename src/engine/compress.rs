//! Gzip compression stage for text nuts.

use std::io::Write;
use std::sync::Arc;

use flate2::Compression;
use flate2::write::GzEncoder;

use super::EngineRequest;
use crate::error::{Error, Result};
use crate::nut::{ConvertibleNut, TransformContext, Transformer};

/// Gzips text nuts and flags them as compressed.
#[derive(Debug)]
pub struct Compressor {
    enabled: bool,
}

impl Compressor {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn works(&self) -> bool {
        self.enabled
    }

    pub(crate) fn run(&self, request: &EngineRequest, mut nuts: Vec<ConvertibleNut>) -> Vec<ConvertibleNut> {
        let transformer = request.timed(Arc::new(Gzip));
        for nut in nuts.iter_mut().filter(|n| n.nut_type().is_text() && !n.is_compressed()) {
            nut.add_transformer(Arc::clone(&transformer));
            nut.set_compressed(true);
        }
        nuts
    }
}

struct Gzip;

impl Transformer for Gzip {
    fn name(&self) -> &str {
        "gzip"
    }

    fn transform(&self, input: Vec<u8>, cx: &mut TransformContext<'_>) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(input.len() / 2), Compression::default());
        encoder
            .write_all(&input)
            .and_then(|_| encoder.finish())
            .map_err(|e| Error::io(cx.name(), e))
    }
}
