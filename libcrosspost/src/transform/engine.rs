//! Image normalization with a per-lifetime decode cache
//!
//! A source is decoded at most once per engine. Later requests against the same
//! location reuse the decoded image and only re-apply resize and quality.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::protocol::{TransformRequest, TransformedFile};
use crate::error::TransformError;
use crate::types::ImageMimeType;

struct DecodedSource {
    bytes: Vec<u8>,
    format: ImageMimeType,
    image: DynamicImage,
}

pub struct TransformEngine {
    cache: HashMap<String, DecodedSource>,
    decodes: Arc<AtomicU64>,
}

impl Default for TransformEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformEngine {
    pub fn new() -> Self {
        Self::with_counter(Arc::new(AtomicU64::new(0)))
    }

    /// Create an engine that reports decodes into a shared counter
    pub fn with_counter(decodes: Arc<AtomicU64>) -> Self {
        Self {
            cache: HashMap::new(),
            decodes,
        }
    }

    /// Number of source decodes performed so far
    pub fn decode_count(&self) -> u64 {
        self.decodes.load(Ordering::Relaxed)
    }

    pub fn transform(&mut self, request: &TransformRequest) -> Result<TransformedFile, TransformError> {
        let requested = ImageMimeType::from_mime_str(&request.mime_type)
            .ok_or_else(|| TransformError::UnsupportedType(request.mime_type.clone()))?;

        let source = self.source(request)?;
        let (source_width, source_height) = source.image.dimensions();

        let needs_resize = request.width > 0 && request.width < source_width;
        let needs_quality = request.quality < 100;
        let same_type = requested == source.format;

        if !needs_resize && !needs_quality && same_type {
            tracing::debug!(location = %request.location, "Source already satisfies request");
            return Ok(TransformedFile {
                buffer: source.bytes.clone(),
                mime_type: source.format.as_str().to_string(),
            });
        }

        let image = if needs_resize {
            let height = ((source_height as u64 * request.width as u64) / source_width as u64)
                .max(1) as u32;
            source
                .image
                .resize_exact(request.width, height, FilterType::Lanczos3)
        } else {
            source.image.clone()
        };

        // Without alpha there is nothing a lossless format would preserve, so
        // the output is always JPEG; with alpha it must stay PNG.
        let output = if image.color().has_alpha() {
            ImageMimeType::Png
        } else {
            ImageMimeType::Jpeg
        };

        tracing::debug!(
            location = %request.location,
            from = %source.format,
            to = %output,
            width = image.width(),
            quality = request.quality,
            "Re-encoding image"
        );

        let buffer = encode(&image, output, request.quality).map_err(|e| TransformError::Encode {
            location: request.location.clone(),
            reason: e.to_string(),
        })?;

        Ok(TransformedFile {
            buffer,
            mime_type: output.as_str().to_string(),
        })
    }

    fn source(&mut self, request: &TransformRequest) -> Result<&DecodedSource, TransformError> {
        if !self.cache.contains_key(&request.location) {
            let decoded = self.decode(request)?;
            self.cache.insert(request.location.clone(), decoded);
        }
        self.cache
            .get(&request.location)
            .ok_or_else(|| TransformError::Worker("decode cache lost entry".to_string()))
    }

    fn decode(&self, request: &TransformRequest) -> Result<DecodedSource, TransformError> {
        let bytes = match &request.buffer {
            Some(buffer) => buffer.clone(),
            None => std::fs::read(&request.location).map_err(|e| TransformError::Read {
                location: request.location.clone(),
                reason: e.to_string(),
            })?,
        };

        let decode_error = |reason: String| TransformError::Decode {
            location: request.location.clone(),
            reason,
        };

        let format = image::guess_format(&bytes).map_err(|e| decode_error(e.to_string()))?;
        let format = match format {
            image::ImageFormat::Jpeg => ImageMimeType::Jpeg,
            image::ImageFormat::Png => ImageMimeType::Png,
            image::ImageFormat::Gif => ImageMimeType::Gif,
            image::ImageFormat::WebP => ImageMimeType::WebP,
            other => return Err(TransformError::UnsupportedType(format!("{:?}", other))),
        };

        let image = image::load_from_memory_with_format(&bytes, format.image_format())
            .map_err(|e| decode_error(e.to_string()))?;

        self.decodes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(location = %request.location, format = %format, "Decoded source");

        Ok(DecodedSource {
            bytes,
            format,
            image,
        })
    }
}

fn encode(image: &DynamicImage, format: ImageMimeType, quality: u8) -> image::ImageResult<Vec<u8>> {
    let mut buffer = Vec::new();
    match format {
        ImageMimeType::Jpeg => {
            let rgb = image.to_rgb8();
            let mut encoder =
                image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100));
            encoder.encode_image(&rgb)?;
        }
        other => {
            image.write_to(&mut Cursor::new(&mut buffer), other.image_format())?;
        }
    }
    Ok(buffer)
}
