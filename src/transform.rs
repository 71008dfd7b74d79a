//! Transform dispatch and the default image transformer
//!
//! The pipeline only talks to the [`Transformer`] trait. Explicit transforms
//! requested through the path are mandatory: their errors reach the client.
//! Format conversion is used by content negotiation, which falls back to the
//! original bytes on failure.

use crate::error::{EdgeError, Result};
use crate::models::TransformOptions;
use async_trait::async_trait;
use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use std::io::Cursor;
use std::sync::Arc;
use tracing::debug;

/// Largest width or height a transform may produce
pub const MAX_OUTPUT_DIMENSION: u32 = 8192;

/// Target formats for negotiated re-encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    WebP,
    Png,
    Jpeg,
}

impl OutputFormat {
    fn image_format(self) -> ImageFormat {
        match self {
            OutputFormat::WebP => ImageFormat::WebP,
            OutputFormat::Png => ImageFormat::Png,
            OutputFormat::Jpeg => ImageFormat::Jpeg,
        }
    }
}

/// External pixel-level transform capability
#[async_trait]
pub trait Transformer: Send + Sync {
    /// Apply an explicit transform (crop, resize, ...)
    async fn transform(&self, bytes: Bytes, options: &TransformOptions) -> Result<Bytes>;

    /// Re-encode the image into another format
    async fn convert(&self, bytes: Bytes, format: OutputFormat) -> Result<Bytes>;
}

/// Stateless boundary between the cache and the transform capability
#[derive(Clone)]
pub struct TransformDispatcher {
    transformer: Arc<dyn Transformer>,
}

impl TransformDispatcher {
    pub fn new(transformer: Arc<dyn Transformer>) -> Self {
        TransformDispatcher { transformer }
    }

    pub fn transformer(&self) -> &Arc<dyn Transformer> {
        &self.transformer
    }

    /// Run the requested transform, or pass the bytes through untouched
    pub async fn dispatch(&self, bytes: Bytes, options: Option<&TransformOptions>) -> Result<Bytes> {
        match options {
            Some(options) => {
                debug!("Dispatching transform option={}", options.option);
                self.transformer.transform(bytes, options).await
            }
            None => Ok(bytes),
        }
    }
}

/// One parsed step of a transform option string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Scale to the given width, keeping the aspect ratio
    Width(u32),
    /// Scale to the given height, keeping the aspect ratio
    Height(u32),
    /// Scale to fit inside the box, keeping the aspect ratio
    Fit { width: u32, height: u32 },
    /// Crop a region; without offsets the region is centred
    Crop {
        width: u32,
        height: u32,
        offset: Option<(u32, u32)>,
    },
}

/// Parse an option string such as `resize200`, `crop100x80+10+5` or
/// `w300,h200`
///
/// Tokens are separated by `,` or `_` and applied left to right.
pub fn parse_operations(option: &str) -> Result<Vec<Operation>> {
    let ops = option
        .split([',', '_'])
        .filter(|token| !token.is_empty())
        .map(parse_token)
        .collect::<Result<Vec<_>>>()?;

    if ops.is_empty() {
        return Err(EdgeError::Transform(format!(
            "No transform operations in '{}'",
            option
        )));
    }
    Ok(ops)
}

fn parse_token(token: &str) -> Result<Operation> {
    let unsupported = || EdgeError::Transform(format!("Unsupported transform option '{}'", token));

    if let Some(rest) = token.strip_prefix("resize") {
        return match rest.split_once('x') {
            Some((w, h)) => Ok(Operation::Fit {
                width: parse_dimension(w, token)?,
                height: parse_dimension(h, token)?,
            }),
            None => Ok(Operation::Width(parse_dimension(rest, token)?)),
        };
    }

    if let Some(rest) = token.strip_prefix("crop") {
        let mut parts = rest.split('+');
        let (w, h) = parts
            .next()
            .and_then(|size| size.split_once('x'))
            .ok_or_else(unsupported)?;
        let offset = match (parts.next(), parts.next()) {
            (Some(x), Some(y)) => Some((parse_offset(x, token)?, parse_offset(y, token)?)),
            (None, None) => None,
            _ => return Err(unsupported()),
        };
        if parts.next().is_some() {
            return Err(unsupported());
        }
        return Ok(Operation::Crop {
            width: parse_dimension(w, token)?,
            height: parse_dimension(h, token)?,
            offset,
        });
    }

    if let Some(rest) = token.strip_prefix('w') {
        return Ok(Operation::Width(parse_dimension(rest, token)?));
    }

    if let Some(rest) = token.strip_prefix('h') {
        return Ok(Operation::Height(parse_dimension(rest, token)?));
    }

    Err(unsupported())
}

fn parse_dimension(value: &str, token: &str) -> Result<u32> {
    match value.parse::<u32>() {
        Ok(n) if (1..=MAX_OUTPUT_DIMENSION).contains(&n) => Ok(n),
        _ => Err(EdgeError::Transform(format!(
            "Invalid dimension '{}' in '{}' (must be 1..={})",
            value, token, MAX_OUTPUT_DIMENSION
        ))),
    }
}

fn parse_offset(value: &str, token: &str) -> Result<u32> {
    value
        .parse::<u32>()
        .map_err(|_| EdgeError::Transform(format!("Invalid offset '{}' in '{}'", value, token)))
}

/// Default transformer backed by the `image` crate
///
/// Decoding and encoding run on the blocking thread pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageTransformer;

impl ImageTransformer {
    pub fn new() -> Self {
        ImageTransformer
    }

    fn apply(bytes: &[u8], ops: &[Operation]) -> Result<Vec<u8>> {
        let source_format = image::guess_format(bytes)
            .map_err(|e| EdgeError::Transform(format!("Unrecognized image data: {}", e)))?;
        let mut img = image::load_from_memory_with_format(bytes, source_format)
            .map_err(|e| EdgeError::Transform(format!("Failed to decode image: {}", e)))?;

        for op in ops {
            img = apply_operation(img, *op)?;
        }

        let target = if source_format.writing_enabled() {
            source_format
        } else {
            ImageFormat::Png
        };
        encode(img, target)
    }

    fn reencode(bytes: &[u8], format: OutputFormat) -> Result<Vec<u8>> {
        let img = image::load_from_memory(bytes)
            .map_err(|e| EdgeError::Transform(format!("Failed to decode image: {}", e)))?;
        encode(img, format.image_format())
    }
}

fn apply_operation(img: DynamicImage, op: Operation) -> Result<DynamicImage> {
    let (img_w, img_h) = img.dimensions();
    Ok(match op {
        Operation::Width(width) => {
            let height = scaled(img_h, width, img_w);
            check_output(width, height)?;
            img.resize_exact(width, height, FilterType::Lanczos3)
        }
        Operation::Height(height) => {
            let width = scaled(img_w, height, img_h);
            check_output(width, height)?;
            img.resize_exact(width, height, FilterType::Lanczos3)
        }
        Operation::Fit { width, height } => img.resize(width, height, FilterType::Lanczos3),
        Operation::Crop {
            width,
            height,
            offset,
        } => {
            let (x, y) = offset.unwrap_or((
                img_w.saturating_sub(width) / 2,
                img_h.saturating_sub(height) / 2,
            ));
            if x >= img_w || y >= img_h {
                return Err(EdgeError::Transform(format!(
                    "Crop origin {}x{} outside image {}x{}",
                    x, y, img_w, img_h
                )));
            }
            img.crop_imm(x, y, width.min(img_w - x), height.min(img_h - y))
        }
    })
}

fn check_output(width: u32, height: u32) -> Result<()> {
    if width > MAX_OUTPUT_DIMENSION || height > MAX_OUTPUT_DIMENSION {
        return Err(EdgeError::Transform(format!(
            "Output {}x{} exceeds {}px per side",
            width, height, MAX_OUTPUT_DIMENSION
        )));
    }
    Ok(())
}

/// `value * numerator / denominator`, never below one pixel
fn scaled(value: u32, numerator: u32, denominator: u32) -> u32 {
    let result = (value as u64 * numerator as u64) / (denominator.max(1) as u64);
    result.clamp(1, u32::MAX as u64) as u32
}

fn encode(img: DynamicImage, format: ImageFormat) -> Result<Vec<u8>> {
    // WebP and JPEG encoders only take 8-bit RGB(A)
    let img = match format {
        ImageFormat::WebP => DynamicImage::ImageRgba8(img.to_rgba8()),
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(img.to_rgb8()),
        _ => img,
    };

    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, format)
        .map_err(|e| EdgeError::Transform(format!("Failed to encode {:?}: {}", format, e)))?;
    Ok(out.into_inner())
}

#[async_trait]
impl Transformer for ImageTransformer {
    async fn transform(&self, bytes: Bytes, options: &TransformOptions) -> Result<Bytes> {
        let ops = parse_operations(&options.option)?;
        tokio::task::spawn_blocking(move || Self::apply(&bytes, &ops))
            .await
            .map_err(|e| EdgeError::Transform(format!("Transform task failed: {}", e)))?
            .map(Bytes::from)
    }

    async fn convert(&self, bytes: Bytes, format: OutputFormat) -> Result<Bytes> {
        tokio::task::spawn_blocking(move || Self::reencode(&bytes, format))
            .await
            .map_err(|e| EdgeError::Transform(format!("Convert task failed: {}", e)))?
            .map(Bytes::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn png_fixture(width: u32, height: u32) -> Bytes {
        let img = RgbaImage::from_pixel(width, height, Rgba([200, 10, 10, 255]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        Bytes::from(out.into_inner())
    }

    #[test]
    fn test_parse_resize_width() {
        assert_eq!(parse_operations("resize200").unwrap(), vec![Operation::Width(200)]);
    }

    #[test]
    fn test_parse_combined_tokens() {
        let ops = parse_operations("crop100x80+10+5,w50").unwrap();
        assert_eq!(
            ops,
            vec![
                Operation::Crop {
                    width: 100,
                    height: 80,
                    offset: Some((10, 5)),
                },
                Operation::Width(50),
            ]
        );

        let ops = parse_operations("resize40x30_h10").unwrap();
        assert_eq!(
            ops,
            vec![
                Operation::Fit {
                    width: 40,
                    height: 30
                },
                Operation::Height(10),
            ]
        );
    }

    #[test]
    fn test_parse_rejects_unknown_and_zero() {
        assert!(parse_operations("sepia").is_err());
        assert!(parse_operations("resize0").is_err());
        assert!(parse_operations("crop10x10+5").is_err());
        assert!(parse_operations("").is_err());
    }

    #[test]
    fn test_parse_rejects_oversized_dimensions() {
        assert!(parse_operations("w100000").is_err());
        assert!(parse_operations("resize8193").is_err());
        assert!(parse_operations("crop9000x10").is_err());
        assert_eq!(
            parse_operations("w8192").unwrap(),
            vec![Operation::Width(MAX_OUTPUT_DIMENSION)]
        );
    }

    #[tokio::test]
    async fn test_derived_dimension_is_capped() {
        // 4096 wide on a 1x4 strip would need a 16384px height
        let transformer = ImageTransformer::new();
        let err = transformer
            .transform(png_fixture(1, 4), &TransformOptions::new("w4096"))
            .await
            .unwrap_err();
        assert!(matches!(err, EdgeError::Transform(msg) if msg.contains("exceeds")));
    }

    #[tokio::test]
    async fn test_dispatch_without_options_is_passthrough() {
        let dispatcher = TransformDispatcher::new(Arc::new(ImageTransformer::new()));
        let bytes = Bytes::from_static(b"not an image");
        let out = dispatcher.dispatch(bytes.clone(), None).await.unwrap();
        assert_eq!(out, bytes);
    }

    #[tokio::test]
    async fn test_resize_keeps_aspect_and_format() {
        let transformer = ImageTransformer::new();
        let out = transformer
            .transform(png_fixture(40, 20), &TransformOptions::new("resize20"))
            .await
            .unwrap();

        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::Png);
        let img = image::load_from_memory(&out).unwrap();
        assert_eq!(img.dimensions(), (20, 10));
    }

    #[tokio::test]
    async fn test_center_crop() {
        let transformer = ImageTransformer::new();
        let out = transformer
            .transform(png_fixture(40, 20), &TransformOptions::new("crop10x10"))
            .await
            .unwrap();
        let img = image::load_from_memory(&out).unwrap();
        assert_eq!(img.dimensions(), (10, 10));
    }

    #[tokio::test]
    async fn test_transform_rejects_non_image() {
        let transformer = ImageTransformer::new();
        let result = transformer
            .transform(Bytes::from_static(b"plain text"), &TransformOptions::new("w10"))
            .await;
        assert!(matches!(result, Err(EdgeError::Transform(_))));
    }

    #[tokio::test]
    async fn test_convert_to_webp() {
        let transformer = ImageTransformer::new();
        let out = transformer
            .convert(png_fixture(8, 8), OutputFormat::WebP)
            .await
            .unwrap();
        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::WebP);
    }
}
