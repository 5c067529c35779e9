//! The transformation producer: decode, resize, sharpen, encode

use crate::error::{ImageServerError, Result};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader};
use std::collections::BTreeMap;
use std::io::Cursor;

/// Maximum frame dimensions and area
#[derive(Debug, Clone, Copy)]
pub struct FrameLimit {
    pub width: u32,
    pub height: u32,
    pub megapixels: f64,
}

impl FrameLimit {
    fn check(&self, what: &str, width: u32, height: u32) -> Result<()> {
        let megapixels = f64::from(width) * f64::from(height) / 1_000_000.0;
        if width > self.width || height > self.height || megapixels > self.megapixels {
            return Err(ImageServerError::Limit(format!(
                "{} frame {}x{} exceeds {}x{} / {} MP",
                what, width, height, self.width, self.height, self.megapixels
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub decode: FrameLimit,
    pub encode: FrameLimit,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            decode: FrameLimit {
                width: 8000,
                height: 8000,
                megapixels: 40.0,
            },
            encode: FrameLimit {
                width: 8000,
                height: 8000,
                megapixels: 20.0,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitMode {
    /// Fit within the box, never upscale
    Max,
    /// Fill the box, cropping overflow
    Crop,
    /// Ignore aspect ratio
    Stretch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Png,
    Jpeg,
    WebP,
}

impl OutputFormat {
    fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "png" => Ok(OutputFormat::Png),
            "jpg" | "jpeg" => Ok(OutputFormat::Jpeg),
            "webp" => Ok(OutputFormat::WebP),
            other => Err(ImageServerError::BadRequest(format!(
                "unsupported format '{}'",
                other
            ))),
        }
    }

    fn from_source(format: Option<ImageFormat>) -> Self {
        match format {
            Some(ImageFormat::Jpeg) => OutputFormat::Jpeg,
            Some(ImageFormat::WebP) => OutputFormat::WebP,
            _ => OutputFormat::Png,
        }
    }
}

/// Parsed transformation commands
#[derive(Debug, Clone, PartialEq)]
pub struct TransformOptions {
    pub passthrough: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub mode: FitMode,
    pub format: Option<OutputFormat>,
    pub quality: u8,
    pub sharpen: f32,
    pub filter: FilterType,
}

impl TransformOptions {
    pub fn from_commands(commands: &BTreeMap<String, String>, transforms: bool) -> Result<Self> {
        let width = parse_dimension(commands, "width")?;
        let height = parse_dimension(commands, "height")?;

        let mode = match commands.get("mode").map(|m| m.to_ascii_lowercase()) {
            None => FitMode::Max,
            Some(m) if m == "max" || m == "pad" => FitMode::Max,
            Some(m) if m == "crop" => FitMode::Crop,
            Some(m) if m == "stretch" => FitMode::Stretch,
            Some(m) => {
                return Err(ImageServerError::BadRequest(format!("unsupported mode '{}'", m)))
            }
        };

        let format = commands
            .get("format")
            .map(|f| OutputFormat::parse(f))
            .transpose()?;

        let quality = match commands.get("quality") {
            Some(q) => q
                .parse::<u8>()
                .ok()
                .filter(|q| (1..=100).contains(q))
                .ok_or_else(|| ImageServerError::BadRequest(format!("invalid quality '{}'", q)))?,
            None => 90,
        };

        let sharpen = match commands.get("f.sharpen") {
            Some(s) => s
                .parse::<f32>()
                .ok()
                .filter(|s| (0.0..=100.0).contains(s))
                .ok_or_else(|| ImageServerError::BadRequest(format!("invalid f.sharpen '{}'", s)))?,
            None => 0.0,
        };

        let filter = match commands.get("down.filter").map(|f| f.to_ascii_lowercase()) {
            Some(f) if f == "lanczos" || f.starts_with("robidoux") => FilterType::Lanczos3,
            Some(f) if f == "triangle" || f == "linear" => FilterType::Triangle,
            Some(f) if f == "box" || f == "nearest" => FilterType::Nearest,
            Some(f) if f == "gaussian" => FilterType::Gaussian,
            _ => FilterType::CatmullRom,
        };

        Ok(Self {
            passthrough: !transforms,
            width,
            height,
            mode,
            format,
            quality,
            sharpen,
            filter,
        })
    }
}

fn parse_dimension(commands: &BTreeMap<String, String>, key: &str) -> Result<Option<u32>> {
    commands
        .get(key)
        .map(|v| {
            v.parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ImageServerError::BadRequest(format!("invalid {} '{}'", key, v)))
        })
        .transpose()
}

/// Target size for `mode`, or `None` when no resize is needed
fn target_size(src: (u32, u32), options: &TransformOptions) -> Option<(u32, u32)> {
    let (sw, sh) = src;
    let (w, h) = match (options.width, options.height) {
        (None, None) => return None,
        (Some(w), Some(h)) => (w, h),
        (Some(w), None) => (w, scale(sh, w, sw)),
        (None, Some(h)) => (scale(sw, h, sh), h),
    };
    if options.mode == FitMode::Max && w >= sw && h >= sh {
        return None;
    }
    Some((w, h))
}

fn scale(value: u32, num: u32, den: u32) -> u32 {
    ((u64::from(value) * u64::from(num) + u64::from(den) / 2) / u64::from(den.max(1))).max(1) as u32
}

/// Apply `options` to `source`. CPU-bound; run on a blocking thread.
pub fn transform(source: &[u8], options: &TransformOptions, limits: &Limits) -> Result<Bytes> {
    if options.passthrough {
        return Ok(Bytes::copy_from_slice(source));
    }

    let reader = ImageReader::new(Cursor::new(source)).with_guessed_format()?;
    let source_format = reader.format();
    let (sw, sh) = reader.into_dimensions()?;
    limits.decode.check("decode", sw, sh)?;

    let mut img = ImageReader::new(Cursor::new(source))
        .with_guessed_format()?
        .decode()?;

    if let Some((w, h)) = target_size((sw, sh), options) {
        let (ew, eh) = match options.mode {
            FitMode::Max => fit_within((sw, sh), (w, h)),
            FitMode::Crop | FitMode::Stretch => (w, h),
        };
        limits.encode.check("encode", ew, eh)?;

        img = match options.mode {
            FitMode::Max => img.resize(w, h, options.filter),
            FitMode::Crop => img.resize_to_fill(w, h, options.filter),
            FitMode::Stretch => img.resize_exact(w, h, options.filter),
        };
    } else {
        limits.encode.check("encode", sw, sh)?;
    }

    if options.sharpen > 0.0 {
        img = img.unsharpen(options.sharpen / 20.0, 1);
    }

    let format = options
        .format
        .unwrap_or_else(|| OutputFormat::from_source(source_format));
    encode(img, format, options.quality)
}

fn fit_within(src: (u32, u32), bounds: (u32, u32)) -> (u32, u32) {
    let (sw, sh) = src;
    let (bw, bh) = bounds;
    if u64::from(bw) * u64::from(sh) <= u64::from(bh) * u64::from(sw) {
        (bw, scale(sh, bw, sw))
    } else {
        (scale(sw, bh, sh), bh)
    }
}

fn encode(img: DynamicImage, format: OutputFormat, quality: u8) -> Result<Bytes> {
    let mut out = Vec::new();
    match format {
        OutputFormat::Png => {
            img.write_with_encoder(PngEncoder::new(&mut out))?;
        }
        OutputFormat::Jpeg => {
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality))?;
        }
        OutputFormat::WebP => {
            let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
            rgba.write_with_encoder(WebPEncoder::new_lossless(&mut out))?;
        }
    }
    Ok(Bytes::from(out))
}

/// MIME type sniffed from encoded bytes
pub fn content_type(bytes: &[u8]) -> &'static str {
    image::guess_format(bytes)
        .map(|f| f.to_mime_type())
        .unwrap_or("application/octet-stream")
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, RgbImage};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| image::Rgb([x as u8, y as u8, 128]));
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_with_encoder(PngEncoder::new(&mut out))
            .unwrap();
        out
    }

    fn options(query: &[(&str, &str)]) -> TransformOptions {
        let commands: BTreeMap<String, String> = query
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TransformOptions::from_commands(&commands, !commands.is_empty()).unwrap()
    }

    #[test]
    fn test_resize_max_keeps_aspect_ratio() {
        let out = transform(&png(200, 100), &options(&[("width", "50")]), &Limits::default()).unwrap();
        let img = image::load_from_memory(&out).unwrap();
        assert_eq!(img.dimensions(), (50, 25));
        assert_eq!(content_type(&out), "image/png");
    }

    #[test]
    fn test_max_mode_never_upscales() {
        let out = transform(&png(40, 20), &options(&[("width", "400")]), &Limits::default()).unwrap();
        let img = image::load_from_memory(&out).unwrap();
        assert_eq!(img.dimensions(), (40, 20));
    }

    #[test]
    fn test_crop_fills_box() {
        let out = transform(
            &png(200, 100),
            &options(&[("width", "60"), ("height", "60"), ("mode", "crop")]),
            &Limits::default(),
        )
        .unwrap();
        let img = image::load_from_memory(&out).unwrap();
        assert_eq!(img.dimensions(), (60, 60));
    }

    #[test]
    fn test_format_conversion_to_jpeg() {
        let out = transform(
            &png(32, 32),
            &options(&[("format", "jpg"), ("quality", "70"), ("f.sharpen", "15")]),
            &Limits::default(),
        )
        .unwrap();
        assert_eq!(content_type(&out), "image/jpeg");
    }

    #[test]
    fn test_passthrough_returns_source_bytes() {
        let source = png(8, 8);
        let out = transform(&source, &options(&[]), &Limits::default()).unwrap();
        assert_eq!(out, source);
    }

    #[test]
    fn test_decode_limit_rejects_large_frames() {
        let limits = Limits {
            decode: FrameLimit {
                width: 100,
                height: 100,
                megapixels: 1.0,
            },
            ..Limits::default()
        };
        let err = transform(&png(200, 10), &options(&[("width", "50")]), &limits).unwrap_err();
        assert!(matches!(err, ImageServerError::Limit(_)));
    }

    #[test]
    fn test_invalid_commands_are_bad_requests() {
        let bad = |k: &str, v: &str| {
            let commands: BTreeMap<String, String> =
                [(k.to_string(), v.to_string())].into_iter().collect();
            TransformOptions::from_commands(&commands, true).unwrap_err()
        };
        assert!(matches!(bad("width", "-5"), ImageServerError::BadRequest(_)));
        assert!(matches!(bad("width", "0"), ImageServerError::BadRequest(_)));
        assert!(matches!(bad("quality", "101"), ImageServerError::BadRequest(_)));
        assert!(matches!(bad("format", "bmp"), ImageServerError::BadRequest(_)));
        assert!(matches!(bad("mode", "zoom"), ImageServerError::BadRequest(_)));
    }

    #[test]
    fn test_target_size_derives_missing_dimension() {
        let opts = options(&[("height", "50")]);
        assert_eq!(target_size((200, 100), &opts), Some((100, 50)));
        assert_eq!(fit_within((200, 100), (80, 80)), (80, 40));
    }
}
