use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use std::path::{Path, PathBuf};
use tallyslip_core::ImageConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("Failed to read image file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("Failed to encode processed image: {0}")]
    Encode(String),
}

/// Shrinks receipt photos to a size the OCR service handles quickly and
/// re-encodes them as JPEG.
#[derive(Debug, Clone, Copy)]
pub struct ImagePreprocessor {
    max_dimension: u32,
    jpeg_quality: u8,
}

impl Default for ImagePreprocessor {
    fn default() -> Self {
        Self::from_config(&ImageConfig::default())
    }
}

impl ImagePreprocessor {
    pub fn new(max_dimension: u32, jpeg_quality: u8) -> Self {
        Self {
            max_dimension: max_dimension.max(1),
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }

    pub fn from_config(config: &ImageConfig) -> Self {
        Self::new(config.max_dimension, config.jpeg_quality)
    }

    pub fn max_dimension(&self) -> u32 {
        self.max_dimension
    }

    /// Downscale (never upscale) into a `max_dimension` square, keeping the
    /// aspect ratio, and return JPEG bytes.
    pub fn prepare(&self, img: &DynamicImage) -> Result<Vec<u8>, PreprocessError> {
        let rgb = self.fit(img);
        tracing::debug!(
            from_width = img.width(),
            from_height = img.height(),
            width = rgb.width(),
            height = rgb.height(),
            "Normalized receipt image"
        );
        self.encode_jpeg(&rgb)
    }

    /// Decode raw image bytes (JPEG / PNG / WEBP / …) and prepare them.
    pub fn prepare_bytes(&self, data: &[u8]) -> Result<Vec<u8>, PreprocessError> {
        let img = image::load_from_memory(data)?;
        self.prepare(&img)
    }

    pub async fn prepare_file(&self, path: &Path) -> Result<Vec<u8>, PreprocessError> {
        let data = tokio::fs::read(path).await.map_err(|source| PreprocessError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.prepare_bytes(&data)
    }

    fn fit(&self, img: &DynamicImage) -> RgbImage {
        let max = self.max_dimension;
        if img.width() > max || img.height() > max {
            img.resize(max, max, FilterType::Lanczos3).to_rgb8()
        } else {
            // JPEG has no alpha channel; flatten whatever we got.
            img.to_rgb8()
        }
    }

    fn encode_jpeg(&self, rgb: &RgbImage) -> Result<Vec<u8>, PreprocessError> {
        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut buf, self.jpeg_quality)
            .encode_image(rgb)
            .map_err(|e| PreprocessError::Encode(e.to_string()))?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb, Rgba, RgbaImage};
    use std::io::Cursor;

    fn gradient(width: u32, height: u32) -> DynamicImage {
        let img: RgbImage = ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        DynamicImage::ImageRgb8(img)
    }

    fn decoded_size(jpeg: &[u8]) -> (u32, u32) {
        let img = image::load_from_memory(jpeg).unwrap();
        (img.width(), img.height())
    }

    #[test]
    fn large_image_fits_within_max() {
        let out = ImagePreprocessor::new(1000, 75).prepare(&gradient(2400, 1200)).unwrap();
        assert_eq!(decoded_size(&out), (1000, 500));
    }

    #[test]
    fn tall_image_keeps_aspect_ratio() {
        let out = ImagePreprocessor::new(1000, 75).prepare(&gradient(600, 3000)).unwrap();
        assert_eq!(decoded_size(&out), (200, 1000));
    }

    #[test]
    fn small_image_is_never_upscaled() {
        let out = ImagePreprocessor::new(1000, 75).prepare(&gradient(320, 240)).unwrap();
        assert_eq!(decoded_size(&out), (320, 240));
    }

    #[test]
    fn bounds_hold_for_assorted_shapes() {
        let pre = ImagePreprocessor::new(256, 75);
        for (w, h) in [(1, 1), (256, 256), (257, 10), (10, 257), (4000, 3), (999, 1001)] {
            let (ow, oh) = decoded_size(&pre.prepare(&gradient(w, h)).unwrap());
            assert!(ow <= 256 && oh <= 256, "{w}x{h} -> {ow}x{oh}");
            assert!(ow <= w && oh <= h, "{w}x{h} -> {ow}x{oh}");
            assert!(ow >= 1 && oh >= 1);
        }
    }

    #[test]
    fn output_is_jpeg() {
        let out = ImagePreprocessor::default().prepare(&gradient(16, 16)).unwrap();
        assert_eq!(&out[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn rgba_input_is_flattened() {
        let img: RgbaImage = ImageBuffer::from_fn(8, 8, |_, _| Rgba([10, 20, 30, 128]));
        let out = ImagePreprocessor::default().prepare(&DynamicImage::ImageRgba8(img)).unwrap();
        assert_eq!(decoded_size(&out), (8, 8));
    }

    #[test]
    fn deterministic_for_same_input() {
        let pre = ImagePreprocessor::new(100, 80);
        let img = gradient(300, 150);
        assert_eq!(pre.prepare(&img).unwrap(), pre.prepare(&img).unwrap());
    }

    #[test]
    fn prepare_bytes_decodes_png() {
        let mut png = Vec::new();
        gradient(40, 20).write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png).unwrap();
        let out = ImagePreprocessor::new(10, 75).prepare_bytes(&png).unwrap();
        assert_eq!(decoded_size(&out), (10, 5));
    }

    #[test]
    fn garbage_bytes_are_a_decode_error() {
        let err = ImagePreprocessor::default().prepare_bytes(b"definitely not an image").unwrap_err();
        assert!(matches!(err, PreprocessError::Decode(_)));
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ImagePreprocessor::default()
            .prepare_file(&dir.path().join("nope.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, PreprocessError::Io { .. }));
    }

    #[test]
    fn zero_max_is_clamped() {
        assert_eq!(ImagePreprocessor::new(0, 0).max_dimension(), 1);
    }
}
