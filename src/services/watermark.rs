use crate::services::error::ProcessingError;
use crate::utils::orientation::{apply_orientation, read_orientation};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, DynamicImage, Rgba, RgbaImage, imageops};
use resvg::{tiny_skia, usvg};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Watermark height as a fraction of the shorter image side.
const WATERMARK_SCALE: f64 = 0.20;

/// Bottom-right anchor of the watermark as a fraction of each image side.
const WATERMARK_ANCHOR: f64 = 0.95;

/// Turns one encoded image into one encoded output image.
///
/// Implementations are synchronous and CPU bound; callers run them on the
/// blocking pool.
pub trait ImageProcessor: Send + Sync {
    fn process(&self, image: &[u8]) -> Result<Vec<u8>, ProcessingError>;
}

/// The SVG watermark, validated once at start and shared read-only.
#[derive(Debug, Clone)]
pub struct WatermarkAsset {
    svg: Bytes,
    width: f32,
    height: f32,
}

impl WatermarkAsset {
    pub async fn load(path: &Path) -> Result<Self, ProcessingError> {
        let data = tokio::fs::read(path).await.map_err(|e| {
            ProcessingError::Asset(format!("cannot read {}: {}", path.display(), e))
        })?;
        let asset = Self::from_svg(data)?;
        info!(
            "🖼️  Watermark asset loaded from {} ({}x{})",
            path.display(),
            asset.width,
            asset.height
        );
        Ok(asset)
    }

    pub fn from_svg(data: impl Into<Bytes>) -> Result<Self, ProcessingError> {
        let svg = data.into();
        let tree = Self::parse(&svg)?;
        let size = tree.size();
        Ok(Self {
            svg,
            width: size.width(),
            height: size.height(),
        })
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.width / self.height
    }

    fn parse(svg: &[u8]) -> Result<usvg::Tree, ProcessingError> {
        let tree = usvg::Tree::from_data(svg, &usvg::Options::default())
            .map_err(|e| ProcessingError::Asset(format!("invalid SVG: {}", e)))?;
        let size = tree.size();
        if size.width() <= 0.0 || size.height() <= 0.0 {
            return Err(ProcessingError::Asset("SVG has an empty viewport".to_string()));
        }
        Ok(tree)
    }

    /// Rasterize at the given pixel height, keeping the aspect ratio.
    pub fn rasterize(&self, height: u32) -> Result<RgbaImage, ProcessingError> {
        let tree = Self::parse(&self.svg)?;
        let height = height.max(1);
        let width = ((height as f32 * self.aspect_ratio()).round() as u32).max(1);

        let mut pixmap = tiny_skia::Pixmap::new(width, height).ok_or_else(|| {
            ProcessingError::Asset(format!("cannot allocate {}x{} watermark", width, height))
        })?;
        let transform = tiny_skia::Transform::from_scale(
            width as f32 / self.width,
            height as f32 / self.height,
        );
        resvg::render(&tree, transform, &mut pixmap.as_mut());

        // tiny-skia stores premultiplied alpha, the image crate expects straight alpha.
        let pixels = pixmap
            .pixels()
            .iter()
            .flat_map(|px| {
                let c = px.demultiply();
                [c.red(), c.green(), c.blue(), c.alpha()]
            })
            .collect();

        RgbaImage::from_raw(width, height, pixels)
            .ok_or_else(|| ProcessingError::Asset("watermark buffer size mismatch".to_string()))
    }
}

/// Height of the watermark for a `width` x `height` image.
pub fn watermark_height(width: u32, height: u32) -> u32 {
    (width.min(height) as f64 * WATERMARK_SCALE).floor() as u32
}

/// Top-left offset of a `wm_width` x `wm_height` watermark; may be negative.
pub fn watermark_offset(width: u32, height: u32, wm_width: u32, wm_height: u32) -> (i64, i64) {
    let left = (width as f64 * WATERMARK_ANCHOR - wm_width as f64).ceil() as i64;
    let top = (height as f64 * WATERMARK_ANCHOR - wm_height as f64).ceil() as i64;
    (left, top)
}

/// Composite `img` onto opaque white, dropping transparency.
pub fn flatten_on_white(img: &DynamicImage) -> RgbaImage {
    let mut base = RgbaImage::from_pixel(img.width(), img.height(), Rgba([255, 255, 255, 255]));
    imageops::overlay(&mut base, &img.to_rgba8(), 0, 0);
    base
}

/// Applies the shared watermark and re-encodes as JPEG.
#[derive(Debug, Clone)]
pub struct ImageWatermarker {
    asset: Arc<WatermarkAsset>,
    jpeg_quality: u8,
}

impl ImageWatermarker {
    pub fn new(asset: Arc<WatermarkAsset>, jpeg_quality: u8) -> Self {
        Self {
            asset,
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }

    /// Decode and normalise orientation. The EXIF tag is not carried forward.
    fn decode_upright(bytes: &[u8]) -> Result<DynamicImage, ProcessingError> {
        let img = image::load_from_memory(bytes)
            .map_err(|e| ProcessingError::Decode(e.to_string()))?;
        Ok(match read_orientation(bytes) {
            Some(orientation) => apply_orientation(img, orientation),
            None => img,
        })
    }

    fn encode_jpeg(&self, img: RgbaImage) -> Result<Vec<u8>, ProcessingError> {
        let rgb = DynamicImage::ImageRgba8(img).into_rgb8();
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, self.jpeg_quality)
            .encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)
            .map_err(|e| ProcessingError::Encode(e.to_string()))?;
        Ok(out)
    }

    pub fn watermark(&self, bytes: &[u8]) -> Result<Vec<u8>, ProcessingError> {
        let composed = self.compose(bytes)?;
        self.encode_jpeg(composed)
    }

    /// Upright, flattened and watermarked pixels, before JPEG encoding.
    pub fn compose(&self, bytes: &[u8]) -> Result<RgbaImage, ProcessingError> {
        let img = Self::decode_upright(bytes)?;
        let (w, h) = (img.width(), img.height());

        let mark = self.asset.rasterize(watermark_height(w, h))?;
        let mut base = flatten_on_white(&img);
        drop(img);

        let (left, top) = watermark_offset(w, h, mark.width(), mark.height());
        debug!(
            width = w,
            height = h,
            mark_width = mark.width(),
            mark_height = mark.height(),
            left,
            top,
            "Compositing watermark"
        );
        // overlay clips anything outside the base, including negative offsets.
        imageops::overlay(&mut base, &mark, left, top);
        Ok(base)
    }
}

impl ImageProcessor for ImageWatermarker {
    fn process(&self, image: &[u8]) -> Result<Vec<u8>, ProcessingError> {
        self.watermark(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, ImageFormat, RgbImage};
    use std::io::Cursor;

    /// 100x50 solid red rectangle.
    const TEST_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="100" height="50" viewBox="0 0 100 50"><rect width="100" height="50" fill="#ff0000"/></svg>"##;

    fn watermarker() -> ImageWatermarker {
        let asset = WatermarkAsset::from_svg(TEST_SVG.as_bytes().to_vec()).unwrap();
        ImageWatermarker::new(Arc::new(asset), 90)
    }

    fn png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, image::Rgb(color));
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    fn is_reddish(px: Rgba<u8>) -> bool {
        px[0] > 200 && px[1] < 60 && px[2] < 60
    }

    fn is_blueish(px: Rgba<u8>) -> bool {
        px[2] > 200 && px[0] < 60 && px[1] < 60
    }

    #[test]
    fn test_watermark_height_uses_shorter_side() {
        assert_eq!(watermark_height(200, 100), 20);
        assert_eq!(watermark_height(100, 200), 20);
        assert_eq!(watermark_height(1000, 1000), 200);
        assert_eq!(watermark_height(4, 4), 0);
        assert_eq!(watermark_height(33, 99), 6);
    }

    #[test]
    fn test_watermark_offset_anchors_bottom_right() {
        assert_eq!(watermark_offset(1000, 500, 200, 100), (750, 375));
        let (left, top) = watermark_offset(10, 10, 40, 20);
        assert!(left < 0 && top < 0);
    }

    #[test]
    fn test_flatten_removes_transparency() {
        let mut img = RgbaImage::new(2, 1);
        img.put_pixel(0, 0, Rgba([0, 0, 0, 0]));
        img.put_pixel(1, 0, Rgba([0, 0, 0, 255]));
        let flat = flatten_on_white(&DynamicImage::ImageRgba8(img));
        assert_eq!(flat.get_pixel(0, 0), &Rgba([255, 255, 255, 255]));
        assert_eq!(flat.get_pixel(1, 0), &Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn test_flatten_blends_partial_alpha() {
        let img = RgbaImage::from_pixel(1, 1, Rgba([0, 0, 0, 128]));
        let px = *flatten_on_white(&DynamicImage::ImageRgba8(img)).get_pixel(0, 0);
        assert_eq!(px[3], 255);
        assert!((120..=135).contains(&px[0]), "got {:?}", px);
        assert_eq!(px[0], px[1]);
        assert_eq!(px[1], px[2]);
    }

    #[test]
    fn test_asset_rejects_garbage() {
        assert!(matches!(
            WatermarkAsset::from_svg(b"definitely not svg".to_vec()),
            Err(ProcessingError::Asset(_))
        ));
    }

    #[test]
    fn test_rasterize_keeps_aspect_ratio() {
        let asset = WatermarkAsset::from_svg(TEST_SVG.as_bytes().to_vec()).unwrap();
        let mark = asset.rasterize(20).unwrap();
        assert_eq!(mark.dimensions(), (40, 20));
        assert!(is_reddish(*mark.get_pixel(20, 10)));
        assert_eq!(mark.get_pixel(20, 10)[3], 255);
    }

    #[test]
    fn test_watermark_lands_bottom_right() {
        let out = watermarker().watermark(&png(400, 200, [0, 0, 255])).unwrap();
        let decoded = image::load_from_memory_with_format(&out, ImageFormat::Jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (400, 200));

        // Mark is 80x40, anchored so its bottom-right corner sits at (380, 190).
        let (left, top) = watermark_offset(400, 200, 80, 40);
        assert_eq!((left, top), (300, 150));
        assert!(is_reddish(decoded.get_pixel(340, 170)));
        assert!(is_blueish(decoded.get_pixel(390, 195)));
        assert!(is_blueish(decoded.get_pixel(100, 100)));
        assert!(is_blueish(decoded.get_pixel(280, 170)));
    }

    #[test]
    fn test_watermark_corner_is_exact() {
        let composed = watermarker().compose(&png(400, 200, [0, 0, 255])).unwrap();
        let red = Rgba([255, 0, 0, 255]);
        let blue = Rgba([0, 0, 255, 255]);

        // Bottom-right corner of the mark at (ceil(400 * 0.95), ceil(200 * 0.95))
        assert_eq!(composed.get_pixel(379, 189), &red);
        assert_eq!(composed.get_pixel(380, 189), &blue);
        assert_eq!(composed.get_pixel(379, 190), &blue);
        assert_eq!(composed.get_pixel(380, 190), &blue);

        // Top-left corner at (300, 150)
        assert_eq!(composed.get_pixel(300, 150), &red);
        assert_eq!(composed.get_pixel(299, 150), &blue);
        assert_eq!(composed.get_pixel(300, 149), &blue);
    }

    #[test]
    fn test_portrait_uses_width_for_scale() {
        let out = watermarker().watermark(&png(200, 400, [0, 0, 255])).unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!(decoded.dimensions(), (200, 400));
        // Mark is 80x40 again: height follows the 200px width.
        let (left, top) = watermark_offset(200, 400, 80, 40);
        assert_eq!((left, top), (110, 340));
        assert!(is_reddish(decoded.get_pixel(150, 360)));
        assert!(is_blueish(decoded.get_pixel(150, 330)));
    }

    #[test]
    fn test_transparent_input_is_flattened_to_white() {
        let img = RgbaImage::from_pixel(100, 100, Rgba([0, 0, 0, 0]));
        let mut input = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut input), ImageFormat::Png)
            .unwrap();

        let out = watermarker().watermark(&input).unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        let px = decoded.get_pixel(10, 10);
        assert!(px[0] > 240 && px[1] > 240 && px[2] > 240);
    }

    #[test]
    fn test_tiny_image_clips_watermark() {
        let out = watermarker().watermark(&png(3, 3, [0, 0, 255])).unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!(decoded.dimensions(), (3, 3));
    }

    #[test]
    fn test_undecodable_input_is_decode_error() {
        let err = watermarker().watermark(b"GIF89a but not really").unwrap_err();
        assert!(err.is_decode());
    }
}
