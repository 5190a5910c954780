// ============================================================
// Layer 4 — Image Transforms
// ============================================================
// Turns a decoded RawImage into the normalised float buffer the
// model consumes. The pipeline runs in this order:
//
//   RawImage (u8, any size, 1 or 3 channels)
//       │  prepare    → convert channels, resize to image_size
//       ▼
//   [0,1] floats (CHW)
//       │  augment    → flip / rotate / jitter   (training only)
//       ▼
//   normalise         → (x - mean[c]) / std[c]
//
// Evaluation and serving use the same transform with the
// augmentation step switched off, so a picture goes through
// identical preprocessing whether it comes from the test split
// or from an HTTP upload.
//
// Reference: image crate documentation (imageops::resize)
//            rand crate documentation

use anyhow::{bail, Context, Result};
use image::{imageops::FilterType, DynamicImage, GrayImage, RgbImage};
use rand::Rng;

use crate::config::{AugmentConfig, DataConfig};
use crate::domain::image::RawImage;

// ─── Decoding ─────────────────────────────────────────────────────────────────

/// Decode an encoded image (PNG, JPEG, ...) into `channels` planes.
pub fn decode_image(bytes: &[u8], channels: usize) -> Result<RawImage> {
    let img = image::load_from_memory(bytes).context("Cannot decode image bytes")?;
    from_dynamic(&img, channels)
}

/// Convert an `image` crate image into a CHW RawImage.
pub fn from_dynamic(img: &DynamicImage, channels: usize) -> Result<RawImage> {
    let (width, height) = (img.width() as usize, img.height() as usize);
    let data = match channels {
        1 => img.to_luma8().into_raw(),
        3 => {
            // HWC interleaved → CHW planar
            let rgb   = img.to_rgb8();
            let plane = width * height;
            let mut data = vec![0u8; 3 * plane];
            for (i, px) in rgb.pixels().enumerate() {
                data[i]             = px[0];
                data[plane + i]     = px[1];
                data[2 * plane + i] = px[2];
            }
            data
        }
        other => bail!("Unsupported channel count {other} (expected 1 or 3)"),
    };
    RawImage::new(channels, height, width, data).context("Decoded image has inconsistent size")
}

fn to_dynamic(img: &RawImage) -> Result<DynamicImage> {
    let (w, h) = (img.width as u32, img.height as u32);
    match img.channels {
        1 => GrayImage::from_raw(w, h, img.data.clone())
            .map(DynamicImage::ImageLuma8)
            .context("Grayscale buffer does not match its dimensions"),
        3 => {
            let plane = img.plane_len();
            let mut hwc = Vec::with_capacity(img.data.len());
            for i in 0..plane {
                hwc.extend_from_slice(&[img.data[i], img.data[plane + i], img.data[2 * plane + i]]);
            }
            RgbImage::from_raw(w, h, hwc)
                .map(DynamicImage::ImageRgb8)
                .context("RGB buffer does not match its dimensions")
        }
        other => bail!("Unsupported channel count {other} (expected 1 or 3)"),
    }
}

/// Bring an image to the target channel count and square size.
pub fn prepare(img: &RawImage, channels: usize, size: usize) -> Result<RawImage> {
    if img.channels == channels && img.height == size && img.width == size {
        return Ok(img.clone());
    }
    let mut dynamic = to_dynamic(img)?;
    if img.height != size || img.width != size {
        dynamic = dynamic.resize_exact(size as u32, size as u32, FilterType::Triangle);
    }
    from_dynamic(&dynamic, channels)
}

// ─── ImageTransform ───────────────────────────────────────────────────────────

/// Preprocessing (and optional augmentation) for one dataset.
#[derive(Debug, Clone)]
pub struct ImageTransform {
    pub channels: usize,
    pub size:     usize,
    mean:         Vec<f32>,
    std:          Vec<f32>,
    augment:      Option<AugmentConfig>,
}

impl ImageTransform {
    /// Deterministic transform for validation, test and serving.
    pub fn for_eval(cfg: &DataConfig) -> Self {
        Self {
            channels: cfg.input_channels,
            size:     cfg.image_size,
            mean:     cfg.mean.clone(),
            std:      cfg.std.clone(),
            augment:  None,
        }
    }

    /// Randomised transform for the training split.
    pub fn for_training(cfg: &DataConfig) -> Self {
        Self { augment: Some(cfg.augment.clone()), ..Self::for_eval(cfg) }
    }

    pub fn is_augmenting(&self) -> bool {
        self.augment.is_some()
    }

    /// Number of floats produced per image: C * H * W
    pub fn output_len(&self) -> usize {
        self.channels * self.size * self.size
    }

    /// Run the pipeline without augmentation.
    pub fn apply_eval(&self, img: &RawImage) -> Result<Vec<f32>> {
        let prepared = prepare(img, self.channels, self.size)?;
        let mut pixels = to_unit_range(&prepared);
        self.normalise(&mut pixels);
        Ok(pixels)
    }

    /// Run the full pipeline, drawing augmentation parameters from `rng`.
    pub fn apply<R: Rng + ?Sized>(&self, img: &RawImage, rng: &mut R) -> Result<Vec<f32>> {
        let Some(aug) = &self.augment else {
            return self.apply_eval(img);
        };

        let prepared = prepare(img, self.channels, self.size)?;
        let (c, h, w) = (self.channels, self.size, self.size);
        let mut pixels = to_unit_range(&prepared);

        if aug.horizontal_flip && rng.gen_bool(0.5) {
            flip_horizontal(&mut pixels, c, h, w);
        }
        if aug.rotation_degrees > 0.0 {
            let angle = rng.gen_range(-aug.rotation_degrees..=aug.rotation_degrees);
            pixels = rotate(&pixels, c, h, w, angle);
        }
        if aug.color_jitter > 0.0 {
            let lo = (1.0 - aug.color_jitter).max(0.0);
            let hi = 1.0 + aug.color_jitter;
            let brightness = rng.gen_range(lo..=hi);
            let contrast   = rng.gen_range(lo..=hi);
            jitter(&mut pixels, brightness, contrast);
        }

        self.normalise(&mut pixels);
        Ok(pixels)
    }

    fn normalise(&self, pixels: &mut [f32]) {
        let plane = self.size * self.size;
        for (c, chunk) in pixels.chunks_mut(plane).enumerate() {
            let (mean, std) = (self.mean[c], self.std[c]);
            chunk.iter_mut().for_each(|x| *x = (*x - mean) / std);
        }
    }
}

// ─── Pixel operations ─────────────────────────────────────────────────────────

fn to_unit_range(img: &RawImage) -> Vec<f32> {
    img.data.iter().map(|&b| b as f32 / 255.0).collect()
}

fn flip_horizontal(pixels: &mut [f32], c: usize, h: usize, w: usize) {
    for ch in 0..c {
        for y in 0..h {
            let start = (ch * h + y) * w;
            pixels[start..start + w].reverse();
        }
    }
}

/// Rotate counter-clockwise about the centre, nearest neighbour,
/// uncovered pixels become 0.
fn rotate(pixels: &[f32], c: usize, h: usize, w: usize, degrees: f32) -> Vec<f32> {
    let (sin, cos) = degrees.to_radians().sin_cos();
    let cy = (h as f32 - 1.0) / 2.0;
    let cx = (w as f32 - 1.0) / 2.0;
    let mut out = vec![0.0f32; pixels.len()];

    for y in 0..h {
        for x in 0..w {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            // inverse mapping: where did this output pixel come from?
            let sx = (cos * dx - sin * dy + cx).round();
            let sy = (sin * dx + cos * dy + cy).round();
            if sx < 0.0 || sy < 0.0 || sx >= w as f32 || sy >= h as f32 {
                continue;
            }
            let (sx, sy) = (sx as usize, sy as usize);
            for ch in 0..c {
                out[(ch * h + y) * w + x] = pixels[(ch * h + sy) * w + sx];
            }
        }
    }
    out
}

fn jitter(pixels: &mut [f32], brightness: f32, contrast: f32) {
    pixels.iter_mut().for_each(|x| *x = (*x * brightness).clamp(0.0, 1.0));
    let mean = pixels.iter().sum::<f32>() / pixels.len().max(1) as f32;
    pixels
        .iter_mut()
        .for_each(|x| *x = ((*x - mean) * contrast + mean).clamp(0.0, 1.0));
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataConfig, DatasetName};
    use rand::{rngs::StdRng, SeedableRng};

    fn cifar() -> DataConfig {
        DataConfig::preset(DatasetName::Cifar10)
    }

    #[test]
    fn test_eval_normalisation_range() {
        let cfg   = cifar();
        let t     = ImageTransform::for_eval(&cfg);
        let white = RawImage::new(3, 32, 32, vec![255; 3 * 32 * 32]).unwrap();
        let black = RawImage::new(3, 32, 32, vec![0; 3 * 32 * 32]).unwrap();

        // mean 0.5 / std 0.5 maps [0,1] onto [-1,1]
        assert!(t.apply_eval(&white).unwrap().iter().all(|&x| (x - 1.0).abs() < 1e-6));
        assert!(t.apply_eval(&black).unwrap().iter().all(|&x| (x + 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_prepare_resizes_and_converts() {
        let gray = RawImage::new(1, 4, 4, vec![100; 16]).unwrap();
        let out  = prepare(&gray, 3, 2).unwrap();
        assert_eq!((out.channels, out.height, out.width), (3, 2, 2));
        assert_eq!(out.data.len(), 12);
    }

    #[test]
    fn test_output_len_matches_config() {
        let cfg = DataConfig::preset(DatasetName::Mnist);
        let t   = ImageTransform::for_training(&cfg);
        let img = RawImage::new(1, 28, 28, vec![7; 784]).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(t.apply(&img, &mut rng).unwrap().len(), t.output_len());
        assert!(t.is_augmenting());
    }

    #[test]
    fn test_flip_reverses_rows() {
        let mut px = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        flip_horizontal(&mut px, 1, 2, 3);
        assert_eq!(px, vec![3.0, 2.0, 1.0, 6.0, 5.0, 4.0]);
    }

    #[test]
    fn test_rotate_zero_is_identity() {
        let px: Vec<f32> = (0..9).map(|i| i as f32).collect();
        assert_eq!(rotate(&px, 1, 3, 3, 0.0), px);
    }

    #[test]
    fn test_rotate_half_turn() {
        let px: Vec<f32> = (0..9).map(|i| i as f32).collect();
        let out = rotate(&px, 1, 3, 3, 180.0);
        assert_eq!(out, vec![8.0, 7.0, 6.0, 5.0, 4.0, 3.0, 2.0, 1.0, 0.0]);
    }

    #[test]
    fn test_jitter_stays_in_unit_range() {
        let mut px = vec![0.0, 0.5, 1.0];
        jitter(&mut px, 1.5, 1.5);
        assert!(px.iter().all(|x| (0.0..=1.0).contains(x)));
    }

    #[test]
    fn test_decode_png_roundtrip_shape() {
        let buf = RgbImage::from_pixel(5, 3, image::Rgb([10, 20, 30]));
        let mut bytes = std::io::Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(buf)
            .write_to(&mut bytes, image::ImageFormat::Png)
            .unwrap();

        let img = decode_image(bytes.get_ref(), 3).unwrap();
        assert_eq!((img.channels, img.height, img.width), (3, 3, 5));
        assert_eq!(img.at(0, 0, 0), 10);
        assert_eq!(img.at(2, 2, 4), 30);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_image(b"not an image", 3).is_err());
    }
}
