//! Decodes, downscales, white-balances, and re-encodes uploaded pages. The
//! resize/re-encode half of this is grounded in the host application's own
//! image-quality adjustment routine; gray-world white balance is new logic
//! this pipeline requires that the host never needed.

use image::{DynamicImage, GenericImageView, ImageOutputFormat, Rgb, RgbImage};

use super::error::{GradingError, Outcome};
use super::types::Page;

pub struct Preprocessor {
    pub max_long_side: u32,
    pub jpeg_quality: u8,
}

impl Preprocessor {
    pub fn new(max_long_side: u32, jpeg_quality: u8) -> Self {
        Self {
            max_long_side,
            jpeg_quality,
        }
    }

    /// Runs the full pipeline over every uploaded blob, in order. Intended to
    /// be dispatched to a blocking worker pool by the caller, since decoding
    /// and white balance are CPU-bound (per the concurrency model: this step
    /// completes before either engine call starts).
    pub fn process_all(&self, blobs: Vec<Vec<u8>>) -> Outcome<Vec<Page>> {
        blobs
            .into_iter()
            .enumerate()
            .map(|(page_index, bytes)| self.process_one(page_index, bytes))
            .collect()
    }

    fn process_one(&self, page_index: usize, original_bytes: Vec<u8>) -> Outcome<Page> {
        let decoded = image::load_from_memory(&original_bytes)
            .map_err(|e| GradingError::InvalidImage(e.to_string()))?;

        let (w, h) = decoded.dimensions();
        let long_side = w.max(h);
        // Anything within 4x the configured cap is downscaled; beyond that a
        // decode bomb or a genuinely malformed upload is more likely than a
        // legitimate photo, so the request is rejected outright.
        let hard_cap = self.max_long_side.saturating_mul(4);
        if long_side > hard_cap {
            return Err(GradingError::TooLarge {
                width: w,
                height: h,
                cap: self.max_long_side,
            });
        }
        let resized = if long_side > self.max_long_side {
            let scale = self.max_long_side as f32 / long_side as f32;
            let new_w = (w as f32 * scale).round().max(1.0) as u32;
            let new_h = (h as f32 * scale).round().max(1.0) as u32;
            decoded.resize(new_w, new_h, image::imageops::FilterType::Lanczos3)
        } else {
            decoded
        };

        let balanced = gray_world_white_balance(&resized);
        let (width, height) = balanced.dimensions();

        let mut normalized_bytes = Vec::new();
        let mut cursor = std::io::Cursor::new(&mut normalized_bytes);
        DynamicImage::ImageRgb8(balanced)
            .write_to(
                &mut cursor,
                ImageOutputFormat::Jpeg(self.jpeg_quality),
            )
            .map_err(|e| GradingError::InvalidImage(e.to_string()))?;

        Ok(Page {
            page_index,
            width,
            height,
            original_bytes,
            normalized_bytes,
        })
    }
}

/// Gray-world white balance: compute the per-channel mean over the whole
/// image, scale each channel so all three means equal their joint mean, clip
/// to `[0,255]`. Removes the yellow/cool cast that degrades OCR on phone
/// photos taken under incandescent or fluorescent light.
fn gray_world_white_balance(img: &DynamicImage) -> RgbImage {
    let rgb = img.to_rgb8();
    let (w, h) = rgb.dimensions();
    let pixel_count = (w as u64 * h as u64).max(1);

    let mut sums = [0u64; 3];
    for px in rgb.pixels() {
        for c in 0..3 {
            sums[c] += px[c] as u64;
        }
    }
    let means = [
        sums[0] as f64 / pixel_count as f64,
        sums[1] as f64 / pixel_count as f64,
        sums[2] as f64 / pixel_count as f64,
    ];
    let joint_mean = (means[0] + means[1] + means[2]) / 3.0;

    let scales: [f64; 3] = [
        if means[0] > 0.0 { joint_mean / means[0] } else { 1.0 },
        if means[1] > 0.0 { joint_mean / means[1] } else { 1.0 },
        if means[2] > 0.0 { joint_mean / means[2] } else { 1.0 },
    ];

    let mut out = RgbImage::new(w, h);
    for (src, dst) in rgb.pixels().zip(out.pixels_mut()) {
        let mut channels = [0u8; 3];
        for c in 0..3 {
            let scaled = src[c] as f64 * scales[c];
            channels[c] = scaled.clamp(0.0, 255.0) as u8;
        }
        *dst = Rgb(channels);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_jpeg(w: u32, h: u32, color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(w, h, Rgb(color));
        let mut bytes = Vec::new();
        let mut cursor = std::io::Cursor::new(&mut bytes);
        DynamicImage::ImageRgb8(img)
            .write_to(&mut cursor, ImageOutputFormat::Jpeg(90))
            .unwrap();
        bytes
    }

    #[test]
    fn downscales_oversized_pages() {
        let pre = Preprocessor::new(100, 85);
        let bytes = solid_jpeg(400, 200, [200, 150, 100]);
        let pages = pre.process_all(vec![bytes]).unwrap();
        assert_eq!(pages.len(), 1);
        assert!(pages[0].width <= 100);
        assert!(pages[0].height <= 100);
    }

    #[test]
    fn leaves_small_pages_unscaled() {
        let pre = Preprocessor::new(3508, 85);
        let bytes = solid_jpeg(50, 40, [255, 255, 255]);
        let pages = pre.process_all(vec![bytes]).unwrap();
        assert_eq!(pages[0].width, 50);
        assert_eq!(pages[0].height, 40);
    }

    #[test]
    fn rejects_images_past_the_hard_cap() {
        let pre = Preprocessor::new(20, 85);
        let bytes = solid_jpeg(120, 60, [10, 10, 10]);
        let err = pre.process_all(vec![bytes]).unwrap_err();
        assert!(matches!(err, GradingError::TooLarge { .. }));
    }

    #[test]
    fn rejects_undecodable_bytes() {
        let pre = Preprocessor::new(3508, 85);
        let err = pre.process_all(vec![vec![0u8, 1, 2, 3]]).unwrap_err();
        matches!(err, GradingError::InvalidImage(_));
    }

    #[test]
    fn white_balance_neutralizes_uniform_cast() {
        // A uniform warm-cast image should come out exactly neutral gray
        // after gray-world balancing, since every pixel shares the same
        // channel ratio as the image mean.
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(10, 10, Rgb([200, 150, 100])));
        let balanced = gray_world_white_balance(&img);
        let px = balanced.get_pixel(0, 0);
        let mean = (px[0] as i32 + px[1] as i32 + px[2] as i32) / 3;
        for c in 0..3 {
            assert!((px[c] as i32 - mean).abs() <= 1);
        }
    }
}
