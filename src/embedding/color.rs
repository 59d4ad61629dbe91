//! Color histogram embeddings.
//!
//! A cheap, model-free descriptor of an image's palette:
//!
//! ```text
//! bytes ─▶ decode ─▶ resize 200×200 ─▶ 4×4×4 RGB histogram (64 buckets)
//!       ─▶ L1 normalize ─▶ pad/truncate to dims ─▶ L2 normalize
//! ```

use anyhow::{bail, Context, Result};
use image::imageops::FilterType;

use crate::similarity::l2_normalize;

/// Side length images are resampled to before counting.
pub const HISTOGRAM_RESOLUTION: u32 = 200;
/// Bins per RGB channel.
pub const BINS_PER_CHANNEL: usize = 4;

/// Computes the color histogram embedding of an encoded image.
///
/// # Errors
///
/// Returns an error if the bytes cannot be decoded as an image or `dims`
/// is zero. [`EmbeddingGenerator::color`](super::EmbeddingGenerator::color)
/// turns errors into a zero vector.
pub fn color_histogram(bytes: &[u8], dims: usize) -> Result<Vec<f32>> {
    if dims == 0 {
        bail!("color histogram dims must be > 0");
    }

    let image = image::load_from_memory(bytes).context("Failed to decode image")?;
    let resized = image
        .resize_exact(HISTOGRAM_RESOLUTION, HISTOGRAM_RESOLUTION, FilterType::Triangle)
        .to_rgb8();

    let mut counts = [0u64; BINS_PER_CHANNEL * BINS_PER_CHANNEL * BINS_PER_CHANNEL];
    for pixel in resized.pixels() {
        let r = bin(pixel[0]);
        let g = bin(pixel[1]);
        let b = bin(pixel[2]);
        counts[(r * BINS_PER_CHANNEL + g) * BINS_PER_CHANNEL + b] += 1;
    }

    let total: u64 = counts.iter().sum();
    if total == 0 {
        bail!("image has no pixels");
    }

    let mut out = vec![0.0f32; dims];
    for (slot, count) in out.iter_mut().zip(counts.iter()) {
        *slot = (*count as f64 / total as f64) as f32;
    }
    l2_normalize(&mut out);
    Ok(out)
}

fn bin(channel: u8) -> usize {
    (channel as usize * BINS_PER_CHANNEL) / 256
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, ImageFormat, Rgb};
    use std::io::Cursor;

    fn solid_png(color: [u8; 3], w: u32, h: u32) -> Vec<u8> {
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_pixel(w, h, Rgb(color));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn bins_split_channel_range_in_quarters() {
        assert_eq!(bin(0), 0);
        assert_eq!(bin(63), 0);
        assert_eq!(bin(64), 1);
        assert_eq!(bin(128), 2);
        assert_eq!(bin(255), 3);
    }

    #[test]
    fn solid_color_lands_in_one_bucket() {
        let v = color_histogram(&solid_png([255, 0, 0], 32, 16), 256).unwrap();
        assert_eq!(v.len(), 256);
        // r=3, g=0, b=0
        let idx = 3 * 16;
        assert!((v[idx] - 1.0).abs() < 1e-6);
        assert_eq!(v.iter().filter(|x| **x != 0.0).count(), 1);
    }

    #[test]
    fn output_is_unit_length_and_padded() {
        let v = color_histogram(&solid_png([10, 200, 90], 8, 8), 256).unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(v[64..].iter().all(|x| *x == 0.0));
    }

    #[test]
    fn truncates_to_small_dims() {
        let v = color_histogram(&solid_png([0, 0, 0], 4, 4), 8).unwrap();
        assert_eq!(v.len(), 8);
        assert!((v[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn deterministic_for_identical_bytes() {
        let bytes = solid_png([120, 30, 220], 50, 40);
        assert_eq!(
            color_histogram(&bytes, 256).unwrap(),
            color_histogram(&bytes, 256).unwrap()
        );
    }

    #[test]
    fn garbage_bytes_fail() {
        assert!(color_histogram(b"not an image", 256).is_err());
    }
}
