//! In-place overlay compositing onto BGRA frame buffers.

use image::imageops::{self, FilterType};
use image::RgbaImage;
use tracing::debug;

/// Draw `overlay_png` scaled to (`width`, `height`) onto the BGRA `base`
/// buffer using source-over alpha blending. A missing pixel range in the
/// base buffer is skipped and an undecodable overlay is a no-op; a bad
/// overlay must never take the frame down with it.
pub fn composite_overlay(base: &mut [u8], overlay_png: &[u8], width: u32, height: u32) {
    if width == 0 || height == 0 {
        return;
    }

    let decoded = match image::load_from_memory(overlay_png) {
        Ok(image) => image.to_rgba8(),
        Err(err) => {
            debug!("ignoring undecodable overlay: {err}");
            return;
        }
    };

    let overlay: RgbaImage = if decoded.dimensions() == (width, height) {
        decoded
    } else {
        imageops::resize(&decoded, width, height, FilterType::Triangle)
    };

    for y in 0..height {
        for x in 0..width {
            let offset = ((y * width + x) * 4) as usize;
            if offset + 3 >= base.len() {
                return;
            }

            let pixel = overlay.get_pixel(x, y);
            let alpha = pixel[3] as u32;
            if alpha == 0 {
                continue;
            }

            // Overlay is RGBA, the frame is BGRA.
            base[offset] = blend(pixel[2], base[offset], alpha);
            base[offset + 1] = blend(pixel[1], base[offset + 1], alpha);
            base[offset + 2] = blend(pixel[0], base[offset + 2], alpha);
            let out_alpha = alpha + (base[offset + 3] as u32 * (255 - alpha)) / 255;
            base[offset + 3] = out_alpha.min(255) as u8;
        }
    }
}

fn blend(src: u8, dst: u8, alpha: u32) -> u8 {
    ((src as u32 * alpha + dst as u32 * (255 - alpha)) / 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png_of(width: u32, height: u32, pixel: Rgba<u8>) -> Vec<u8> {
        let image = RgbaImage::from_pixel(width, height, pixel);
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn opaque_overlay_replaces_base_pixels() {
        let width = 4;
        let height = 4;
        let mut base = vec![10u8; (width * height * 4) as usize];
        let overlay = png_of(width, height, Rgba([255, 0, 0, 255]));

        composite_overlay(&mut base, &overlay, width, height);

        // Red in BGRA: B=0, G=0, R=255.
        assert_eq!(base[0], 0);
        assert_eq!(base[1], 0);
        assert_eq!(base[2], 255);
        assert_eq!(base[3], 255);
    }

    #[test]
    fn transparent_overlay_leaves_base_untouched() {
        let width = 2;
        let height = 2;
        let mut base = vec![42u8; (width * height * 4) as usize];
        let expected = base.clone();
        let overlay = png_of(width, height, Rgba([255, 255, 255, 0]));

        composite_overlay(&mut base, &overlay, width, height);
        assert_eq!(base, expected);
    }

    #[test]
    fn half_alpha_blends() {
        let width = 1;
        let height = 1;
        let mut base = vec![0u8, 0, 0, 255];
        let overlay = png_of(width, height, Rgba([200, 100, 50, 128]));

        composite_overlay(&mut base, &overlay, width, height);

        // src·a/255 over a black base.
        assert_eq!(base[0], (50 * 128 / 255) as u8);
        assert_eq!(base[1], (100 * 128 / 255) as u8);
        assert_eq!(base[2], (200 * 128 / 255) as u8);
    }

    #[test]
    fn undecodable_overlay_is_a_no_op() {
        let mut base = vec![9u8; 16];
        let expected = base.clone();

        composite_overlay(&mut base, b"definitely not a png", 2, 2);
        assert_eq!(base, expected);
    }

    #[test]
    fn overlay_is_scaled_to_the_frame() {
        let mut base = vec![0u8; 4 * 4 * 4];
        let overlay = png_of(2, 2, Rgba([0, 255, 0, 255]));

        composite_overlay(&mut base, &overlay, 4, 4);

        // Every frame pixel gets the scaled-up green overlay.
        for pixel in base.chunks_exact(4) {
            assert_eq!(pixel[1], 255);
        }
    }

    #[test]
    fn short_base_buffer_is_not_overrun() {
        // Base only holds one row's worth of pixels for a 2x2 frame.
        let mut base = vec![0u8; 2 * 4];
        let overlay = png_of(2, 2, Rgba([255, 255, 255, 255]));

        composite_overlay(&mut base, &overlay, 2, 2);
        assert!(base.iter().take(8).all(|b| *b == 255));
    }
}
