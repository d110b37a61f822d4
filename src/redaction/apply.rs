// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Default pixel-redaction primitive

use image::imageops;
use image::{GenericImageView, RgbaImage};

use super::plan::{PlannedRedaction, RedactionStyle};
use crate::session::{ApplyError, RedactionApplier};

/// Solid fill color; alpha is left as it was
const FILL_RGB: [u8; 3] = [0, 0, 0];

/// Pixelation block edge for an intensity in 1-100 (2 to 20 pixels)
pub fn pixelate_block_size(intensity: u8) -> u32 {
    (intensity.clamp(1, 100) as u32 / 5).max(2)
}

/// Gaussian sigma for an intensity in 1-100
pub fn blur_sigma(intensity: u8) -> f32 {
    intensity.clamp(1, 100) as f32 / 5.0
}

/// Mutates pixels in place: solid black fill, block pixelation or gaussian blur
#[derive(Debug, Clone, Copy, Default)]
pub struct PixelRedactor;

impl PixelRedactor {
    pub fn new() -> Self {
        Self
    }

    fn fill(image: &mut RgbaImage, r: &PlannedRedaction) {
        for y in r.y..r.y + r.height {
            for x in r.x..r.x + r.width {
                image.get_pixel_mut(x, y).0[..3].copy_from_slice(&FILL_RGB);
            }
        }
    }

    /// Replace each block aligned to the region's origin with its mean color
    fn pixelate(image: &mut RgbaImage, r: &PlannedRedaction) {
        let block = pixelate_block_size(r.intensity);
        let (x_end, y_end) = (r.x + r.width, r.y + r.height);

        for by in (r.y..y_end).step_by(block as usize) {
            for bx in (r.x..x_end).step_by(block as usize) {
                let width = block.min(x_end - bx);
                let height = block.min(y_end - by);
                let mean = block_mean(image, bx, by, width, height);

                for y in by..by + height {
                    for x in bx..bx + width {
                        image.get_pixel_mut(x, y).0[..3].copy_from_slice(&mean);
                    }
                }
            }
        }
    }

    fn blur(image: &mut RgbaImage, r: &PlannedRedaction) {
        let region = imageops::crop_imm(&*image, r.x, r.y, r.width, r.height).to_image();
        let blurred = imageops::blur(&region, blur_sigma(r.intensity));
        imageops::replace(image, &blurred, r.x as i64, r.y as i64);
    }
}

fn block_mean(image: &RgbaImage, x: u32, y: u32, width: u32, height: u32) -> [u8; 3] {
    let view = imageops::crop_imm(image, x, y, width, height);
    let mut sums = [0u64; 3];
    let mut count = 0u64;

    for (_, _, pixel) in view.pixels() {
        for (sum, channel) in sums.iter_mut().zip(pixel.0) {
            *sum += channel as u64;
        }
        count += 1;
    }

    let count = count.max(1);
    sums.map(|sum| (sum / count) as u8)
}

impl RedactionApplier for PixelRedactor {
    fn apply(&self, image: &mut RgbaImage, redaction: &PlannedRedaction) -> Result<(), ApplyError> {
        let (image_width, image_height) = image.dimensions();
        if !redaction.fits_within(image_width, image_height) {
            return Err(ApplyError::OutOfBounds {
                x: redaction.x,
                y: redaction.y,
                width: redaction.width,
                height: redaction.height,
                image_width,
                image_height,
            });
        }

        match redaction.style {
            RedactionStyle::Solid => Self::fill(image, redaction),
            RedactionStyle::Pixelate => Self::pixelate(image, redaction),
            RedactionStyle::Blur => Self::blur(image, redaction),
        }
        Ok(())
    }
}
