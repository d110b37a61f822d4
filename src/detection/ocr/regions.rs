// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Text region extraction from the detection model's probability map

use ndarray::{ArrayView2, ArrayViewD, Axis, Ix2};

use super::preprocessing::PreprocessInfo;
use crate::detection::error::DetectorError;

/// Probability at which a map pixel counts as text
pub const TEXT_THRESHOLD: f32 = 0.3;

/// Components smaller than this many map pixels are noise
pub const MIN_REGION_PIXELS: usize = 10;

/// Detection regions are shrunk during training; expand them back by this ratio
const UNCLIP_RATIO: f32 = 1.5;

/// Axis-aligned text line in source image pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Mean map probability over the component
    pub score: f32,
}

impl TextRegion {
    pub fn area(&self) -> f32 {
        self.width * self.height
    }
}

/// Squeeze `[1, 1, H, W]` or `[1, H, W]` to `[H, W]`
pub fn probability_map<'a>(output: &'a ArrayViewD<'a, f32>) -> Result<ArrayView2<'a, f32>, DetectorError> {
    let mut view = output.view();
    while view.ndim() > 2 {
        if view.shape()[0] != 1 {
            return Err(DetectorError::InvalidOutput(format!(
                "unexpected probability map shape {:?}",
                output.shape()
            )));
        }
        view = view.index_axis_move(Axis(0), 0);
    }
    view.into_dimensionality::<Ix2>()
        .map_err(|e| DetectorError::InvalidOutput(e.to_string()))
}

/// Connected components of the thresholded map, as boxes in map pixels
pub fn extract_regions(map: &ArrayView2<f32>, threshold: f32, min_pixels: usize) -> Vec<TextRegion> {
    let (height, width) = map.dim();
    let mut visited = vec![false; width * height];
    let mut regions = Vec::new();

    for y in 0..height {
        for x in 0..width {
            if visited[y * width + x] || map[[y, x]] < threshold {
                continue;
            }

            let mut stack = vec![(x, y)];
            visited[y * width + x] = true;
            let (mut min_x, mut max_x, mut min_y, mut max_y) = (x, x, y, y);
            let mut count = 0usize;
            let mut sum = 0.0f32;

            while let Some((cx, cy)) = stack.pop() {
                count += 1;
                sum += map[[cy, cx]];
                min_x = min_x.min(cx);
                max_x = max_x.max(cx);
                min_y = min_y.min(cy);
                max_y = max_y.max(cy);

                let neighbours = [
                    (cx.wrapping_sub(1), cy),
                    (cx + 1, cy),
                    (cx, cy.wrapping_sub(1)),
                    (cx, cy + 1),
                ];
                for (nx, ny) in neighbours {
                    if nx < width && ny < height {
                        let idx = ny * width + nx;
                        if !visited[idx] && map[[ny, nx]] >= threshold {
                            visited[idx] = true;
                            stack.push((nx, ny));
                        }
                    }
                }
            }

            if count >= min_pixels {
                regions.push(TextRegion {
                    x: min_x as f32,
                    y: min_y as f32,
                    width: (max_x - min_x + 1) as f32,
                    height: (max_y - min_y + 1) as f32,
                    score: sum / count as f32,
                });
            }
        }
    }

    regions
}

/// Grow a shrunk region by `area * ratio / perimeter` on every side
pub fn unclip(region: TextRegion, ratio: f32) -> TextRegion {
    let perimeter = 2.0 * (region.width + region.height);
    if perimeter <= 0.0 {
        return region;
    }
    let distance = region.area() * ratio / perimeter;
    TextRegion {
        x: region.x - distance,
        y: region.y - distance,
        width: region.width + 2.0 * distance,
        height: region.height + 2.0 * distance,
        ..region
    }
}

/// Map-space regions to source image space, clipped and in reading order
pub fn to_image_space(
    regions: Vec<TextRegion>,
    map_size: (usize, usize),
    input_size: u32,
    info: &PreprocessInfo,
) -> Vec<TextRegion> {
    let (map_h, map_w) = map_size;
    let scale_x = input_size as f32 / map_w.max(1) as f32;
    let scale_y = input_size as f32 / map_h.max(1) as f32;
    let max_x = info.original_width as f32;
    let max_y = info.original_height as f32;

    let mut mapped: Vec<TextRegion> = regions
        .into_iter()
        .map(|r| unclip(r, UNCLIP_RATIO))
        .filter_map(|r| {
            let (x0, y0) = info.map_to_original(r.x * scale_x, r.y * scale_y);
            let (x1, y1) =
                info.map_to_original((r.x + r.width) * scale_x, (r.y + r.height) * scale_y);
            let (x0, y0) = (x0.clamp(0.0, max_x), y0.clamp(0.0, max_y));
            let (x1, y1) = (x1.clamp(0.0, max_x), y1.clamp(0.0, max_y));
            (x1 - x0 >= 1.0 && y1 - y0 >= 1.0).then_some(TextRegion {
                x: x0,
                y: y0,
                width: x1 - x0,
                height: y1 - y0,
                score: r.score,
            })
        })
        .collect();

    mapped.sort_by(|a, b| a.y.total_cmp(&b.y).then(a.x.total_cmp(&b.x)));
    mapped
}
