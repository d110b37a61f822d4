// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Image preprocessing for the text detection and recognition models

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use ndarray::Array4;

/// Square input size of the text detection model
pub const DET_INPUT_SIZE: u32 = 640;

/// Recognition model input height
pub const REC_INPUT_HEIGHT: u32 = 48;

/// Upper bound on recognition input width
pub const REC_MAX_WIDTH: u32 = 960;

/// ImageNet normalization
pub const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const STD: [f32; 3] = [0.229, 0.224, 0.225];

const PAD_GRAY: Rgba<u8> = Rgba([128, 128, 128, 255]);

/// Letterbox geometry used to map model coordinates back to the source image
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreprocessInfo {
    pub scale: f32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub original_width: u32,
    pub original_height: u32,
}

impl PreprocessInfo {
    pub fn new(width: u32, height: u32, target_size: u32) -> Self {
        if width == 0 || height == 0 {
            return Self {
                scale: 1.0,
                offset_x: 0,
                offset_y: 0,
                original_width: width,
                original_height: height,
            };
        }

        let scale = (target_size as f32 / width as f32).min(target_size as f32 / height as f32);
        let (new_w, new_h) = scaled_size(width, height, scale);

        Self {
            scale,
            offset_x: (target_size - new_w) / 2,
            offset_y: (target_size - new_h) / 2,
            original_width: width,
            original_height: height,
        }
    }

    pub fn map_to_original(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.offset_x as f32) / self.scale,
            (y - self.offset_y as f32) / self.scale,
        )
    }
}

fn scaled_size(width: u32, height: u32, scale: f32) -> (u32, u32) {
    (
        ((width as f32 * scale).round() as u32).max(1),
        ((height as f32 * scale).round() as u32).max(1),
    )
}

/// Fit `image` inside a gray `target_size` square, centered
pub fn resize_with_padding(image: &RgbaImage, target_size: u32) -> (RgbaImage, PreprocessInfo) {
    let info = PreprocessInfo::new(image.width(), image.height(), target_size);
    let mut output = RgbaImage::from_pixel(target_size, target_size, PAD_GRAY);

    if image.width() == 0 || image.height() == 0 {
        return (output, info);
    }

    let (new_w, new_h) = scaled_size(image.width(), image.height(), info.scale);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);
    imageops::overlay(
        &mut output,
        &resized,
        info.offset_x as i64,
        info.offset_y as i64,
    );

    (output, info)
}

fn normalized_tensor(image: &RgbaImage) -> Array4<f32> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let mut tensor = Array4::zeros((1, 3, h, w));

    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 / 255.0 - MEAN[c]) / STD[c];
        }
    }

    tensor
}

/// Letterbox to the detection input and normalize, NCHW
pub fn preprocess_for_detection(image: &RgbaImage) -> (Array4<f32>, PreprocessInfo) {
    let (padded, info) = resize_with_padding(image, DET_INPUT_SIZE);
    (normalized_tensor(&padded), info)
}

/// Resize a cropped line to the recognition height with its aspect ratio
pub fn preprocess_for_recognition(crop: &RgbaImage) -> Array4<f32> {
    let (w, h) = crop.dimensions();
    let scale = REC_INPUT_HEIGHT as f32 / h.max(1) as f32;
    let new_width = ((w as f32 * scale).round() as u32).clamp(4, REC_MAX_WIDTH);

    let resized = imageops::resize(crop, new_width, REC_INPUT_HEIGHT, FilterType::Triangle);
    normalized_tensor(&resized)
}
