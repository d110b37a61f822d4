// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Two-stage OCR: region detection, then per-line CTC recognition

pub mod preprocessing;
pub mod recognition;
pub mod regions;

use image::RgbaImage;
use std::sync::Arc;
use tracing::debug;

pub use recognition::{ctc_decode, load_dictionary, parse_dictionary, RecognizedText};
pub use regions::TextRegion;

use super::error::DetectorError;
use super::onnx::OnnxSession;
use preprocessing::{preprocess_for_detection, preprocess_for_recognition, DET_INPUT_SIZE};

/// A recognized line with its source region
#[derive(Debug, Clone, PartialEq)]
pub struct OcrLine {
    pub region: TextRegion,
    pub text: RecognizedText,
}

/// A single word, confidence on a 0-100 scale
#[derive(Debug, Clone, PartialEq)]
pub struct OcrWord {
    pub text: String,
    pub confidence: f32,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Loaded detection + recognition pair
#[derive(Clone)]
pub struct OcrEngine {
    detection: Arc<OnnxSession>,
    recognition: Arc<OnnxSession>,
    dictionary: Arc<Vec<char>>,
}

impl OcrEngine {
    pub fn new(
        detection: Arc<OnnxSession>,
        recognition: Arc<OnnxSession>,
        dictionary: Arc<Vec<char>>,
    ) -> Self {
        Self {
            detection,
            recognition,
            dictionary,
        }
    }

    /// Locate text lines in source image coordinates
    pub fn detect_regions(&self, image: &RgbaImage) -> Result<Vec<TextRegion>, DetectorError> {
        let (input, info) = preprocess_for_detection(image);
        let output = self.detection.run(input)?;
        let view = output.view();
        let map = regions::probability_map(&view)?;

        let found = regions::extract_regions(&map, regions::TEXT_THRESHOLD, regions::MIN_REGION_PIXELS);
        let mapped = regions::to_image_space(found, map.dim(), DET_INPUT_SIZE, &info);
        debug!("OCR found {} text regions", mapped.len());
        Ok(mapped)
    }

    /// Recognize the text inside one region
    pub fn recognize(&self, image: &RgbaImage, region: &TextRegion) -> Result<OcrLine, DetectorError> {
        let x = region.x.floor().max(0.0) as u32;
        let y = region.y.floor().max(0.0) as u32;
        let w = (region.width.ceil() as u32).min(image.width().saturating_sub(x)).max(1);
        let h = (region.height.ceil() as u32).min(image.height().saturating_sub(y)).max(1);

        let crop = image::imageops::crop_imm(image, x, y, w, h).to_image();
        let output = self.recognition.run(preprocess_for_recognition(&crop))?;
        let text = ctc_decode(&output.view(), &self.dictionary)?;

        Ok(OcrLine {
            region: *region,
            text,
        })
    }
}

/// Split a recognized line into words, apportioning the line box by
/// character offset
pub fn split_into_words(line: &OcrLine) -> Vec<OcrWord> {
    let chars: Vec<char> = line.text.text.chars().collect();
    let total = chars.len();
    if total == 0 {
        return Vec::new();
    }

    let confidences = &line.text.char_confidences;
    let per_char = confidences.len() == total;
    let char_width = line.region.width / total as f32;

    let mut words = Vec::new();
    let mut start = 0;
    while start < total {
        if chars[start].is_whitespace() {
            start += 1;
            continue;
        }
        let end = (start..total)
            .find(|&i| chars[i].is_whitespace())
            .unwrap_or(total);

        let confidence = if per_char {
            confidences[start..end].iter().sum::<f32>() / (end - start) as f32
        } else {
            line.text.confidence
        };

        words.push(OcrWord {
            text: chars[start..end].iter().collect(),
            confidence: confidence * 100.0,
            x: line.region.x + start as f32 * char_width,
            y: line.region.y,
            width: (end - start) as f32 * char_width,
            height: line.region.height,
        });
        start = end;
    }

    words
}
