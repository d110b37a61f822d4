// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! CTC decoding for the text recognition model

use ndarray::{ArrayViewD, Axis, Ix2};
use std::path::Path;

use crate::detection::error::DetectorError;

/// Placeholder at index 0; never emitted
const CTC_BLANK: char = '\u{0}';

/// Decoded line of text
#[derive(Debug, Clone, PartialEq)]
pub struct RecognizedText {
    pub text: String,
    /// Mean per-character probability, 0-1
    pub confidence: f32,
    /// One entry per char of `text`
    pub char_confidences: Vec<f32>,
}

/// Load a one-character-per-line dictionary.
///
/// Index 0 is the CTC blank and a trailing space class is appended, matching
/// the layout the recognition head was trained with.
pub fn load_dictionary(path: &Path) -> Result<Vec<char>, DetectorError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        DetectorError::ModelNotFound(format!("dictionary {}: {}", path.display(), e))
    })?;
    Ok(parse_dictionary(&contents))
}

pub fn parse_dictionary(contents: &str) -> Vec<char> {
    let mut dictionary = vec![CTC_BLANK];
    dictionary.extend(
        contents
            .lines()
            .filter_map(|line| line.trim_end_matches('\r').chars().next()),
    );
    if !dictionary[1..].contains(&' ') {
        dictionary.push(' ');
    }
    dictionary
}

/// Greedy best-path decode with blank removal and repeat collapsing
pub fn ctc_decode(output: &ArrayViewD<f32>, dictionary: &[char]) -> Result<RecognizedText, DetectorError> {
    let steps = match output.ndim() {
        3 if output.shape()[0] == 1 => output.index_axis(Axis(0), 0),
        2 => output.view(),
        _ => {
            return Err(DetectorError::InvalidOutput(format!(
                "unexpected recognition output shape {:?}",
                output.shape()
            )))
        }
    };
    let steps = steps
        .into_dimensionality::<Ix2>()
        .map_err(|e| DetectorError::InvalidOutput(e.to_string()))?;

    let mut text = String::new();
    let mut char_confidences = Vec::new();
    let mut previous: Option<usize> = None;

    for row in steps.outer_iter() {
        let (index, prob) = row
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });

        if index != 0 && previous != Some(index) {
            if let Some(&ch) = dictionary.get(index) {
                text.push(ch);
                char_confidences.push(prob.clamp(0.0, 1.0));
            }
        }
        previous = (index != 0).then_some(index);
    }

    let confidence = if char_confidences.is_empty() {
        0.0
    } else {
        char_confidences.iter().sum::<f32>() / char_confidences.len() as f32
    };

    Ok(RecognizedText {
        text,
        confidence,
        char_confidences,
    })
}
