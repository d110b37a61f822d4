// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Redaction plan types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pixel mutation applied to a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedactionStyle {
    Solid,
    Pixelate,
    Blur,
}

impl RedactionStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedactionStyle::Solid => "solid",
            RedactionStyle::Pixelate => "pixelate",
            RedactionStyle::Blur => "blur",
        }
    }

    /// Parse a style name, returning None for anything unknown
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "solid" => Some(RedactionStyle::Solid),
            "pixelate" => Some(RedactionStyle::Pixelate),
            "blur" => Some(RedactionStyle::Blur),
            _ => None,
        }
    }
}

impl Default for RedactionStyle {
    fn default() -> Self {
        RedactionStyle::Solid
    }
}

impl fmt::Display for RedactionStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single rectangle the planner wants redacted, in image pixel space
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedRedaction {
    pub style: RedactionStyle,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Effect strength, 1-100
    pub intensity: u8,
    pub reason: String,
}

impl PlannedRedaction {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Whether the rectangle lies fully inside a `width` x `height` image
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.width > 0
            && self.height > 0
            && self.x < width
            && self.y < height
            && self.x as u64 + self.width as u64 <= width as u64
            && self.y as u64 + self.height as u64 <= height as u64
    }
}

/// Validated planner output for one loop step (may be empty)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactionPlan {
    pub redactions: Vec<PlannedRedaction>,
    pub explanation: String,
}

impl RedactionPlan {
    /// A plan that redacts nothing
    pub fn empty(explanation: impl Into<String>) -> Self {
        Self {
            redactions: Vec::new(),
            explanation: explanation.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.redactions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.redactions.len()
    }
}
