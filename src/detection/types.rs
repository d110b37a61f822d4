// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Core detection types

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::backend::Backend;

/// Identifies one detection run; responses carrying an older id are stale
pub type RequestId = u64;

/// Decoded RGBA image shared between the orchestrator and detectors
pub type SharedImage = Arc<RgbaImage>;

/// Kind of personally identifiable content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionType {
    Face,
    Text,
    LicensePlate,
    Document,
}

impl DetectionType {
    /// Canonical processing order
    pub const ALL: [DetectionType; 4] = [
        DetectionType::Face,
        DetectionType::Text,
        DetectionType::LicensePlate,
        DetectionType::Document,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionType::Face => "face",
            DetectionType::Text => "text",
            DetectionType::LicensePlate => "license_plate",
            DetectionType::Document => "document",
        }
    }

    /// Face and text detectors need device/rendering access and run on the
    /// orchestrator's own context instead of the executor
    pub fn is_in_context(&self) -> bool {
        matches!(self, DetectionType::Face | DetectionType::Text)
    }

    /// Progress stage shown while this type is being processed
    pub fn stage_label(&self) -> &'static str {
        match self {
            DetectionType::Face => "Detecting faces",
            DetectionType::Text => "Recognizing text",
            DetectionType::LicensePlate => "Detecting license plates",
            DetectionType::Document => "Detecting documents",
        }
    }

    /// Deduplicate and sort into canonical order
    pub fn normalize(types: &[DetectionType]) -> Vec<DetectionType> {
        Self::ALL
            .into_iter()
            .filter(|t| types.contains(t))
            .collect()
    }
}

impl fmt::Display for DetectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Integer pixel rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Snap a floating-point rectangle outward to whole pixels and clip it to
    /// the image. Returns None when nothing of it lies inside the image.
    pub fn from_pixels(
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        image_width: u32,
        image_height: u32,
    ) -> Option<Self> {
        if ![x, y, width, height].iter().all(|v| v.is_finite()) {
            return None;
        }

        let x0 = x.max(0.0).floor();
        let y0 = y.max(0.0).floor();
        let x1 = (x + width).min(image_width as f32).ceil();
        let y1 = (y + height).min(image_height as f32).ceil();

        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        Some(Self {
            x: x0 as u32,
            y: y0 as u32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }

    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    /// Non-empty and fully inside `[0, width) x [0, height)`
    pub fn is_within(&self, width: u32, height: u32) -> bool {
        self.width > 0
            && self.height > 0
            && self.x < width
            && self.y < height
            && self.right() <= width
            && self.bottom() <= height
    }
}

/// Clamp a score into [0, 1]; NaN becomes 0
pub fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// One suspected PII region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub id: String,
    #[serde(rename = "type")]
    pub detection_type: DetectionType,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub selected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Detection {
    /// New detection with a fresh id, selected by default
    pub fn new(
        detection_type: DetectionType,
        bbox: BoundingBox,
        confidence: f32,
        label: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            detection_type,
            bbox,
            confidence: clamp_unit(confidence),
            selected: true,
            label,
        }
    }
}

/// Detector output before it is mapped into a [`Detection`]
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub label: String,
    pub score: f32,
    /// Top-left corner and size in source image pixels
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl RawDetection {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Map into the canonical shape, clipped to the image
    pub fn into_detection(
        self,
        detection_type: DetectionType,
        image_width: u32,
        image_height: u32,
    ) -> Option<Detection> {
        let bbox = BoundingBox::from_pixels(
            self.x,
            self.y,
            self.width,
            self.height,
            image_width,
            image_height,
        )?;
        Some(Detection::new(
            detection_type,
            bbox,
            self.score,
            Some(self.label),
        ))
    }
}

/// Lifecycle state of the detection run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionStatus {
    Idle,
    Downloading,
    Detecting,
    Error,
    Cancelled,
}

impl DetectionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, DetectionStatus::Downloading | DetectionStatus::Detecting)
    }
}

/// Snapshot of the orchestrator's run state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionRun {
    pub status: DetectionStatus,
    /// 0-100 across every model that needed loading
    pub download_progress: f32,
    /// 0-100 across every enabled type
    pub progress: f32,
    pub current_stage: String,
    pub results: Vec<Detection>,
    pub models_loaded: HashMap<DetectionType, bool>,
    pub backend: Backend,
    pub enabled_types: Vec<DetectionType>,
    pub request_id: Option<RequestId>,
    pub error: Option<String>,
}

impl DetectionRun {
    pub fn new(backend: Backend) -> Self {
        Self {
            status: DetectionStatus::Idle,
            download_progress: 0.0,
            progress: 0.0,
            current_stage: String::new(),
            results: Vec::new(),
            models_loaded: DetectionType::ALL.into_iter().map(|t| (t, false)).collect(),
            backend,
            enabled_types: Vec::new(),
            request_id: None,
            error: None,
        }
    }
}

/// Progress and results streamed to the detection consumer
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionUpdate {
    StatusChanged(DetectionStatus),
    DownloadProgress(f32),
    Progress { progress: f32, stage: String },
    /// Newly found detections; batches are additive
    Batch(Vec<Detection>),
    ModelLoaded {
        detection_type: DetectionType,
        loaded: bool,
    },
    Completed { total: usize },
    Failed(String),
    Cancelled,
}
