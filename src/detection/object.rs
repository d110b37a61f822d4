// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! YOLO object detectors for license plates, documents and faces
//!
//! All three models share the YOLOv8 head layout: one `[1, 4 + C, N]` output
//! where the first four rows are `cx, cy, w, h` in model input pixels and the
//! remaining `C` rows are per-class scores.

use async_trait::async_trait;
use image::imageops::FilterType;
use image::RgbaImage;
use ndarray::{Array4, ArrayViewD, Axis, Ix2};
use std::sync::Arc;
use tracing::debug;

use super::cache::ModelCache;
use super::download::{ModelDownloader, ModelSpec};
use super::error::DetectorError;
use super::executor::ExecutorDetector;
use super::onnx::{load_session, OnnxSession};
use super::types::{DetectionType, RawDetection, SharedImage};

pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

/// COCO classes that commonly carry printed or on-screen personal data
pub const DOCUMENT_LABELS: [&str; 4] = ["book", "cell phone", "laptop", "tv"];

#[derive(Debug, Clone)]
pub struct YoloConfig {
    pub input_size: u32,
    /// Candidates below this score are dropped before NMS
    pub score_threshold: f32,
    pub nms_threshold: f32,
    pub labels: Vec<String>,
}

impl YoloConfig {
    pub fn single_class(label: &str, score_threshold: f32) -> Self {
        Self {
            input_size: 640,
            score_threshold,
            nms_threshold: 0.45,
            labels: vec![label.to_string()],
        }
    }

    pub fn coco(score_threshold: f32) -> Self {
        Self {
            input_size: 640,
            score_threshold,
            nms_threshold: 0.45,
            labels: COCO_CLASSES.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// Stretch-resize to a square input, scale to [0, 1], NCHW
pub fn preprocess(image: &RgbaImage, input_size: u32) -> Array4<f32> {
    let resized = image::imageops::resize(image, input_size, input_size, FilterType::Triangle);
    let size = input_size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
        }
    }

    tensor
}

/// Decode a YOLOv8 head into source-image pixel boxes
pub fn decode(
    output: &ArrayViewD<f32>,
    config: &YoloConfig,
    image_width: u32,
    image_height: u32,
) -> Result<Vec<RawDetection>, DetectorError> {
    let shape = output.shape();
    if shape.len() != 3 || shape[0] != 1 {
        return Err(DetectorError::InvalidOutput(format!(
            "expected [1, 4 + C, N], got {:?}",
            shape
        )));
    }

    let features = 4 + config.labels.len();
    let batch = output
        .index_axis(Axis(0), 0)
        .into_dimensionality::<Ix2>()
        .map_err(|e| DetectorError::InvalidOutput(e.to_string()))?;
    // Some exports emit [1, N, 4 + C]
    let rows = if shape[1] == features {
        batch
    } else if shape[2] == features {
        batch.reversed_axes()
    } else {
        return Err(DetectorError::InvalidOutput(format!(
            "{:?} does not match {} classes",
            shape,
            config.labels.len()
        )));
    };

    let scale_x = image_width as f32 / config.input_size as f32;
    let scale_y = image_height as f32 / config.input_size as f32;
    let candidates = rows.shape()[1];

    let mut detections = Vec::new();
    for i in 0..candidates {
        let (best_class, best_score) = (0..config.labels.len())
            .map(|c| (c, rows[[4 + c, i]]))
            .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });

        if !(best_score >= config.score_threshold) {
            continue;
        }

        let cx = rows[[0, i]];
        let cy = rows[[1, i]];
        let w = rows[[2, i]];
        let h = rows[[3, i]];

        detections.push(RawDetection {
            label: config.labels[best_class].clone(),
            score: best_score,
            x: (cx - w / 2.0) * scale_x,
            y: (cy - h / 2.0) * scale_y,
            width: w * scale_x,
            height: h * scale_y,
        });
    }

    Ok(non_maximum_suppression(detections, config.nms_threshold))
}

/// Per-label greedy NMS, highest score first
pub fn non_maximum_suppression(mut detections: Vec<RawDetection>, threshold: f32) -> Vec<RawDetection> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<RawDetection> = Vec::new();
    for candidate in detections {
        let suppressed = keep
            .iter()
            .any(|kept| kept.label == candidate.label && iou(kept, &candidate) > threshold);
        if !suppressed {
            keep.push(candidate);
        }
    }
    keep
}

pub fn iou(a: &RawDetection, b: &RawDetection) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Run a loaded YOLO session over one image
pub fn run_yolo(
    session: &OnnxSession,
    image: &RgbaImage,
    config: &YoloConfig,
) -> Result<Vec<RawDetection>, DetectorError> {
    let input = preprocess(image, config.input_size);
    let output = session.run(input)?;
    let detections = decode(&output.view(), config, image.width(), image.height())?;
    debug!(
        "{} produced {} detections",
        session.model_id(),
        detections.len()
    );
    Ok(detections)
}

/// Executor-hosted YOLO detector
pub struct OnnxObjectDetector {
    detection_type: DetectionType,
    model: ModelSpec,
    yolo: YoloConfig,
    downloader: Arc<ModelDownloader>,
    cache: Arc<ModelCache<OnnxSession>>,
}

impl OnnxObjectDetector {
    pub fn new(
        detection_type: DetectionType,
        model: ModelSpec,
        yolo: YoloConfig,
        downloader: Arc<ModelDownloader>,
        cache: Arc<ModelCache<OnnxSession>>,
    ) -> Self {
        Self {
            detection_type,
            model,
            yolo,
            downloader,
            cache,
        }
    }

    pub fn license_plate(
        model: ModelSpec,
        downloader: Arc<ModelDownloader>,
        cache: Arc<ModelCache<OnnxSession>>,
    ) -> Self {
        Self::new(
            DetectionType::LicensePlate,
            model,
            YoloConfig::single_class("license_plate", 0.25),
            downloader,
            cache,
        )
    }

    pub fn document(
        model: ModelSpec,
        downloader: Arc<ModelDownloader>,
        cache: Arc<ModelCache<OnnxSession>>,
    ) -> Self {
        Self::new(
            DetectionType::Document,
            model,
            YoloConfig::coco(0.25),
            downloader,
            cache,
        )
    }
}

#[async_trait]
impl ExecutorDetector for OnnxObjectDetector {
    fn detection_type(&self) -> DetectionType {
        self.detection_type
    }

    fn is_loaded(&self) -> bool {
        self.cache.is_loaded(&self.model.id)
    }

    fn is_cached(&self) -> bool {
        self.downloader.is_cached(&self.model)
    }

    async fn load(&self, progress: &(dyn Fn(f32) + Send + Sync)) -> Result<(), DetectorError> {
        load_session(&self.cache, &self.downloader, &self.model, progress).await?;
        Ok(())
    }

    async fn detect(&self, image: SharedImage) -> Result<Vec<RawDetection>, DetectorError> {
        let session = self
            .cache
            .get(&self.model.id)
            .ok_or_else(|| DetectorError::ModelNotFound(self.model.id.clone()))?;
        let yolo = self.yolo.clone();

        tokio::task::spawn_blocking(move || run_yolo(&session, &image, &yolo)).await?
    }

    fn release(&self) {
        self.cache.release(&self.model.id);
    }
}
