// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{InContextDetector, InContextProgress};
use crate::detection::cache::ModelCache;
use crate::detection::download::{ModelDownloader, ModelSpec};
use crate::detection::error::DetectorError;
use crate::detection::messages::InContextKind;
use crate::detection::object::{run_yolo, YoloConfig};
use crate::detection::onnx::{load_session, OnnxSession};
use crate::detection::types::{Detection, DetectionType, RawDetection, SharedImage};

#[derive(Debug, Clone)]
pub struct FaceDetectorConfig {
    pub model: ModelSpec,
    pub score_threshold: f32,
}

impl FaceDetectorConfig {
    pub fn new(model: ModelSpec) -> Self {
        Self {
            model,
            score_threshold: 0.5,
        }
    }
}

/// Face detections labelled "Face 1", "Face 2", ... in model output order
pub fn label_faces(raw: Vec<RawDetection>, image_width: u32, image_height: u32) -> Vec<Detection> {
    raw.into_iter()
        .filter_map(|r| r.into_detection(DetectionType::Face, image_width, image_height))
        .enumerate()
        .map(|(i, mut d)| {
            d.label = Some(format!("Face {}", i + 1));
            d
        })
        .collect()
}

/// Face detection with a single-class YOLO model
pub struct FaceDetector {
    config: FaceDetectorConfig,
    yolo: YoloConfig,
    downloader: Arc<ModelDownloader>,
    cache: Arc<ModelCache<OnnxSession>>,
}

impl FaceDetector {
    pub fn new(
        config: FaceDetectorConfig,
        downloader: Arc<ModelDownloader>,
        cache: Arc<ModelCache<OnnxSession>>,
    ) -> Self {
        let yolo = YoloConfig::single_class("face", config.score_threshold);
        Self {
            config,
            yolo,
            downloader,
            cache,
        }
    }
}

#[async_trait]
impl InContextDetector for FaceDetector {
    fn kind(&self) -> InContextKind {
        InContextKind::Face
    }

    fn is_loaded(&self) -> bool {
        self.cache.is_loaded(&self.config.model.id)
    }

    fn is_cached(&self) -> bool {
        self.downloader.is_cached(&self.config.model)
    }

    async fn detect(
        &self,
        image: SharedImage,
        progress: &(dyn Fn(InContextProgress) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<Vec<Detection>, DetectorError> {
        if cancel.is_cancelled() {
            return Err(DetectorError::Cancelled);
        }

        let load_progress = |p: f32| progress(InContextProgress::Loading(p));
        let session =
            load_session(&self.cache, &self.downloader, &self.config.model, &load_progress).await?;
        if cancel.is_cancelled() {
            return Err(DetectorError::Cancelled);
        }
        progress(InContextProgress::Detecting(0.0));

        let (width, height) = image.dimensions();
        let yolo = self.yolo.clone();
        let raw = tokio::task::spawn_blocking(move || run_yolo(&session, &image, &yolo)).await??;
        progress(InContextProgress::Detecting(100.0));

        let detections = label_faces(raw, width, height);

        debug!("Face detector found {} faces", detections.len());
        Ok(detections)
    }

    fn close(&self) {
        self.cache.release(&self.config.model.id);
    }
}
