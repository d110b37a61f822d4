// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Word-level text detection on top of the OCR engine

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{InContextDetector, InContextProgress};
use crate::detection::cache::ModelCache;
use crate::detection::download::{ModelDownloader, ModelSpec};
use crate::detection::error::DetectorError;
use crate::detection::messages::InContextKind;
use crate::detection::ocr::{load_dictionary, split_into_words, OcrEngine, OcrWord};
use crate::detection::onnx::{load_session, OnnxSession};
use crate::detection::types::{BoundingBox, Detection, DetectionType, SharedImage};

/// Words at or below this confidence (0-100) are dropped
pub const DEFAULT_MIN_WORD_CONFIDENCE: f32 = 60.0;

/// Share of the detecting phase spent finding text regions
const REGION_SEARCH_SHARE: f32 = 10.0;

/// Loading progress for asset `index` of `count` at `progress` percent
pub fn asset_progress(index: usize, count: usize, progress: f32) -> f32 {
    let count = count.max(1) as f32;
    (index as f32 * 100.0 + progress.clamp(0.0, 100.0)) / count
}

/// Detecting progress once `done` of `count` regions are recognized
pub fn region_progress(done: usize, count: usize) -> f32 {
    if count == 0 {
        return 100.0;
    }
    REGION_SEARCH_SHARE + (100.0 - REGION_SEARCH_SHARE) * done.min(count) as f32 / count as f32
}

#[derive(Debug, Clone)]
pub struct TextDetectorConfig {
    pub detection_model: ModelSpec,
    pub recognition_model: ModelSpec,
    pub dictionary: ModelSpec,
    pub min_word_confidence: f32,
}

impl TextDetectorConfig {
    pub fn new(detection_model: ModelSpec, recognition_model: ModelSpec, dictionary: ModelSpec) -> Self {
        Self {
            detection_model,
            recognition_model,
            dictionary,
            min_word_confidence: DEFAULT_MIN_WORD_CONFIDENCE,
        }
    }
}

/// Map an OCR word to a text detection, or None if it is blank, too
/// uncertain or outside the image
pub fn word_to_detection(
    word: OcrWord,
    min_confidence: f32,
    image_width: u32,
    image_height: u32,
) -> Option<Detection> {
    let text = word.text.trim();
    if text.is_empty() || !(word.confidence > min_confidence) {
        return None;
    }

    let bbox = BoundingBox::from_pixels(
        word.x,
        word.y,
        word.width,
        word.height,
        image_width,
        image_height,
    )?;
    Some(Detection::new(
        DetectionType::Text,
        bbox,
        word.confidence / 100.0,
        Some(text.to_string()),
    ))
}

pub struct TextDetector {
    config: TextDetectorConfig,
    downloader: Arc<ModelDownloader>,
    cache: Arc<ModelCache<OnnxSession>>,
    dictionaries: ModelCache<Vec<char>>,
}

impl TextDetector {
    pub fn new(
        config: TextDetectorConfig,
        downloader: Arc<ModelDownloader>,
        cache: Arc<ModelCache<OnnxSession>>,
    ) -> Self {
        Self {
            config,
            downloader,
            cache,
            dictionaries: ModelCache::new(),
        }
    }

    /// Load the detection model, recognition model and dictionary, each
    /// filling a third of the loading phase
    async fn engine(
        &self,
        progress: &(dyn Fn(InContextProgress) + Send + Sync),
    ) -> Result<OcrEngine, DetectorError> {
        let detection_progress =
            |p: f32| progress(InContextProgress::Loading(asset_progress(0, 3, p)));
        let detection = load_session(
            &self.cache,
            &self.downloader,
            &self.config.detection_model,
            &detection_progress,
        )
        .await?;

        let recognition_progress =
            |p: f32| progress(InContextProgress::Loading(asset_progress(1, 3, p)));
        let recognition = load_session(
            &self.cache,
            &self.downloader,
            &self.config.recognition_model,
            &recognition_progress,
        )
        .await?;

        let dictionary_progress =
            |p: f32| progress(InContextProgress::Loading(asset_progress(2, 3, p)));
        let dictionary = self
            .dictionaries
            .get_or_try_init(&self.config.dictionary.id, || async {
                let path = self
                    .downloader
                    .ensure(&self.config.dictionary, &dictionary_progress)
                    .await?;
                tokio::task::spawn_blocking(move || load_dictionary(&path)).await?
            })
            .await?;

        Ok(OcrEngine::new(detection, recognition, dictionary))
    }
}

#[async_trait]
impl InContextDetector for TextDetector {
    fn kind(&self) -> InContextKind {
        InContextKind::Text
    }

    fn is_loaded(&self) -> bool {
        self.cache.is_loaded(&self.config.detection_model.id)
            && self.cache.is_loaded(&self.config.recognition_model.id)
            && self.dictionaries.is_loaded(&self.config.dictionary.id)
    }

    fn is_cached(&self) -> bool {
        [
            &self.config.detection_model,
            &self.config.recognition_model,
            &self.config.dictionary,
        ]
        .into_iter()
        .all(|spec| self.downloader.is_cached(spec))
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
        let engine = self.engine(progress).await?;
        if cancel.is_cancelled() {
            return Err(DetectorError::Cancelled);
        }
        progress(InContextProgress::Detecting(0.0));

        let regions = {
            let engine = engine.clone();
            let image = image.clone();
            tokio::task::spawn_blocking(move || engine.detect_regions(&image)).await??
        };
        progress(InContextProgress::Detecting(region_progress(0, regions.len())));

        let (width, height) = image.dimensions();
        let count = regions.len();
        let mut detections = Vec::new();

        for (i, region) in regions.into_iter().enumerate() {
            if cancel.is_cancelled() {
                debug!("Text recognition cancelled after {} of {} regions", i, count);
                return Err(DetectorError::Cancelled);
            }

            let line = {
                let engine = engine.clone();
                let image = image.clone();
                tokio::task::spawn_blocking(move || engine.recognize(&image, &region)).await?
            };

            match line {
                Ok(line) => detections.extend(
                    split_into_words(&line)
                        .into_iter()
                        .filter_map(|word| {
                            word_to_detection(word, self.config.min_word_confidence, width, height)
                        }),
                ),
                Err(e) => warn!("Text recognition failed for region {}: {}", i, e),
            }

            progress(InContextProgress::Detecting(region_progress(i + 1, count)));
        }

        progress(InContextProgress::Detecting(100.0));
        debug!("Text detector found {} words", detections.len());
        Ok(detections)
    }

    fn close(&self) {
        self.cache.release(&self.config.detection_model.id);
        self.cache.release(&self.config.recognition_model.id);
        self.dictionaries.clear();
    }
}
