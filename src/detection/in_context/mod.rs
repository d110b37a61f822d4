// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Detectors the orchestrator spawns itself instead of queueing on the executor

pub mod face;
pub mod text;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::error::DetectorError;
use super::messages::InContextKind;
use super::types::{Detection, SharedImage};

pub use face::{FaceDetector, FaceDetectorConfig};
pub use text::{TextDetector, TextDetectorConfig};

/// Progress of one in-context detection, each phase on a 0-100 scale
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InContextProgress {
    /// Downloading and loading model assets
    Loading(f32),
    Detecting(f32),
}

#[async_trait]
pub trait InContextDetector: Send + Sync {
    fn kind(&self) -> InContextKind;

    fn is_loaded(&self) -> bool;

    /// Every model file is on disk
    fn is_cached(&self) -> bool;

    /// Detect over the whole image. Loads lazily on first call; concurrent
    /// first calls share one initialization. Returns
    /// [`DetectorError::Cancelled`] once `cancel` fires between stages.
    async fn detect(
        &self,
        image: SharedImage,
        progress: &(dyn Fn(InContextProgress) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<Vec<Detection>, DetectorError>;

    /// Release loaded models
    fn close(&self);
}
