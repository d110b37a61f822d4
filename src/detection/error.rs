// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use thiserror::Error;

use super::download::DownloadError;

/// Errors returned synchronously when a run cannot start
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DetectionError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("A detection run is already in progress")]
    Busy,

    #[error("Detector executor is not running")]
    ExecutorUnavailable,
}

/// Errors raised by an individual detector
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Model download failed: {0}")]
    Download(#[from] DownloadError),

    #[error("Failed to create inference session: {0}")]
    Session(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Unexpected model output: {0}")]
    InvalidOutput(String),

    #[error("Detector task failed: {0}")]
    Join(String),

    #[error("Detection cancelled")]
    Cancelled,
}

impl From<tokio::task::JoinError> for DetectorError {
    fn from(e: tokio::task::JoinError) -> Self {
        DetectorError::Join(e.to_string())
    }
}
