// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Local PII detection
//!
//! License plates and documents run on a background executor; faces and
//! text run in the orchestrator's own context. Model files are downloaded on
//! first use and loaded once per process.

pub mod cache;
pub mod download;
pub mod error;
pub mod executor;
pub mod in_context;
pub mod messages;
pub mod object;
pub mod ocr;
pub mod onnx;
pub mod orchestrator;
pub mod types;

pub use cache::ModelCache;
pub use download::{DownloadError, DownloadSource, ModelDownloader, ModelSpec, RetryPolicy};
pub use error::{DetectionError, DetectorError};
pub use executor::{ExecutorDetector, ExecutorHandle};
pub use in_context::{
    FaceDetector, FaceDetectorConfig, InContextDetector, InContextProgress, TextDetector,
    TextDetectorConfig,
};
pub use messages::{ExecutorCommand, ExecutorEvent, InContextKind};
pub use object::OnnxObjectDetector;
pub use onnx::OnnxSession;
pub use orchestrator::DetectionOrchestrator;
pub use types::{
    BoundingBox, Detection, DetectionRun, DetectionStatus, DetectionType, DetectionUpdate,
    RawDetection, RequestId, SharedImage,
};
