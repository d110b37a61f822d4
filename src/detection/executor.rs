// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Background executor hosting the license plate and document detectors
//!
//! The executor owns its detectors and talks to the orchestrator only through
//! [`ExecutorCommand`] / [`ExecutorEvent`] messages. Face and text detection
//! are handed back with `InContextRequested`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::error::{DetectionError, DetectorError};
use super::messages::{ExecutorCommand, ExecutorEvent, InContextKind};
use super::object::DOCUMENT_LABELS;
use super::types::{Detection, DetectionType, RawDetection, RequestId, SharedImage};

pub const PLATE_MIN_SCORE: f32 = 0.3;
pub const DOCUMENT_MIN_SCORE: f32 = 0.5;

/// A detector that can run inside the executor task
#[async_trait]
pub trait ExecutorDetector: Send + Sync {
    fn detection_type(&self) -> DetectionType;

    /// Model is resident in memory
    fn is_loaded(&self) -> bool;

    /// Model file is on disk, so loading needs no download
    fn is_cached(&self) -> bool;

    async fn load(&self, progress: &(dyn Fn(f32) + Send + Sync)) -> Result<(), DetectorError>;

    async fn detect(&self, image: SharedImage) -> Result<Vec<RawDetection>, DetectorError>;

    fn release(&self);
}

/// Whether a raw detection survives the per-type filters
pub fn accept(detection_type: DetectionType, raw: &RawDetection) -> bool {
    match detection_type {
        DetectionType::LicensePlate => raw.score > PLATE_MIN_SCORE,
        DetectionType::Document => {
            DOCUMENT_LABELS.contains(&raw.label.as_str()) && raw.score > DOCUMENT_MIN_SCORE
        }
        DetectionType::Face | DetectionType::Text => true,
    }
}

/// Orchestrator-side handle to the executor task
pub struct ExecutorHandle {
    commands: mpsc::UnboundedSender<ExecutorCommand>,
    cancelled: Arc<AtomicU64>,
}

impl ExecutorHandle {
    /// Spawn the executor on the current tokio runtime
    pub fn spawn(
        detectors: Vec<Arc<dyn ExecutorDetector>>,
    ) -> (Self, mpsc::UnboundedReceiver<ExecutorEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicU64::new(0));

        let executor = DetectorExecutor {
            detectors: detectors
                .into_iter()
                .map(|d| (d.detection_type(), d))
                .collect(),
            events: event_tx,
            cancelled: cancelled.clone(),
        };
        tokio::spawn(executor.run(command_rx));

        (
            Self {
                commands: command_tx,
                cancelled,
            },
            event_rx,
        )
    }

    pub fn send(&self, command: ExecutorCommand) -> Result<(), DetectionError> {
        self.commands
            .send(command)
            .map_err(|_| DetectionError::ExecutorUnavailable)
    }

    /// Flag `request_id` as cancelled so the running job stops at its next
    /// checkpoint, then queue an acknowledgement
    pub fn cancel(&self, request_id: RequestId) -> Result<(), DetectionError> {
        self.cancelled.store(request_id, Ordering::SeqCst);
        self.send(ExecutorCommand::Cancel { request_id })
    }
}

impl Drop for ExecutorHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(ExecutorCommand::Shutdown);
    }
}

struct DetectorExecutor {
    detectors: HashMap<DetectionType, Arc<dyn ExecutorDetector>>,
    events: mpsc::UnboundedSender<ExecutorEvent>,
    cancelled: Arc<AtomicU64>,
}

impl DetectorExecutor {
    async fn run(self, mut commands: mpsc::UnboundedReceiver<ExecutorCommand>) {
        info!("Detector executor started with {} detectors", self.detectors.len());

        while let Some(command) = commands.recv().await {
            match command {
                ExecutorCommand::Detect {
                    request_id,
                    image,
                    types,
                    first_run,
                } => self.detect(request_id, image, &types, first_run).await,
                ExecutorCommand::Cancel { request_id } => {
                    debug!(request_id, "Acknowledging cancel");
                    self.emit(ExecutorEvent::Cancelled { request_id });
                }
                ExecutorCommand::ReleaseModels => {
                    for detector in self.detectors.values() {
                        detector.release();
                    }
                    info!("Executor models released");
                }
                ExecutorCommand::Shutdown => break,
            }
        }

        info!("Detector executor stopped");
    }

    fn emit(&self, event: ExecutorEvent) {
        let _ = self.events.send(event);
    }

    fn is_cancelled(&self, request_id: RequestId) -> bool {
        self.cancelled.load(Ordering::SeqCst) == request_id
    }

    async fn detect(
        &self,
        request_id: RequestId,
        image: SharedImage,
        types: &[DetectionType],
        first_run: bool,
    ) {
        let types = DetectionType::normalize(types);
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            self.emit(ExecutorEvent::Error {
                request_id,
                message: "Image has no pixels".to_string(),
            });
            return;
        }

        if first_run {
            for (detection_type, detector) in &self.detectors {
                self.emit(ExecutorEvent::ModelLoaded {
                    request_id,
                    detection_type: *detection_type,
                    loaded: detector.is_loaded(),
                });
            }
        }

        for kind in types.iter().filter_map(|t| InContextKind::from_type(*t)) {
            self.emit(ExecutorEvent::InContextRequested { request_id, kind });
        }

        let downloads: Vec<DetectionType> = types
            .iter()
            .filter(|t| {
                self.detectors
                    .get(t)
                    .map_or(false, |detector| !detector.is_loaded())
            })
            .copied()
            .collect();

        let total_stages = types.len() as f32;
        let mut total = 0;

        for (stage, detection_type) in types.iter().enumerate() {
            if detection_type.is_in_context() {
                continue;
            }
            if self.is_cancelled(request_id) {
                self.emit(ExecutorEvent::Cancelled { request_id });
                return;
            }

            let Some(detector) = self.detectors.get(detection_type) else {
                warn!("No executor detector registered for {}", detection_type);
                continue;
            };

            if let Some(slot) = downloads.iter().position(|t| t == detection_type) {
                self.load_model(request_id, detector.as_ref(), slot, downloads.len())
                    .await;
                if self.is_cancelled(request_id) {
                    self.emit(ExecutorEvent::Cancelled { request_id });
                    return;
                }
            }

            if !detector.is_loaded() {
                warn!("Skipping {} detection, model unavailable", detection_type);
                continue;
            }

            self.emit(ExecutorEvent::DetectionProgress {
                request_id,
                progress: stage as f32 / total_stages * 100.0,
                stage: detection_type.stage_label().to_string(),
            });

            let raw = match detector.detect(image.clone()).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("{} detection failed: {}", detection_type, e);
                    Vec::new()
                }
            };

            if self.is_cancelled(request_id) {
                self.emit(ExecutorEvent::Cancelled { request_id });
                return;
            }

            let detections: Vec<Detection> = raw
                .into_iter()
                .filter(|r| accept(*detection_type, r))
                .filter_map(|r| r.into_detection(*detection_type, width, height))
                .collect();

            debug!(
                request_id,
                "{} detection produced {} results",
                detection_type,
                detections.len()
            );

            if !detections.is_empty() {
                total += detections.len();
                self.emit(ExecutorEvent::PartialResults {
                    request_id,
                    detections,
                });
            }
        }

        self.emit(ExecutorEvent::Complete { request_id, total });
    }

    /// Load one model, mapping its download onto slot `slot` of `count`
    /// equal sub-ranges of the overall download progress
    async fn load_model(
        &self,
        request_id: RequestId,
        detector: &dyn ExecutorDetector,
        slot: usize,
        count: usize,
    ) {
        let span = 100.0 / count as f32;
        let start = slot as f32 * span;
        let detection_type = detector.detection_type();

        self.emit(ExecutorEvent::DownloadProgress {
            request_id,
            progress: start,
        });

        let events = self.events.clone();
        let report = move |progress: f32| {
            let _ = events.send(ExecutorEvent::DownloadProgress {
                request_id,
                progress: start + progress.clamp(0.0, 100.0) / 100.0 * span,
            });
        };

        let loaded = match detector.load(&report).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to load {} model: {}", detection_type, e);
                false
            }
        };

        self.emit(ExecutorEvent::DownloadProgress {
            request_id,
            progress: start + span,
        });
        self.emit(ExecutorEvent::ModelLoaded {
            request_id,
            detection_type,
            loaded,
        });
        if slot + 1 == count {
            self.emit(ExecutorEvent::DownloadComplete { request_id });
        }
    }
}
