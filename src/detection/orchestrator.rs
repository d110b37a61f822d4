// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Detection run state machine
//!
//! The orchestrator owns the run state, dispatches work to the executor and
//! spawns the face and text detectors itself when the executor hands them
//! back. In-context detectors report over their own channel with the same
//! event type. Each run gets a fresh [`RequestId`]; events carrying any
//! other id are discarded.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::ModelCache;
use super::download::{DownloadError, ModelDownloader};
use super::error::{DetectionError, DetectorError};
use super::executor::{ExecutorDetector, ExecutorHandle};
use super::in_context::{
    FaceDetector, FaceDetectorConfig, InContextDetector, InContextProgress, TextDetector,
    TextDetectorConfig,
};
use super::messages::{ExecutorCommand, ExecutorEvent, InContextKind};
use super::object::OnnxObjectDetector;
use super::types::{
    clamp_unit, Detection, DetectionRun, DetectionStatus, DetectionType, DetectionUpdate,
    RequestId, SharedImage,
};
use crate::backend::{probe, CapabilitySource, OrtCapabilities};
use crate::config::DetectionConfig;
use crate::redaction::RedactionStyle;
use crate::session::EditCommand;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// A source of model downloads within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum DownloadSlot {
    Executor,
    InContext(InContextKind),
}

pub struct DetectionOrchestrator {
    executor: ExecutorHandle,
    events: mpsc::UnboundedReceiver<ExecutorEvent>,
    in_context_tx: mpsc::UnboundedSender<ExecutorEvent>,
    in_context_rx: mpsc::UnboundedReceiver<ExecutorEvent>,
    /// Stops this run's in-context tasks
    run_cancel: CancellationToken,
    /// Loading progress (0-100) per download source of the current run
    downloads: HashMap<DownloadSlot, f32>,
    face: Arc<dyn InContextDetector>,
    text: Arc<dyn InContextDetector>,
    run: DetectionRun,
    /// Model files already on disk, per type
    models_cached: HashMap<DetectionType, bool>,
    image: Option<SharedImage>,
    pending_in_context: HashSet<InContextKind>,
    executor_done: bool,
    cancelling: bool,
    next_request_id: RequestId,
    dispatched: bool,
    updates: broadcast::Sender<DetectionUpdate>,
}

impl DetectionOrchestrator {
    /// Spawns the executor, so this must be called inside a tokio runtime
    pub fn new(
        executor_detectors: Vec<Arc<dyn ExecutorDetector>>,
        face: Arc<dyn InContextDetector>,
        text: Arc<dyn InContextDetector>,
        capabilities: &dyn CapabilitySource,
    ) -> Self {
        let backend = probe(capabilities);

        let mut models_cached: HashMap<DetectionType, bool> = executor_detectors
            .iter()
            .map(|d| (d.detection_type(), d.is_cached()))
            .collect();
        models_cached.insert(DetectionType::Face, face.is_cached());
        models_cached.insert(DetectionType::Text, text.is_cached());

        let mut run = DetectionRun::new(backend);
        for detector in &executor_detectors {
            run.models_loaded
                .insert(detector.detection_type(), detector.is_loaded());
        }
        run.models_loaded.insert(DetectionType::Face, face.is_loaded());
        run.models_loaded.insert(DetectionType::Text, text.is_loaded());

        let (executor, events) = ExecutorHandle::spawn(executor_detectors);
        let (in_context_tx, in_context_rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        Self {
            executor,
            events,
            in_context_tx,
            in_context_rx,
            run_cancel: CancellationToken::new(),
            downloads: HashMap::new(),
            face,
            text,
            run,
            models_cached,
            image: None,
            pending_in_context: HashSet::new(),
            executor_done: false,
            cancelling: false,
            next_request_id: 0,
            dispatched: false,
            updates,
        }
    }

    /// ONNX-backed detectors sharing the process-wide model cache
    pub fn from_config(config: &DetectionConfig) -> Result<Self, DownloadError> {
        let downloader = Arc::new(ModelDownloader::new(&config.model_dir)?);
        let cache = ModelCache::global();

        let executor_detectors: Vec<Arc<dyn ExecutorDetector>> = vec![
            Arc::new(OnnxObjectDetector::license_plate(
                config.plate_model.clone(),
                downloader.clone(),
                cache.clone(),
            )),
            Arc::new(OnnxObjectDetector::document(
                config.document_model.clone(),
                downloader.clone(),
                cache.clone(),
            )),
        ];
        let face = Arc::new(FaceDetector::new(
            FaceDetectorConfig::new(config.face_model.clone()),
            downloader.clone(),
            cache.clone(),
        ));
        let text = Arc::new(TextDetector::new(
            TextDetectorConfig::new(
                config.ocr_detection_model.clone(),
                config.ocr_recognition_model.clone(),
                config.ocr_dictionary.clone(),
            ),
            downloader,
            cache,
        ));

        Ok(Self::new(executor_detectors, face, text, &OrtCapabilities))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DetectionUpdate> {
        self.updates.subscribe()
    }

    pub fn state(&self) -> &DetectionRun {
        &self.run
    }

    pub fn status(&self) -> DetectionStatus {
        self.run.status
    }

    pub fn results(&self) -> &[Detection] {
        &self.run.results
    }

    pub fn is_busy(&self) -> bool {
        self.run.status.is_active()
    }

    fn model_loaded(&self, detection_type: DetectionType) -> bool {
        self.run
            .models_loaded
            .get(&detection_type)
            .copied()
            .unwrap_or(false)
    }

    fn model_cached(&self, detection_type: DetectionType) -> bool {
        self.models_cached
            .get(&detection_type)
            .copied()
            .unwrap_or(false)
    }

    /// Whether starting with `types` would download any model
    pub fn requires_download(&self, types: &[DetectionType]) -> bool {
        types
            .iter()
            .any(|t| !self.model_loaded(*t) && !self.model_cached(*t))
    }

    fn publish(&self, update: DetectionUpdate) {
        let _ = self.updates.send(update);
    }

    fn set_status(&mut self, status: DetectionStatus) {
        if self.run.status != status {
            debug!("Detection status {:?} -> {:?}", self.run.status, status);
            self.run.status = status;
            self.publish(DetectionUpdate::StatusChanged(status));
        }
    }

    /// Begin a detection run.
    ///
    /// Rejected with no state change when a run is already active, the image
    /// is missing, no type is enabled, or a model download is needed without
    /// consent.
    pub fn start_detection(
        &mut self,
        image: Option<SharedImage>,
        enabled_types: &[DetectionType],
        consent_given: bool,
    ) -> Result<RequestId, DetectionError> {
        if self.is_busy() {
            return Err(DetectionError::Busy);
        }

        let image = image.ok_or_else(|| DetectionError::Validation("No image loaded".into()))?;
        let types = DetectionType::normalize(enabled_types);
        if types.is_empty() {
            return Err(DetectionError::Validation(
                "Select at least one detection type".into(),
            ));
        }
        if self.requires_download(&types) && !consent_given {
            return Err(DetectionError::Validation(
                "Model download requires consent".into(),
            ));
        }

        let request_id = self.next_request_id + 1;
        self.executor.send(ExecutorCommand::Detect {
            request_id,
            image: image.clone(),
            types: types.clone(),
            first_run: !self.dispatched,
        })?;
        self.next_request_id = request_id;
        self.dispatched = true;

        let downloads: HashMap<DownloadSlot, f32> = types
            .iter()
            .filter(|t| self.run.models_loaded.get(*t) == Some(&false))
            .map(|t| match InContextKind::from_type(*t) {
                Some(kind) => (DownloadSlot::InContext(kind), 0.0),
                None => (DownloadSlot::Executor, 0.0),
            })
            .collect();
        let needs_load = !downloads.is_empty();
        info!(
            request_id,
            types = ?types,
            needs_load,
            "Starting detection run"
        );

        self.run.request_id = Some(request_id);
        self.run.enabled_types = types.clone();
        self.run.results.clear();
        self.run.progress = 0.0;
        self.run.download_progress = 0.0;
        self.run.current_stage.clear();
        self.run.error = None;
        self.image = Some(image);
        self.pending_in_context = types
            .iter()
            .filter_map(|t| InContextKind::from_type(*t))
            .collect();
        self.executor_done = false;
        self.cancelling = false;
        self.downloads = downloads;
        self.run_cancel = CancellationToken::new();

        self.set_status(if needs_load {
            DetectionStatus::Downloading
        } else {
            DetectionStatus::Detecting
        });

        Ok(request_id)
    }

    /// Stop the current run. In-context detectors stop at their next stage;
    /// the run ends when the executor acknowledges. Results found so far
    /// are kept.
    pub fn cancel_detection(&mut self) -> Result<(), DetectionError> {
        let Some(request_id) = self.run.request_id else {
            return Ok(());
        };
        if self.cancelling {
            return Ok(());
        }

        info!(request_id, "Cancelling detection run");
        self.cancelling = true;
        self.run_cancel.cancel();
        self.executor.cancel(request_id)
    }

    /// Wait for the next event from the executor or an in-context detector.
    /// None once the executor has stopped.
    pub async fn next_event(&mut self) -> Option<ExecutorEvent> {
        tokio::select! {
            event = self.events.recv() => event,
            Some(event) = self.in_context_rx.recv() => Some(event),
        }
    }

    /// Process events until the current run ends
    pub async fn run_until_settled(&mut self) -> DetectionStatus {
        while self.run.request_id.is_some() {
            match self.next_event().await {
                Some(event) => self.handle_executor_event(event).await,
                None => self.fail("Detector executor stopped".to_string()),
            }
        }
        self.run.status
    }

    pub async fn handle_executor_event(&mut self, event: ExecutorEvent) {
        if self.run.request_id != Some(event.request_id()) {
            debug!(
                request_id = event.request_id(),
                "Ignoring stale executor event"
            );
            return;
        }
        if self.cancelling && !matches!(event, ExecutorEvent::Cancelled { .. }) {
            return;
        }

        match event {
            ExecutorEvent::DownloadProgress { progress, .. } => {
                self.record_download(DownloadSlot::Executor, progress);
            }
            ExecutorEvent::DownloadComplete { .. } => {
                self.record_download(DownloadSlot::Executor, 100.0);
            }
            ExecutorEvent::DetectionProgress { progress, stage, .. } => {
                if !self.downloading() {
                    self.set_status(DetectionStatus::Detecting);
                }
                self.set_progress(progress, stage);
            }
            ExecutorEvent::PartialResults { detections, .. } => {
                self.merge_results(detections);
            }
            ExecutorEvent::ModelLoaded {
                detection_type,
                loaded,
                ..
            } => self.mark_model(detection_type, loaded),
            ExecutorEvent::InContextRequested { request_id, kind } => {
                self.spawn_in_context(request_id, kind);
            }
            ExecutorEvent::InContextLoading { kind, progress, .. } => {
                let slot = DownloadSlot::InContext(kind);
                if self.downloads.contains_key(&slot) {
                    self.record_download(slot, progress);
                }
            }
            ExecutorEvent::InContextFinished {
                kind,
                detections,
                loaded,
                ..
            } => self.finish_in_context(kind, detections, loaded),
            ExecutorEvent::Complete { .. } => {
                self.executor_done = true;
                self.finish_if_settled();
            }
            ExecutorEvent::Error { message, .. } => self.fail(message),
            ExecutorEvent::Cancelled { request_id } => {
                info!(
                    request_id,
                    kept = self.run.results.len(),
                    "Detection run cancelled"
                );
                self.end_run();
                self.run.current_stage.clear();
                self.set_status(DetectionStatus::Cancelled);
                self.publish(DetectionUpdate::Cancelled);
            }
        }
    }

    /// Overall progress only moves forward within a run; the executor and
    /// in-context detectors report concurrently
    fn set_progress(&mut self, progress: f32, stage: String) {
        let progress = progress.clamp(0.0, 100.0).max(self.run.progress);
        self.run.progress = progress;
        self.run.current_stage = stage.clone();
        self.publish(DetectionUpdate::Progress { progress, stage });
    }

    fn mark_model(&mut self, detection_type: DetectionType, loaded: bool) {
        self.run.models_loaded.insert(detection_type, loaded);
        if loaded {
            self.models_cached.insert(detection_type, true);
        }
        self.publish(DetectionUpdate::ModelLoaded {
            detection_type,
            loaded,
        });
    }

    /// Append a batch, keeping only well-formed detections
    fn merge_results(&mut self, detections: Vec<Detection>) {
        let Some(image) = &self.image else {
            return;
        };
        let (width, height) = image.dimensions();

        let batch: Vec<Detection> = detections
            .into_iter()
            .filter(|d| d.bbox.is_within(width, height))
            .map(|mut d| {
                d.confidence = clamp_unit(d.confidence);
                d
            })
            .collect();

        if batch.is_empty() {
            return;
        }
        self.run.results.extend(batch.iter().cloned());
        self.publish(DetectionUpdate::Batch(batch));
    }

    fn downloading(&self) -> bool {
        self.downloads.values().any(|p| *p < 100.0)
    }

    /// Update one download source; the run's download progress is the mean
    /// over every source that had to load a model
    fn record_download(&mut self, slot: DownloadSlot, progress: f32) {
        let progress = progress.clamp(0.0, 100.0);
        let entry = self.downloads.entry(slot).or_insert(0.0);
        *entry = entry.max(progress);

        let overall = self.downloads.values().sum::<f32>() / self.downloads.len() as f32;
        self.run.download_progress = overall;
        self.publish(DetectionUpdate::DownloadProgress(overall));

        self.set_status(if self.downloading() {
            DetectionStatus::Downloading
        } else {
            DetectionStatus::Detecting
        });
    }

    /// Progress range of `detection_type` within the run's stages
    fn stage_range(&self, detection_type: DetectionType) -> (f32, f32) {
        let total = self.run.enabled_types.len().max(1) as f32;
        let index = self
            .run
            .enabled_types
            .iter()
            .position(|t| *t == detection_type)
            .unwrap_or(0);
        (index as f32 / total * 100.0, 100.0 / total)
    }

    /// Run an in-context detector on its own task. It reports through the
    /// in-context channel and stops when the run is cancelled.
    fn spawn_in_context(&self, request_id: RequestId, kind: InContextKind) {
        let Some(image) = self.image.clone() else {
            return;
        };
        let detector = match kind {
            InContextKind::Face => self.face.clone(),
            InContextKind::Text => self.text.clone(),
        };
        let detection_type = kind.detection_type();
        let (start, span) = self.stage_range(detection_type);
        let stage = detection_type.stage_label().to_string();
        let events = self.in_context_tx.clone();
        let cancel = self.run_cancel.clone();

        tokio::spawn(async move {
            let progress_events = events.clone();
            let report = move |progress: InContextProgress| {
                let event = match progress {
                    InContextProgress::Loading(progress) => ExecutorEvent::InContextLoading {
                        request_id,
                        kind,
                        progress: progress.clamp(0.0, 100.0),
                    },
                    InContextProgress::Detecting(progress) => ExecutorEvent::DetectionProgress {
                        request_id,
                        progress: start + progress.clamp(0.0, 100.0) / 100.0 * span,
                        stage: stage.clone(),
                    },
                };
                let _ = progress_events.send(event);
            };

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(DetectorError::Cancelled),
                result = detector.detect(image, &report, &cancel) => result,
            };

            let detections = match result {
                Ok(detections) => {
                    debug!(
                        request_id,
                        "{} detector returned {} detections",
                        detection_type,
                        detections.len()
                    );
                    detections
                }
                Err(DetectorError::Cancelled) => {
                    debug!(request_id, "{} detection cancelled", detection_type);
                    return;
                }
                Err(e) => {
                    warn!("{} detection failed: {}", detection_type, e);
                    Vec::new()
                }
            };

            let _ = events.send(ExecutorEvent::InContextFinished {
                request_id,
                kind,
                detections,
                loaded: detector.is_loaded(),
            });
        });
    }

    fn finish_in_context(&mut self, kind: InContextKind, detections: Vec<Detection>, loaded: bool) {
        self.merge_results(detections);
        self.mark_model(kind.detection_type(), loaded);

        let slot = DownloadSlot::InContext(kind);
        if self.downloads.get(&slot).is_some_and(|p| *p < 100.0) {
            self.record_download(slot, 100.0);
        }

        self.pending_in_context.remove(&kind);
        self.finish_if_settled();
    }

    fn finish_if_settled(&mut self) {
        if !self.executor_done || !self.pending_in_context.is_empty() {
            return;
        }
        let Some(request_id) = self.run.request_id else {
            return;
        };

        let total = self.run.results.len();
        info!(request_id, total, "Detection run completed");

        self.end_run();
        self.run.progress = 100.0;
        self.run.current_stage = "Complete".to_string();
        self.set_status(DetectionStatus::Idle);
        self.publish(DetectionUpdate::Completed { total });
    }

    fn fail(&mut self, message: String) {
        warn!("Detection run failed: {}", message);
        self.end_run();
        self.run.error = Some(message.clone());
        self.set_status(DetectionStatus::Error);
        self.publish(DetectionUpdate::Failed(message));
    }

    fn end_run(&mut self) {
        self.run_cancel.cancel();
        self.downloads.clear();
        self.run.request_id = None;
        self.image = None;
        self.pending_in_context.clear();
        self.executor_done = false;
        self.cancelling = false;
    }

    /// Flip one detection's selection; returns the new state
    pub fn toggle_selected(&mut self, id: &str) -> Option<bool> {
        let detection = self.run.results.iter_mut().find(|d| d.id == id)?;
        detection.selected = !detection.selected;
        Some(detection.selected)
    }

    pub fn set_all_selected(&mut self, selected: bool) {
        for detection in &mut self.run.results {
            detection.selected = selected;
        }
    }

    pub fn selected_detections(&self) -> Vec<Detection> {
        self.run
            .results
            .iter()
            .filter(|d| d.selected)
            .cloned()
            .collect()
    }

    /// Drop results from a finished run
    pub fn clear_results(&mut self) {
        if self.is_busy() {
            return;
        }
        self.run.results.clear();
        self.run.progress = 0.0;
        self.run.current_stage.clear();
        self.run.error = None;
        self.set_status(DetectionStatus::Idle);
    }

    /// Rectangle edits for every selected detection
    pub fn redaction_commands(&self, style: RedactionStyle, intensity: u8) -> Vec<EditCommand> {
        self.run
            .results
            .iter()
            .filter(|d| d.selected)
            .map(|d| EditCommand::Rect {
                style,
                region: d.bbox,
                intensity: intensity.clamp(1, 100),
                color: [0, 0, 0],
            })
            .collect()
    }

    /// Free every loaded model. In-context detectors close immediately;
    /// executor models are released in order after any queued work.
    pub fn release_models(&mut self) -> Result<(), DetectionError> {
        self.face.close();
        self.text.close();
        self.executor.send(ExecutorCommand::ReleaseModels)?;

        for loaded in self.run.models_loaded.values_mut() {
            *loaded = false;
        }
        info!("Detection models released");
        Ok(())
    }
}
