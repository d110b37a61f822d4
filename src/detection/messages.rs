// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Message protocol between the orchestrator and the detector executor

use super::types::{Detection, DetectionType, RequestId, SharedImage};

/// Detectors the executor hands back to the orchestrator's own context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InContextKind {
    Face,
    Text,
}

impl InContextKind {
    pub fn from_type(detection_type: DetectionType) -> Option<Self> {
        match detection_type {
            DetectionType::Face => Some(InContextKind::Face),
            DetectionType::Text => Some(InContextKind::Text),
            _ => None,
        }
    }

    pub fn detection_type(&self) -> DetectionType {
        match self {
            InContextKind::Face => DetectionType::Face,
            InContextKind::Text => DetectionType::Text,
        }
    }
}

/// Orchestrator -> executor
#[derive(Debug, Clone)]
pub enum ExecutorCommand {
    Detect {
        request_id: RequestId,
        image: SharedImage,
        types: Vec<DetectionType>,
        /// Report which models are already resident before any work starts
        first_run: bool,
    },
    Cancel {
        request_id: RequestId,
    },
    ReleaseModels,
    Shutdown,
}

/// Executor (or in-context detector task) -> orchestrator. Every event is
/// correlated to one run.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorEvent {
    DownloadProgress {
        request_id: RequestId,
        progress: f32,
    },
    DownloadComplete {
        request_id: RequestId,
    },
    DetectionProgress {
        request_id: RequestId,
        progress: f32,
        stage: String,
    },
    PartialResults {
        request_id: RequestId,
        detections: Vec<Detection>,
    },
    ModelLoaded {
        request_id: RequestId,
        detection_type: DetectionType,
        loaded: bool,
    },
    InContextRequested {
        request_id: RequestId,
        kind: InContextKind,
    },
    /// Model loading progress of an in-context detector, 0-100
    InContextLoading {
        request_id: RequestId,
        kind: InContextKind,
        progress: f32,
    },
    /// An in-context detector is done; failures arrive with no detections
    InContextFinished {
        request_id: RequestId,
        kind: InContextKind,
        detections: Vec<Detection>,
        loaded: bool,
    },
    Complete {
        request_id: RequestId,
        total: usize,
    },
    Error {
        request_id: RequestId,
        message: String,
    },
    Cancelled {
        request_id: RequestId,
    },
}

impl ExecutorEvent {
    pub fn request_id(&self) -> RequestId {
        match self {
            ExecutorEvent::DownloadProgress { request_id, .. }
            | ExecutorEvent::DownloadComplete { request_id }
            | ExecutorEvent::DetectionProgress { request_id, .. }
            | ExecutorEvent::PartialResults { request_id, .. }
            | ExecutorEvent::ModelLoaded { request_id, .. }
            | ExecutorEvent::InContextRequested { request_id, .. }
            | ExecutorEvent::InContextLoading { request_id, .. }
            | ExecutorEvent::InContextFinished { request_id, .. }
            | ExecutorEvent::Complete { request_id, .. }
            | ExecutorEvent::Error { request_id, .. }
            | ExecutorEvent::Cancelled { request_id } => *request_id,
        }
    }
}
