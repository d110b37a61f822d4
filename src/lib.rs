// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod backend;
pub mod config;
pub mod convergence;
pub mod detection;
pub mod logging;
pub mod redaction;
pub mod remote;
pub mod session;

// Re-export main types
pub use backend::{probe, Backend, CapabilitySource, OrtCapabilities};
pub use config::{ConvergenceConfig, DetectionConfig, RedactorConfig, RemoteConfig};
pub use convergence::{
    Evaluation, Evaluator, Iteration, LoopError, LoopOrchestrator, LoopSession, LoopState,
    LoopStatus, Planner, RemoteEvaluator, RemotePlanner, VisibleLeak,
};
pub use detection::{
    BoundingBox, Detection, DetectionError, DetectionOrchestrator, DetectionRun,
    DetectionStatus, DetectionType, DetectionUpdate,
};
pub use redaction::{
    validate_plan, PixelRedactor, PlannedRedaction, RedactionPlan, RedactionStyle,
};
pub use remote::{InferenceClient, RemoteError, RemoteErrorKind};
pub use session::{
    EditCommand, ImageStore, InMemoryHistory, InMemoryImageStore, KeyStore, MemoryKeyStore,
    RedactionApplier, UndoHistory,
};
