// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Evaluator/planner redaction loop
//!
//! The evaluator scores how identifying the current image still is, the
//! planner proposes rectangles to redact, and the orchestrator applies them
//! until the score reaches the target.

pub mod evaluator;
pub mod orchestrator;
pub mod planner;
pub mod types;

pub use evaluator::{encode_png_base64, Evaluator, RemoteEvaluator};
pub use orchestrator::{LoopOrchestrator, LoopSession};
pub use planner::{needs_plan, Planner, RemotePlanner, CONSERVATIVE_SCORE};
pub use types::{Evaluation, Iteration, LeakRegion, LoopError, LoopState, LoopStatus, VisibleLeak};
