// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Scripted evaluator, planner and applier for loop tests

use async_trait::async_trait;
use image::RgbaImage;
use pii_redactor::convergence::{Evaluation, Evaluator, LoopOrchestrator, LoopSession, Planner};
use pii_redactor::redaction::{PixelRedactor, PlannedRedaction, RedactionPlan, RedactionStyle};
use pii_redactor::remote::RemoteError;
use pii_redactor::session::{
    ApplyError, InMemoryHistory, InMemoryImageStore, KeyStore, MemoryKeyStore, RedactionApplier,
    API_KEY_NAME,
};
use pii_redactor::ConvergenceConfig;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub fn evaluation(score: f32, leaks: &[&str]) -> Evaluation {
    serde_json::from_value(serde_json::json!({
        "vaguenessScore": score,
        "visibleLeaks": leaks
            .iter()
            .map(|kind| serde_json::json!({"type": kind, "description": format!("visible {}", kind)}))
            .collect::<Vec<_>>(),
        "reasoning": "scripted"
    }))
    .unwrap()
}

pub fn redaction(x: u32, y: u32, width: u32, height: u32) -> PlannedRedaction {
    PlannedRedaction {
        style: RedactionStyle::Solid,
        x,
        y,
        width,
        height,
        intensity: 70,
        reason: "scripted".to_string(),
    }
}

pub fn plan(redactions: Vec<PlannedRedaction>) -> RedactionPlan {
    RedactionPlan {
        redactions,
        explanation: "scripted plan".to_string(),
    }
}

type Scripted<T> = Mutex<VecDeque<Result<T, RemoteError>>>;

/// Replays queued results; cancels the loop token on request
pub struct ScriptedEvaluator {
    responses: Scripted<Evaluation>,
    cancel_during_call: bool,
    stall_next: AtomicBool,
    pub calls: AtomicUsize,
}

impl ScriptedEvaluator {
    pub fn new(responses: Vec<Result<Evaluation, RemoteError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            cancel_during_call: false,
            stall_next: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn cancelling(mut self) -> Self {
        self.cancel_during_call = true;
        self
    }

    /// The first call hangs until its future is dropped
    pub fn stalling_once(self) -> Self {
        self.stall_next.store(true, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    async fn evaluate(
        &self,
        _api_key: &str,
        _image: &RgbaImage,
        cancel: &CancellationToken,
    ) -> Result<Evaluation, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.cancel_during_call {
            cancel.cancel();
        }
        if self.stall_next.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(evaluation(0.0, &["face"])))
    }
}

pub struct ScriptedPlanner {
    responses: Scripted<RedactionPlan>,
    pub calls: AtomicUsize,
}

impl ScriptedPlanner {
    pub fn new(responses: Vec<Result<RedactionPlan, RemoteError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(
        &self,
        _api_key: &str,
        _image: &RgbaImage,
        _evaluation: &Evaluation,
        _cancel: &CancellationToken,
    ) -> Result<RedactionPlan, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(RedactionPlan::empty("nothing left")))
    }
}

/// Fails every redaction whose reason is "reject"
pub struct PickyApplier {
    inner: PixelRedactor,
    pub applied: AtomicUsize,
}

impl PickyApplier {
    pub fn new() -> Self {
        Self {
            inner: PixelRedactor::new(),
            applied: AtomicUsize::new(0),
        }
    }
}

impl RedactionApplier for PickyApplier {
    fn apply(&self, image: &mut RgbaImage, redaction: &PlannedRedaction) -> Result<(), ApplyError> {
        if redaction.reason == "reject" {
            return Err(ApplyError::Failed("rejected by test".to_string()));
        }
        self.inner.apply(image, redaction)?;
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Harness {
    pub images: Arc<InMemoryImageStore>,
    pub history: Arc<InMemoryHistory>,
    pub keys: Arc<MemoryKeyStore>,
    pub applier: Arc<PickyApplier>,
}

impl Harness {
    pub fn new(width: u32, height: u32) -> Self {
        let white = RgbaImage::from_pixel(width, height, image::Rgba([255, 255, 255, 255]));
        let keys = Arc::new(MemoryKeyStore::new());
        keys.set(API_KEY_NAME, "sk-test");
        Self {
            images: Arc::new(InMemoryImageStore::new(Some(white))),
            history: Arc::new(InMemoryHistory::new()),
            keys,
            applier: Arc::new(PickyApplier::new()),
        }
    }

    pub fn session(&self) -> LoopSession {
        LoopSession {
            images: self.images.clone(),
            history: self.history.clone(),
            applier: self.applier.clone(),
            keys: self.keys.clone(),
        }
    }

    pub fn orchestrator(
        &self,
        evaluator: Arc<dyn Evaluator>,
        planner: Arc<dyn Planner>,
        config: ConvergenceConfig,
    ) -> LoopOrchestrator {
        LoopOrchestrator::new(evaluator, planner, self.session(), config)
    }
}
