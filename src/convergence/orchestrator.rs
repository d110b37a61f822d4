// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Evaluate -> plan -> redact loop
//!
//! One flow of control, one remote call in flight. The loop stops when the
//! evaluator's score reaches the target, when `max_steps` is exhausted, on
//! cancellation, or on the first remote failure.

use chrono::Utc;
use futures::FutureExt;
use image::RgbaImage;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::evaluator::{Evaluator, RemoteEvaluator};
use super::planner::{Planner, RemotePlanner};
use super::types::{Iteration, LoopError, LoopState, LoopStatus};
use crate::config::{ConvergenceConfig, RemoteConfig};
use crate::detection::types::clamp_unit;
use crate::redaction::{PlannedRedaction, RedactionPlan};
use crate::remote::{InferenceClient, RemoteError};
use crate::session::{
    EditCommand, ImageStore, KeyStore, RedactionApplier, UndoHistory, API_KEY_NAME,
};

/// Session collaborators the loop reads from and writes to
#[derive(Clone)]
pub struct LoopSession {
    pub images: Arc<dyn ImageStore>,
    pub history: Arc<dyn UndoHistory>,
    pub applier: Arc<dyn RedactionApplier>,
    pub keys: Arc<dyn KeyStore>,
}

/// Why a run stopped before finishing its steps
enum Abort {
    Remote(RemoteError),
    ImageUnavailable,
}

impl From<RemoteError> for Abort {
    fn from(e: RemoteError) -> Self {
        Abort::Remote(e)
    }
}

/// Ends a run as cancelled if its `start_loop` future is dropped early
struct RunGuard<'a> {
    orchestrator: &'a LoopOrchestrator,
    cancel: CancellationToken,
    armed: bool,
}

impl RunGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.cancel.cancel();
        warn!("Redaction loop dropped before finishing");
        self.orchestrator.finish(LoopStatus::Cancelled, None);
    }
}

pub struct LoopOrchestrator {
    evaluator: Arc<dyn Evaluator>,
    planner: Arc<dyn Planner>,
    session: LoopSession,
    state: Mutex<LoopState>,
    cancel: Mutex<CancellationToken>,
}

impl LoopOrchestrator {
    pub fn new(
        evaluator: Arc<dyn Evaluator>,
        planner: Arc<dyn Planner>,
        session: LoopSession,
        config: ConvergenceConfig,
    ) -> Self {
        let state = LoopState {
            target_score: clamp_unit(config.target_score),
            max_steps: config.max_steps.max(1),
            ..LoopState::default()
        };

        Self {
            evaluator,
            planner,
            session,
            state: Mutex::new(state),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Remote evaluator and planner sharing one HTTP client
    pub fn from_config(
        remote: &RemoteConfig,
        convergence: ConvergenceConfig,
        session: LoopSession,
    ) -> anyhow::Result<Self> {
        let client = Arc::new(InferenceClient::new(&remote.endpoint, remote.timeout())?);
        let evaluator = Arc::new(RemoteEvaluator::new(
            client.clone(),
            remote.evaluator_model.clone(),
        ));
        let planner = Arc::new(RemotePlanner::new(client, remote.planner_model.clone()));

        Ok(Self::new(evaluator, planner, session, convergence))
    }

    fn lock_state(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update<R>(&self, f: impl FnOnce(&mut LoopState) -> R) -> R {
        f(&mut self.lock_state())
    }

    fn stored_key(&self) -> Option<String> {
        self.session
            .keys
            .get(API_KEY_NAME)
            .filter(|key| !key.trim().is_empty())
    }

    pub fn state(&self) -> LoopState {
        let mut state = self.lock_state().clone();
        state.has_api_key = self.stored_key().is_some();
        state
    }

    pub fn status(&self) -> LoopStatus {
        self.lock_state().status
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().is_running
    }

    pub fn set_api_key(&self, key: &str) -> Result<(), LoopError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(LoopError::InvalidSettings(
                "API key must not be empty".to_string(),
            ));
        }
        self.session.keys.set(API_KEY_NAME, key);
        info!("API key stored");
        Ok(())
    }

    /// Forget the stored API key
    pub fn disconnect(&self) {
        self.session.keys.remove(API_KEY_NAME);
        info!("API key cleared");
    }

    /// Clamped into [0, 1]; takes effect on the next run
    pub fn set_target_score(&self, score: f32) {
        self.update(|s| s.target_score = clamp_unit(score));
    }

    pub fn set_max_steps(&self, steps: u32) -> Result<(), LoopError> {
        if steps == 0 {
            return Err(LoopError::InvalidSettings(
                "Max steps must be at least 1".to_string(),
            ));
        }
        self.update(|s| s.max_steps = steps);
        Ok(())
    }

    /// Reset the previous run's outcome; settings and the key are kept
    pub fn clear(&self) -> Result<(), LoopError> {
        self.update(|s| {
            if s.is_running {
                return Err(LoopError::AlreadyRunning);
            }
            s.status = LoopStatus::Idle;
            s.current_step = 0;
            s.current_score = None;
            s.iterations.clear();
            s.error = None;
            Ok(())
        })
    }

    /// Abort the running loop, including any in-flight remote call
    pub fn cancel_loop(&self) {
        if self.is_running() {
            info!("Cancelling redaction loop");
        }
        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).cancel();
    }

    /// Run the loop to a terminal status
    ///
    /// Validation failures return `Err` without touching state. Every other
    /// outcome, including remote failures, is reported through the returned
    /// status and [`LoopState::error`].
    pub async fn start_loop(&self) -> Result<LoopStatus, LoopError> {
        let (api_key, cancel, target_score, max_steps) = {
            let mut state = self.lock_state();
            if state.is_running {
                return Err(LoopError::AlreadyRunning);
            }
            let api_key = self.stored_key().ok_or(LoopError::MissingApiKey)?;
            if self.session.images.current().is_none() {
                return Err(LoopError::MissingImage);
            }

            state.is_running = true;
            state.status = LoopStatus::Evaluating;
            state.current_step = 0;
            state.current_score = None;
            state.iterations.clear();
            state.error = None;

            let cancel = CancellationToken::new();
            *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = cancel.clone();
            (api_key, cancel, state.target_score, state.max_steps)
        };

        let guard = RunGuard {
            orchestrator: self,
            cancel: cancel.clone(),
            armed: true,
        };
        info!(target_score, max_steps, "Redaction loop started");

        let run = self.run_steps(&api_key, &cancel, target_score, max_steps);
        let outcome = AssertUnwindSafe(run).catch_unwind().await;

        let status = match outcome {
            Ok(Ok(status)) => self.finish(status, None),
            Ok(Err(Abort::Remote(e))) => self.handle_remote_error(e),
            Ok(Err(Abort::ImageUnavailable)) => self.finish(
                LoopStatus::Error,
                Some("Image was removed during the loop".to_string()),
            ),
            Err(_) => {
                error!("Redaction loop panicked");
                self.finish(
                    LoopStatus::Error,
                    Some("Unexpected error during the redaction loop".to_string()),
                )
            }
        };
        guard.disarm();

        info!(status = ?status, "Redaction loop finished");
        Ok(status)
    }

    async fn run_steps(
        &self,
        api_key: &str,
        cancel: &CancellationToken,
        target_score: f32,
        max_steps: u32,
    ) -> Result<LoopStatus, Abort> {
        for step in 1..=max_steps {
            if cancel.is_cancelled() {
                return Ok(LoopStatus::Cancelled);
            }

            let image = self.session.images.current().ok_or(Abort::ImageUnavailable)?;
            self.update(|s| {
                s.current_step = step;
                s.status = LoopStatus::Evaluating;
            });

            let mut evaluation = self.evaluator.evaluate(api_key, &image, cancel).await?;
            if cancel.is_cancelled() {
                return Ok(LoopStatus::Cancelled);
            }

            let score = clamp_unit(evaluation.vagueness_score);
            evaluation.vagueness_score = score;
            self.update(|s| s.current_score = Some(score));
            info!(
                step,
                score,
                leaks = evaluation.visible_leaks.len(),
                "Evaluation complete"
            );

            if score >= target_score {
                self.record(Iteration {
                    step,
                    evaluation,
                    plan: None,
                    applied_redactions: Vec::new(),
                    timestamp: Utc::now(),
                });
                return Ok(LoopStatus::Completed);
            }

            self.update(|s| s.status = LoopStatus::Planning);
            let plan = self.planner.plan(api_key, &image, &evaluation, cancel).await?;
            if cancel.is_cancelled() {
                return Ok(LoopStatus::Cancelled);
            }

            self.update(|s| s.status = LoopStatus::Redacting);
            let applied = self.apply_plan(step, &plan);
            info!(
                step,
                planned = plan.len(),
                applied = applied.len(),
                "Redactions applied"
            );

            self.record(Iteration {
                step,
                evaluation,
                plan: Some(plan),
                applied_redactions: applied,
                timestamp: Utc::now(),
            });
        }

        Ok(LoopStatus::MaxSteps)
    }

    /// Apply each redaction to the current image; failures are skipped
    fn apply_plan(&self, step: u32, plan: &RedactionPlan) -> Vec<PlannedRedaction> {
        let mut applied = Vec::with_capacity(plan.len());

        for redaction in &plan.redactions {
            let Some(current) = self.session.images.current() else {
                warn!(step, "Image disappeared while applying redactions");
                break;
            };
            let mut working: RgbaImage = (*current).clone();

            match self.session.applier.apply(&mut working, redaction) {
                Ok(()) => {
                    self.session.images.update_current(working);
                    self.session
                        .history
                        .push(EditCommand::from_redaction(redaction));
                    applied.push(redaction.clone());
                }
                Err(e) => {
                    warn!(
                        step,
                        style = %redaction.style,
                        reason = %redaction.reason,
                        "Skipping redaction: {}",
                        e
                    );
                }
            }
        }

        applied
    }

    fn record(&self, iteration: Iteration) {
        self.update(|s| s.iterations.push(iteration));
    }

    fn handle_remote_error(&self, e: RemoteError) -> LoopStatus {
        if e.is_cancelled() {
            return self.finish(LoopStatus::Cancelled, None);
        }

        error!(kind = %e.kind, status = ?e.status, "Remote call failed: {}", e.message);
        if e.is_auth() {
            self.session.keys.remove(API_KEY_NAME);
            warn!("Stored API key was rejected and has been cleared");
        }
        self.finish(LoopStatus::Error, Some(e.to_string()))
    }

    fn finish(&self, status: LoopStatus, error: Option<String>) -> LoopStatus {
        self.update(|s| {
            s.status = status;
            s.is_running = false;
            s.error = error;
        });
        status
    }
}
