// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Evaluator/planner loop types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::{DEFAULT_MAX_STEPS, DEFAULT_TARGET_SCORE};
use crate::detection::types::clamp_unit;
use crate::redaction::{PlannedRedaction, RedactionPlan};
use crate::remote::RemoteError;

/// Approximate area of a leak, as reported by the evaluator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeakRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisibleLeak {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<LeakRegion>,
}

/// One privacy assessment of the current image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    /// 0 = fully identifying, 1 = nothing identifying left
    pub vagueness_score: f32,
    pub visible_leaks: Vec<VisibleLeak>,
    pub reasoning: String,
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(|s| s.trim().to_string())
}

impl Evaluation {
    /// Build from the evaluator's raw JSON. The score is required and is
    /// clamped into [0, 1]; other fields are optional.
    pub fn from_value(value: &Value) -> Result<Self, RemoteError> {
        let score = value
            .get("vaguenessScore")
            .or_else(|| value.get("vagueness_score"))
            .and_then(number)
            .ok_or_else(|| RemoteError::parse("Evaluation is missing vaguenessScore"))?;

        let visible_leaks = value
            .get("visibleLeaks")
            .or_else(|| value.get("visible_leaks"))
            .and_then(|v| v.as_array())
            .map(|items| items.iter().filter_map(parse_leak).collect())
            .unwrap_or_default();

        Ok(Self {
            vagueness_score: clamp_unit(score as f32),
            visible_leaks,
            reasoning: string_field(value, "reasoning").unwrap_or_default(),
        })
    }
}

fn parse_leak(item: &Value) -> Option<VisibleLeak> {
    if !item.is_object() {
        return None;
    }

    let region = item.get("region").and_then(|r| {
        Some(LeakRegion {
            x: number(r.get("x")?)? as f32,
            y: number(r.get("y")?)? as f32,
            width: number(r.get("width")?)? as f32,
            height: number(r.get("height")?)? as f32,
        })
    });

    Some(VisibleLeak {
        kind: string_field(item, "type").unwrap_or_else(|| "unknown".to_string()),
        description: string_field(item, "description").unwrap_or_default(),
        region,
    })
}

/// Immutable record of one loop step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Iteration {
    pub step: u32,
    pub evaluation: Evaluation,
    pub plan: Option<RedactionPlan>,
    pub applied_redactions: Vec<PlannedRedaction>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Idle,
    Evaluating,
    Planning,
    Redacting,
    Completed,
    MaxSteps,
    Cancelled,
    Error,
}

/// Loop snapshot; the last run's outcome stays until cleared or restarted
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopState {
    /// Whether a key is stored; the key itself is never exposed here
    pub has_api_key: bool,
    pub target_score: f32,
    pub max_steps: u32,
    pub is_running: bool,
    pub status: LoopStatus,
    pub current_step: u32,
    pub current_score: Option<f32>,
    pub iterations: Vec<Iteration>,
    pub error: Option<String>,
}

impl Default for LoopState {
    fn default() -> Self {
        Self {
            has_api_key: false,
            target_score: DEFAULT_TARGET_SCORE,
            max_steps: DEFAULT_MAX_STEPS,
            is_running: false,
            status: LoopStatus::Idle,
            current_step: 0,
            current_score: None,
            iterations: Vec::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoopError {
    #[error("An API key is required")]
    MissingApiKey,

    #[error("No image loaded")]
    MissingImage,

    #[error("The loop is already running")]
    AlreadyRunning,

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
}
