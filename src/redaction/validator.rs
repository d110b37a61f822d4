// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Sanitizes raw planner output against the image bounds
//!
//! Every emitted redaction satisfies `0 <= x < width`, `0 <= y < height`,
//! `x + w <= width`, `y + h <= height` with `w, h >= 1`. Validating an
//! already-valid plan returns it unchanged.

use serde_json::Value;
use tracing::debug;

use super::plan::{PlannedRedaction, RedactionPlan, RedactionStyle};

/// Intensity used when the planner omits one or sends garbage
pub const DEFAULT_INTENSITY: u8 = 70;

/// Reason used when the planner omits one
pub const DEFAULT_REASON: &str = "Privacy redaction";

/// Validate a raw planner response into a plan that is safe to apply
pub fn validate_plan(raw: &Value, image_width: u32, image_height: u32) -> RedactionPlan {
    let explanation = raw
        .get("explanation")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    if image_width == 0 || image_height == 0 {
        return RedactionPlan::empty(explanation);
    }

    let items = match raw.get("redactions").and_then(Value::as_array) {
        Some(items) => items.as_slice(),
        None => &[],
    };

    let redactions: Vec<PlannedRedaction> = items
        .iter()
        .filter_map(|item| validate_item(item, image_width, image_height))
        .collect();

    if redactions.len() != items.len() {
        debug!(
            "Dropped {} degenerate redactions from plan",
            items.len() - redactions.len()
        );
    }

    RedactionPlan {
        redactions,
        explanation,
    }
}

fn validate_item(item: &Value, image_width: u32, image_height: u32) -> Option<PlannedRedaction> {
    let style = item
        .get("style")
        .and_then(Value::as_str)
        .and_then(RedactionStyle::parse)
        .unwrap_or_default();

    let max_x = image_width as i64 - 1;
    let max_y = image_height as i64 - 1;

    let x = round_number(item.get("x")?)?.clamp(0, max_x);
    let y = round_number(item.get("y")?)?.clamp(0, max_y);

    let width = round_number(item.get("width")?)?
        .min(image_width as i64 - x)
        .max(1);
    let height = round_number(item.get("height")?)?
        .min(image_height as i64 - y)
        .max(1);

    if width <= 0 || height <= 0 {
        return None;
    }

    let intensity = item
        .get("intensity")
        .and_then(round_number)
        .map(|v| v.clamp(1, 100) as u8)
        .unwrap_or(DEFAULT_INTENSITY);

    let reason = item
        .get("reason")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or(DEFAULT_REASON)
        .to_string();

    Some(PlannedRedaction {
        style,
        x: x as u32,
        y: y as u32,
        width: width as u32,
        height: height as u32,
        intensity,
        reason,
    })
}

/// Coerce a JSON number or numeric string into a rounded integer
fn round_number(value: &Value) -> Option<i64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };

    if !n.is_finite() {
        return None;
    }

    Some(n.round().clamp(i64::MIN as f64, i64::MAX as f64) as i64)
}
