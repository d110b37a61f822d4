// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Planner ("Ralph"): proposes a minimal set of redactions

use async_trait::async_trait;
use image::RgbaImage;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::evaluator::encode_png_base64;
use super::types::Evaluation;
use crate::redaction::{validate_plan, RedactionPlan};
use crate::remote::{
    parse_json_response, CallOptions, ChatMessage, ContentPart, InferenceClient, RemoteError,
};

/// Above this score the image is left alone even if leaks were reported
pub const CONSERVATIVE_SCORE: f32 = 0.9;

const PLANNER_SYSTEM_PROMPT: &str = r#"You plan redactions that remove identifying information from an image while keeping it as useful as possible.
You receive the image, its size and a privacy auditor's findings. Propose the smallest set of rectangles that hides every reported leak. Never redact the whole image.

Respond with a single JSON object and nothing else:
{
  "redactions": [
    {"style": "solid|pixelate|blur",
     "x": integer, "y": integer, "width": integer, "height": integer,
     "intensity": integer between 1 and 100,
     "reason": "which leak this hides"}
  ],
  "explanation": "short summary of the plan"
}
Coordinates are image pixels with the origin at the top-left corner."#;

pub fn planner_options() -> CallOptions {
    CallOptions {
        temperature: 0.3,
        max_tokens: 2000,
        json_mode: true,
    }
}

/// Planning is skipped when nothing leaks or the image is already vague
pub fn needs_plan(evaluation: &Evaluation) -> bool {
    !evaluation.visible_leaks.is_empty() && evaluation.vagueness_score < CONSERVATIVE_SCORE
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Planner: Send + Sync {
    /// Returned plans are already validated against the image bounds
    async fn plan(
        &self,
        api_key: &str,
        image: &RgbaImage,
        evaluation: &Evaluation,
        cancel: &CancellationToken,
    ) -> Result<RedactionPlan, RemoteError>;
}

pub struct RemotePlanner {
    client: Arc<InferenceClient>,
    model: String,
}

impl RemotePlanner {
    pub fn new(client: Arc<InferenceClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    pub fn messages(
        image_base64: &str,
        width: u32,
        height: u32,
        evaluation: &Evaluation,
    ) -> Result<Vec<ChatMessage>, RemoteError> {
        let findings = serde_json::to_string_pretty(evaluation)
            .map_err(|e| RemoteError::parse(format!("Failed to encode findings: {}", e)))?;

        Ok(vec![
            ChatMessage::system(PLANNER_SYSTEM_PROMPT),
            ChatMessage::user_parts(vec![
                ContentPart::text(format!(
                    "Image size: {}x{} pixels.\nAuditor findings:\n{}",
                    width, height, findings
                )),
                ContentPart::png_base64(image_base64),
            ]),
        ])
    }
}

#[async_trait]
impl Planner for RemotePlanner {
    async fn plan(
        &self,
        api_key: &str,
        image: &RgbaImage,
        evaluation: &Evaluation,
        cancel: &CancellationToken,
    ) -> Result<RedactionPlan, RemoteError> {
        if !needs_plan(evaluation) {
            debug!(
                score = evaluation.vagueness_score,
                "Skipping planning, nothing worth redacting"
            );
            return Ok(RedactionPlan::empty("No redactions needed"));
        }

        let (width, height) = image.dimensions();
        let encoded = encode_png_base64(image)?;
        let messages = Self::messages(&encoded, width, height, evaluation)?;

        let content = self
            .client
            .call_model(api_key, &self.model, &messages, &planner_options(), cancel)
            .await?;
        let plan = validate_plan(&parse_json_response(&content)?, width, height);

        debug!(redactions = plan.len(), "Plan received");
        Ok(plan)
    }
}
