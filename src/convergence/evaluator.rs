// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Evaluator ("Lisa"): scores how identifying an image still is

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::{ImageFormat, RgbaImage};
use std::io::Cursor;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::types::Evaluation;
use crate::remote::{
    parse_json_response, CallOptions, ChatMessage, ContentPart, InferenceClient, RemoteError,
};

const EVALUATOR_SYSTEM_PROMPT: &str = r#"You are a privacy auditor reviewing an image before it is shared publicly.
Judge how much personally identifiable information is still visible: faces, names and other readable text, license plates, documents, screens, addresses, uniforms or badges, distinctive landmarks.

Respond with a single JSON object and nothing else:
{
  "vaguenessScore": number between 0 and 1 (0 = fully identifying, 1 = nothing identifying remains),
  "visibleLeaks": [
    {"type": "face|text|license_plate|document|screen|location|other",
     "description": "what is visible",
     "region": {"x": number, "y": number, "width": number, "height": number}}
  ],
  "reasoning": "short justification for the score"
}
Regions are in image pixels and may be omitted when the leak has no clear location.
Report an empty visibleLeaks list when nothing identifying is left."#;

pub fn evaluator_options() -> CallOptions {
    CallOptions {
        temperature: 0.2,
        max_tokens: 1500,
        json_mode: true,
    }
}

/// PNG-encode an image for an inline data URL
pub fn encode_png_base64(image: &RgbaImage) -> Result<String, RemoteError> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|e| RemoteError::parse(format!("Failed to encode image: {}", e)))?;
    Ok(BASE64.encode(bytes))
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(
        &self,
        api_key: &str,
        image: &RgbaImage,
        cancel: &CancellationToken,
    ) -> Result<Evaluation, RemoteError>;
}

/// Evaluator backed by a remote vision model
pub struct RemoteEvaluator {
    client: Arc<InferenceClient>,
    model: String,
}

impl RemoteEvaluator {
    pub fn new(client: Arc<InferenceClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    pub fn messages(image_base64: &str, width: u32, height: u32) -> Vec<ChatMessage> {
        vec![
            ChatMessage::system(EVALUATOR_SYSTEM_PROMPT),
            ChatMessage::user_parts(vec![
                ContentPart::text(format!(
                    "Evaluate this {}x{} image for remaining identifying information.",
                    width, height
                )),
                ContentPart::png_base64(image_base64),
            ]),
        ]
    }
}

#[async_trait]
impl Evaluator for RemoteEvaluator {
    async fn evaluate(
        &self,
        api_key: &str,
        image: &RgbaImage,
        cancel: &CancellationToken,
    ) -> Result<Evaluation, RemoteError> {
        let encoded = encode_png_base64(image)?;
        let messages = Self::messages(&encoded, image.width(), image.height());

        let content = self
            .client
            .call_model(api_key, &self.model, &messages, &evaluator_options(), cancel)
            .await?;
        let evaluation = Evaluation::from_value(&parse_json_response(&content)?)?;

        debug!(
            score = evaluation.vagueness_score,
            leaks = evaluation.visible_leaks.len(),
            "Evaluation received"
        );
        Ok(evaluation)
    }
}
