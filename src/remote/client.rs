// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Authenticated client for an OpenAI-compatible chat completions API

use reqwest::Client;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::RemoteError;
use super::types::{CallOptions, ChatMessage, ChatRequest, ChatResponse, ResponseFormat};

const MAX_ERROR_BODY_CHARS: usize = 200;

/// Client for the remote evaluator/planner models
#[derive(Debug, Clone)]
pub struct InferenceClient {
    client: Client,
    endpoint: String,
}

impl InferenceClient {
    /// Create a new client
    ///
    /// No request timeout is applied unless `timeout` is given; cancellation
    /// is the only early exit.
    pub fn new(endpoint: &str, timeout: Option<Duration>) -> anyhow::Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;

        let endpoint = endpoint.trim_end_matches('/').to_string();
        info!("Inference client configured: endpoint={}", endpoint);

        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.endpoint)
    }

    /// Issue one chat completion and return the textual content
    ///
    /// The request is dropped (and the connection aborted) as soon as
    /// `cancel` fires.
    pub async fn call_model(
        &self,
        api_key: &str,
        model: &str,
        messages: &[ChatMessage],
        options: &CallOptions,
        cancel: &CancellationToken,
    ) -> Result<String, RemoteError> {
        if cancel.is_cancelled() {
            return Err(RemoteError::cancelled());
        }

        let request = ChatRequest {
            model,
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            response_format: options.json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        let url = self.completions_url();
        debug!(model, "POST {}", url);

        let call = async {
            let response = self
                .client
                .post(&url)
                .bearer_auth(api_key)
                .json(&request)
                .send()
                .await
                .map_err(|e| RemoteError::network(format!("Request failed: {}", e)))?;

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| RemoteError::network(format!("Failed to read response: {}", e)))?;

            if !status.is_success() {
                let message = extract_error_message(&body)
                    .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
                return Err(RemoteError::from_status(status.as_u16(), message));
            }

            let parsed: ChatResponse = serde_json::from_str(&body)
                .map_err(|e| RemoteError::parse(format!("Invalid response body: {}", e)))?;

            parsed
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.message.content)
                .filter(|content| !content.trim().is_empty())
                .ok_or_else(|| RemoteError::parse("Response contained no content"))
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RemoteError::cancelled()),
            result = call => result,
        }
    }
}

/// Pull a human-readable message out of an error response body
pub fn extract_error_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        let message = json
            .pointer("/error/message")
            .or_else(|| json.get("error").filter(|e| e.is_string()))
            .or_else(|| json.get("message"))
            .and_then(|m| m.as_str())
            .map(str::trim)
            .filter(|m| !m.is_empty());
        if let Some(message) = message {
            return Some(message.to_string());
        }
    }

    Some(trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect())
}

/// Strip one surrounding code fence (if any) and parse the text as JSON
pub fn parse_json_response(text: &str) -> Result<serde_json::Value, RemoteError> {
    let body = strip_code_fence(text.trim());

    serde_json::from_str(body)
        .map_err(|e| RemoteError::parse(format!("Failed to parse JSON response: {}", e)))
}

/// Drop a leading fence line and a trailing fence independently, so an
/// unterminated fence or trailing prose after the closing fence still parses
fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text.strip_suffix("```").unwrap_or(text).trim();
    };

    // The info string ("json", "JSON", ...) runs to the end of the first line
    let body = match rest.split_once('\n') {
        Some((info, after)) if !info.trim_start().starts_with(|c: char| c == '{' || c == '[') => {
            after
        }
        _ => rest,
    };

    match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}
