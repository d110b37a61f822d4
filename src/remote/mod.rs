// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Remote inference for the evaluator/planner loop
//!
//! Components:
//! - `client` - authenticated chat-completions wrapper with cancellation
//! - `error` - failure taxonomy (auth, rate_limit, server, network, parse)
//! - `types` - role-tagged multimodal messages

pub mod client;
pub mod error;
pub mod types;

pub use client::{extract_error_message, parse_json_response, InferenceClient};
pub use error::{RemoteError, RemoteErrorKind};
pub use types::{CallOptions, ChatMessage, ContentPart, ImageUrl, MessageContent, Role};
