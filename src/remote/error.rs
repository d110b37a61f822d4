// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Error taxonomy for remote evaluator/planner calls

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Category of a remote call failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// 401/403 - the stored key is rejected
    Auth,
    /// 429
    RateLimit,
    /// 5xx and any other unexpected HTTP status
    Server,
    /// Connection failure or cancelled request
    Network,
    /// Malformed JSON or missing fields
    Parse,
}

impl RemoteErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteErrorKind::Auth => "auth",
            RemoteErrorKind::RateLimit => "rate_limit",
            RemoteErrorKind::Server => "server",
            RemoteErrorKind::Network => "network",
            RemoteErrorKind::Parse => "parse",
        }
    }

    /// Map a non-2xx HTTP status to its category
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => RemoteErrorKind::Auth,
            429 => RemoteErrorKind::RateLimit,
            _ => RemoteErrorKind::Server,
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified remote call failure
#[derive(Debug, Clone, Error)]
#[error("{kind} error: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
    /// HTTP status when the server answered
    pub status: Option<u16>,
    cancelled: bool,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            cancelled: false,
        }
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(RemoteErrorKind::from_status(status), message)
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Network, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Parse, message)
    }

    /// The request was aborted through its cancel token
    pub fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Self::network("Request cancelled")
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn is_auth(&self) -> bool {
        self.kind == RemoteErrorKind::Auth
    }

    /// Whether a caller-initiated retry can reasonably succeed
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            RemoteErrorKind::RateLimit => true,
            RemoteErrorKind::Server => self.status.map_or(true, |s| s >= 500),
            _ => false,
        }
    }
}
