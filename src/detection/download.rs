// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Model file downloads with checksum verification and retry

use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const HUGGINGFACE_BASE_URL: &str = "https://huggingface.co";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DownloadSource {
    HuggingFace {
        repo_id: String,
        filename: String,
        #[serde(default)]
        revision: Option<String>,
    },
    Http {
        url: String,
    },
}

impl DownloadSource {
    pub fn url(&self) -> String {
        match self {
            DownloadSource::HuggingFace {
                repo_id,
                filename,
                revision,
            } => format!(
                "{}/{}/resolve/{}/{}",
                HUGGINGFACE_BASE_URL,
                repo_id,
                revision.as_deref().unwrap_or("main"),
                filename
            ),
            DownloadSource::Http { url } => url.clone(),
        }
    }

    /// Last path segment of the remote file
    pub fn file_name(&self) -> String {
        let path = match self {
            DownloadSource::HuggingFace { filename, .. } => filename.clone(),
            DownloadSource::Http { url } => url::Url::parse(url)
                .map(|u| u.path().to_string())
                .unwrap_or_else(|_| url.clone()),
        };
        path.rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or("model.onnx")
            .to_string()
    }
}

/// A model file the detectors depend on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Stable id; also the cache directory and the session cache key
    pub id: String,
    pub source: DownloadSource,
    /// Lowercase hex SHA-256 of the file, verified after download when set
    #[serde(default)]
    pub sha256: Option<String>,
}

impl ModelSpec {
    pub fn new(id: impl Into<String>, source: DownloadSource) -> Self {
        Self {
            id: id.into(),
            source,
            sha256: None,
        }
    }

    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = Some(sha256.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            exponential_base: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for(&self, attempt: usize) -> Duration {
        let delay = self.initial_delay_ms as f64 * self.exponential_base.powi(attempt as i32);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }
}

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP error: status {status}")]
    Http { status: u16 },
    #[error("IO error: {0}")]
    Io(String),
    #[error("Checksum mismatch - expected: {expected}, actual: {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("Max retries exceeded: {attempts} attempts, last error: {last}")]
    MaxRetriesExceeded { attempts: usize, last: String },
}

impl DownloadError {
    fn is_transient(&self) -> bool {
        match self {
            DownloadError::Network(_) => true,
            DownloadError::Http { status } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(e: std::io::Error) -> Self {
        DownloadError::Io(e.to_string())
    }
}

/// Fetches model files into a local directory, one file per [`ModelSpec`]
#[derive(Debug, Clone)]
pub struct ModelDownloader {
    client: Client,
    model_dir: PathBuf,
    retry_policy: RetryPolicy,
}

impl ModelDownloader {
    pub fn new(model_dir: impl Into<PathBuf>) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DownloadError::Network(e.to_string()))?;

        Ok(Self {
            client,
            model_dir: model_dir.into(),
            retry_policy: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn local_path(&self, spec: &ModelSpec) -> PathBuf {
        self.model_dir.join(&spec.id).join(spec.source.file_name())
    }

    /// The file is already on disk and needs no download
    pub fn is_cached(&self, spec: &ModelSpec) -> bool {
        self.local_path(spec).is_file()
    }

    /// Return the local path of `spec`, downloading it first if needed.
    ///
    /// `progress` receives 0-100; 100 is only reported once the file is in
    /// place.
    pub async fn ensure(
        &self,
        spec: &ModelSpec,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<PathBuf, DownloadError> {
        let path = self.local_path(spec);
        if path.is_file() {
            debug!("Model {} already cached at {:?}", spec.id, path);
            progress(100.0);
            return Ok(path);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!("Downloading model {} from {}", spec.id, spec.source.url());
        let mut attempt = 0;
        loop {
            match self.download_once(spec, &path, progress).await {
                Ok(()) => {
                    info!("Model {} ready at {:?}", spec.id, path);
                    progress(100.0);
                    return Ok(path);
                }
                Err(e) if e.is_transient() => {
                    if attempt >= self.retry_policy.max_retries {
                        return Err(DownloadError::MaxRetriesExceeded {
                            attempts: attempt + 1,
                            last: e.to_string(),
                        });
                    }
                    let delay = self.retry_policy.delay_for(attempt);
                    warn!(
                        "Download of {} failed (attempt {}): {}, retrying in {:?}",
                        spec.id,
                        attempt + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn download_once(
        &self,
        spec: &ModelSpec,
        path: &Path,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<(), DownloadError> {
        let response = self
            .client
            .get(spec.source.url())
            .send()
            .await
            .map_err(|e| DownloadError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Http {
                status: status.as_u16(),
            });
        }

        let total = response.content_length().filter(|len| *len > 0);
        let part_path = partial_path(path);
        let mut file = tokio::fs::File::create(&part_path).await?;
        let mut hasher = Sha256::new();
        let mut downloaded: u64 = 0;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| DownloadError::Network(e.to_string()))?;
            file.write_all(&chunk).await?;
            hasher.update(&chunk);
            downloaded += chunk.len() as u64;

            if let Some(total) = total {
                progress((downloaded as f32 / total as f32 * 100.0).min(99.0));
            }
        }
        file.flush().await?;
        drop(file);

        if let Some(expected) = &spec.sha256 {
            let actual = hex::encode(hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected) {
                let _ = tokio::fs::remove_file(&part_path).await;
                return Err(DownloadError::ChecksumMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        tokio::fs::rename(&part_path, path).await?;
        debug!("Downloaded {} bytes for {}", downloaded, spec.id);
        Ok(())
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}
