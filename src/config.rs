// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Configuration for detection models, the remote endpoint and the
//! evaluator/planner loop

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detection::{DownloadSource, ModelSpec};

pub const DEFAULT_REMOTE_ENDPOINT: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_EVALUATOR_MODEL: &str = "openai/gpt-4o";
pub const DEFAULT_PLANNER_MODEL: &str = "openai/gpt-4o";
pub const DEFAULT_TARGET_SCORE: f32 = 0.7;
pub const DEFAULT_MAX_STEPS: u32 = 5;

fn huggingface(id: &str, repo_id: &str, filename: &str) -> ModelSpec {
    ModelSpec::new(
        id,
        DownloadSource::HuggingFace {
            repo_id: repo_id.to_string(),
            filename: filename.to_string(),
            revision: None,
        },
    )
}

/// Replace a model's source with a plain URL from the environment
fn env_model(var: &str, default: ModelSpec) -> ModelSpec {
    match env::var(var) {
        Ok(url) if !url.trim().is_empty() => ModelSpec {
            source: DownloadSource::Http {
                url: url.trim().to_string(),
            },
            sha256: None,
            ..default
        },
        _ => default,
    }
}

/// Model locations for the local detectors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub model_dir: PathBuf,
    pub face_model: ModelSpec,
    pub plate_model: ModelSpec,
    pub document_model: ModelSpec,
    pub ocr_detection_model: ModelSpec,
    pub ocr_recognition_model: ModelSpec,
    pub ocr_dictionary: ModelSpec,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("./models"),
            face_model: huggingface("face-yolov8n", "deepghs/yolo-face", "yolov8n-face/model.onnx"),
            plate_model: huggingface(
                "plate-yolov8n",
                "morsetechlab/yolov11-license-plate-detection",
                "license-plate-finetune-v1n.onnx",
            ),
            document_model: huggingface("coco-yolov8n", "Kalray/yolov8", "yolov8n.onnx"),
            ocr_detection_model: huggingface(
                "ocr-det",
                "monkt/paddleocr-onnx",
                "detection/v5/det.onnx",
            ),
            ocr_recognition_model: huggingface(
                "ocr-rec-en",
                "monkt/paddleocr-onnx",
                "languages/english/rec.onnx",
            ),
            ocr_dictionary: huggingface(
                "ocr-dict-en",
                "monkt/paddleocr-onnx",
                "languages/english/dict.txt",
            ),
        }
    }
}

impl DetectionConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            model_dir: env::var("PII_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_dir),
            face_model: env_model("PII_FACE_MODEL_URL", defaults.face_model),
            plate_model: env_model("PII_PLATE_MODEL_URL", defaults.plate_model),
            document_model: env_model("PII_DOCUMENT_MODEL_URL", defaults.document_model),
            ocr_detection_model: env_model("PII_OCR_DET_MODEL_URL", defaults.ocr_detection_model),
            ocr_recognition_model: env_model(
                "PII_OCR_REC_MODEL_URL",
                defaults.ocr_recognition_model,
            ),
            ocr_dictionary: env_model("PII_OCR_DICT_URL", defaults.ocr_dictionary),
        }
    }

    pub fn models(&self) -> [&ModelSpec; 6] {
        [
            &self.face_model,
            &self.plate_model,
            &self.document_model,
            &self.ocr_detection_model,
            &self.ocr_recognition_model,
            &self.ocr_dictionary,
        ]
    }

    pub fn validate(&self) -> Result<(), String> {
        for spec in self.models() {
            if spec.id.trim().is_empty() {
                return Err("Model id must not be empty".to_string());
            }
            let url = spec.source.url();
            if url.trim().is_empty() || url::Url::parse(&url).is_err() {
                return Err(format!("Model {} has an invalid download URL", spec.id));
            }
        }
        Ok(())
    }
}

/// Remote evaluator/planner endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub endpoint: String,
    pub evaluator_model: String,
    pub planner_model: String,
    /// No timeout when unset; cancellation is the only early exit
    pub timeout_secs: Option<u64>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_REMOTE_ENDPOINT.to_string(),
            evaluator_model: DEFAULT_EVALUATOR_MODEL.to_string(),
            planner_model: DEFAULT_PLANNER_MODEL.to_string(),
            timeout_secs: None,
        }
    }
}

impl RemoteConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: env::var("PII_REMOTE_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_REMOTE_ENDPOINT.to_string()),
            evaluator_model: env::var("PII_EVALUATOR_MODEL")
                .unwrap_or_else(|_| DEFAULT_EVALUATOR_MODEL.to_string()),
            planner_model: env::var("PII_PLANNER_MODEL")
                .unwrap_or_else(|_| DEFAULT_PLANNER_MODEL.to_string()),
            timeout_secs: env::var("PII_REMOTE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.endpoint.trim().is_empty() {
            return Err("Remote endpoint must not be empty".to_string());
        }
        if self.evaluator_model.trim().is_empty() || self.planner_model.trim().is_empty() {
            return Err("Evaluator and planner models must be set".to_string());
        }
        if self.timeout_secs == Some(0) {
            return Err("Remote timeout must be positive when set".to_string());
        }
        Ok(())
    }
}

/// Loop termination settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    pub target_score: f32,
    pub max_steps: u32,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            target_score: DEFAULT_TARGET_SCORE,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }
}

impl ConvergenceConfig {
    pub fn from_env() -> Self {
        Self {
            target_score: env::var("PII_TARGET_SCORE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_TARGET_SCORE),
            max_steps: env::var("PII_MAX_STEPS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_STEPS),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.target_score) {
            return Err(format!(
                "Target score must be within [0, 1], got {}",
                self.target_score
            ));
        }
        if self.max_steps == 0 {
            return Err("Max steps must be at least 1".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactorConfig {
    pub detection: DetectionConfig,
    pub remote: RemoteConfig,
    pub convergence: ConvergenceConfig,
}

impl RedactorConfig {
    /// Load from environment variables, reading `.env` first if present
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self {
            detection: DetectionConfig::from_env(),
            remote: RemoteConfig::from_env(),
            convergence: ConvergenceConfig::from_env(),
        }
    }

    /// Load from a TOML file; missing tables use defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid redactor configuration")
    }

    pub fn validate(&self) -> Result<(), String> {
        self.detection.validate()?;
        self.remote.validate()?;
        self.convergence.validate()
    }
}
