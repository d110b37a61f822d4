// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Shared ONNX Runtime session wrapper

use ndarray::{Array4, ArrayD};
use ort::ep::{CPU as CPUExecutionProvider, CUDA as CUDAExecutionProvider};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::cache::ModelCache;
use super::download::{ModelDownloader, ModelSpec};
use super::error::DetectorError;

const INTRA_THREADS: usize = 4;

/// A loaded model with a single image input
pub struct OnnxSession {
    model_id: String,
    // ort needs &mut for run()
    session: Mutex<Session>,
    input_name: String,
}

impl std::fmt::Debug for OnnxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxSession")
            .field("model_id", &self.model_id)
            .field("input_name", &self.input_name)
            .finish()
    }
}

impl OnnxSession {
    /// Load a model, preferring CUDA and falling back to CPU
    pub fn load(model_id: &str, model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(
                model_path.display().to_string(),
            ));
        }

        let session = match build_session(model_path, true) {
            Ok(session) => {
                info!("Model {} loaded with CUDA execution provider", model_id);
                session
            }
            Err(e) => {
                warn!("CUDA execution provider failed for {}: {}", model_id, e);
                warn!("Falling back to CPU execution provider");
                build_session(model_path, false)
                    .map_err(|e| DetectorError::Session(format!("{}: {}", model_id, e)))?
            }
        };

        let input_name = session
            .inputs()
            .first()
            .map(|i| i.name().to_string())
            .ok_or_else(|| DetectorError::Session(format!("{} has no inputs", model_id)))?;

        debug!("Model {} input name: {}", model_id, input_name);

        Ok(Self {
            model_id: model_id.to_string(),
            session: Mutex::new(session),
            input_name,
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Run the model on an NCHW tensor and return its first output
    pub fn run(&self, input: Array4<f32>) -> Result<ArrayD<f32>, DetectorError> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectorError::Inference("session lock poisoned".to_string()))?;

        let input_value =
            Value::from_array(input).map_err(|e| DetectorError::Inference(e.to_string()))?;

        let outputs = session
            .run(ort::inputs![&self.input_name => input_value])
            .map_err(|e| DetectorError::Inference(e.to_string()))?;

        let output = outputs[0]
            .try_extract_array::<f32>()
            .map_err(|e| DetectorError::InvalidOutput(e.to_string()))?
            .to_owned();

        Ok(output)
    }
}

fn build_session(model_path: &Path, cuda: bool) -> ort::Result<Session> {
    let builder = Session::builder()?;
    let builder = if cuda {
        builder.with_execution_providers([CUDAExecutionProvider::default().build()])?
    } else {
        builder.with_execution_providers([CPUExecutionProvider::default().build()])?
    };
    builder
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(INTRA_THREADS)?
        .commit_from_file(model_path)
}

/// Download (if needed) and load `spec` exactly once per cache
pub async fn load_session(
    cache: &ModelCache<OnnxSession>,
    downloader: &ModelDownloader,
    spec: &ModelSpec,
    progress: &(dyn Fn(f32) + Send + Sync),
) -> Result<Arc<OnnxSession>, DetectorError> {
    cache
        .get_or_try_init(&spec.id, || async {
            let path = downloader.ensure(spec, progress).await?;
            let id = spec.id.clone();
            tokio::task::spawn_blocking(move || OnnxSession::load(&id, &path)).await?
        })
        .await
}
