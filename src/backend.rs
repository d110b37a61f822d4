// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Compute backend probing for local inference
//!
//! The probed tier is informational: it is reported to the caller alongside
//! detection state and never changes which detectors run.

use ort::ep::{
    CoreML as CoreMLExecutionProvider, DirectML as DirectMLExecutionProvider, ExecutionProvider,
    CUDA as CUDAExecutionProvider,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// Acceleration tier available to local inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// Dedicated GPU compute (CUDA)
    GpuAccelerated,
    /// Graphics-API backed compute (DirectML, CoreML)
    ShaderAccelerated,
    /// No accelerator found
    CpuOnly,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::GpuAccelerated => "gpu-accelerated",
            Backend::ShaderAccelerated => "shader-accelerated",
            Backend::CpuOnly => "cpu-only",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Feature tests for the execution environment
pub trait CapabilitySource: Send + Sync {
    /// Whether a dedicated GPU compute provider can be registered
    fn has_gpu_compute(&self) -> bool;

    /// Whether a graphics-API compute provider can be registered
    fn has_shader_compute(&self) -> bool;
}

/// Capability source backed by ONNX Runtime's execution provider registry
#[derive(Debug, Default, Clone, Copy)]
pub struct OrtCapabilities;

impl CapabilitySource for OrtCapabilities {
    fn has_gpu_compute(&self) -> bool {
        provider_available("CUDA", CUDAExecutionProvider::default().is_available())
    }

    fn has_shader_compute(&self) -> bool {
        provider_available("DirectML", DirectMLExecutionProvider::default().is_available())
            || provider_available("CoreML", CoreMLExecutionProvider::default().is_available())
    }
}

fn provider_available(name: &str, result: ort::Result<bool>) -> bool {
    match result {
        Ok(available) => {
            debug!(provider = name, available, "Execution provider probed");
            available
        }
        Err(e) => {
            debug!(provider = name, "Execution provider probe failed: {}", e);
            false
        }
    }
}

/// Pick the best available tier, in priority order GPU > shader > CPU
pub fn probe(source: &dyn CapabilitySource) -> Backend {
    let backend = if source.has_gpu_compute() {
        Backend::GpuAccelerated
    } else if source.has_shader_compute() {
        Backend::ShaderAccelerated
    } else {
        Backend::CpuOnly
    };

    info!(backend = %backend, "Inference backend selected");
    backend
}
