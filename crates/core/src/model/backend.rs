//! Execution-provider selection for ONNX sessions: CPU, CUDA or TensorRT.
//!
//! Device choice is carried in [`ModelConfig`] and handed to the session
//! builder; nothing here touches process environment variables.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Inference backend selection.
///
/// `Tensorrt` registers CUDA as a fallback provider; `Cuda` falls back to CPU
/// when the CUDA provider is unavailable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cpu,
    Cuda,
    Tensorrt,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cpu` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Self::Cuda,
            "tensorrt" | "trt" => Self::Tensorrt,
            _ => Self::Cpu,
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub path: PathBuf,
    pub backend: InferenceBackend,
    pub device_id: i32,
    pub trt_cache_dir: Option<PathBuf>,
    /// Worker threads for the CPU provider; `0` lets ONNX Runtime decide.
    pub intra_threads: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("model.onnx"),
            backend: InferenceBackend::default(),
            device_id: 0,
            trt_cache_dir: None,
            intra_threads: 0,
        }
    }
}

fn load_error(path: &Path) -> String {
    format!("Failed to load ONNX model: {}", path.display())
}

/// Build an `ort::Session` for `config`, registering the providers its
/// backend asks for.
pub fn build_session(config: &ModelConfig) -> Result<Session> {
    let mut builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    if config.intra_threads > 0 {
        builder = builder.with_intra_threads(config.intra_threads)?;
    }

    let started = Instant::now();
    let session = match config.backend {
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session on the default CPU provider");
            builder
                .commit_from_file(&config.path)
                .with_context(|| load_error(&config.path))?
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default().with_device_id(config.device_id);
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available, inference will fall back to CPU");
            }

            debug!(backend = "cuda", device_id = config.device_id, "Building session with CUDA EP");
            builder
                .with_execution_providers([cuda.build()])?
                .commit_from_file(&config.path)
                .with_context(|| load_error(&config.path))?
        }
        InferenceBackend::Tensorrt => {
            let cache_dir = config
                .trt_cache_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("trt_cache"));
            if let Err(e) = std::fs::create_dir_all(&cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }

            info!(
                cache_dir = %cache_dir.display(),
                device_id = config.device_id,
                "Initializing TensorRT session (first run may take several minutes)"
            );

            builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(cache_dir.to_string_lossy().to_string())
                        .with_device_id(config.device_id)
                        .build(),
                    CUDAExecutionProvider::default()
                        .with_device_id(config.device_id)
                        .build(),
                ])?
                .commit_from_file(&config.path)
                .with_context(|| load_error(&config.path))?
        }
    };

    info!(
        backend = %config.backend,
        model = %config.path.display(),
        elapsed_secs = started.elapsed().as_secs_f64(),
        "ONNX session ready"
    );
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_from_str_lossy() {
        assert_eq!(InferenceBackend::from_str_lossy("CUDA"), InferenceBackend::Cuda);
        assert_eq!(InferenceBackend::from_str_lossy("gpu"), InferenceBackend::Cuda);
        assert_eq!(InferenceBackend::from_str_lossy("TRT"), InferenceBackend::Tensorrt);
        assert_eq!(InferenceBackend::from_str_lossy("cpu"), InferenceBackend::Cpu);
        assert_eq!(InferenceBackend::from_str_lossy(""), InferenceBackend::Cpu);
    }

    #[test]
    fn test_backend_display_matches_serde() {
        for backend in [InferenceBackend::Cpu, InferenceBackend::Cuda, InferenceBackend::Tensorrt] {
            let encoded = toml::Value::try_from(backend).unwrap();
            assert_eq!(encoded.as_str(), Some(backend.to_string().as_str()));
        }
    }
}
