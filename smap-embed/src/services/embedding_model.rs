//! Embedding model seam and the ONNX Runtime implementation
//!
//! A model maps one analysis window of canonical samples to a raw vector.
//! Framing, pooling and post-processing live in the feature extractor.

use crate::config::ExtractorConfig;
use crate::error::ExtractError;
use crate::services::log_mel::{LogMelFrontend, MEL_BANDS, PATCH_FRAMES};
use ndarray::Array3;
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

/// Pretrained audio embedding model
pub trait EmbeddingModel: Send + Sync {
    /// Raw embedding for one analysis window
    fn infer(&self, window: &[f32]) -> Result<Vec<f32>, ExtractError>;

    /// Length of vectors returned by `infer`
    fn raw_dim(&self) -> usize;
}

/// VGGish-style ONNX model fed with `[1, 96, 64]` log-mel patches
pub struct OnnxEmbeddingModel {
    session: Mutex<Session>,
    frontend: LogMelFrontend,
    input_name: String,
    raw_dim: usize,
}

impl OnnxEmbeddingModel {
    /// Load the model and measure its output size with a silent patch
    pub fn load(path: &Path, config: &ExtractorConfig) -> Result<Self, ExtractError> {
        if !path.exists() {
            return Err(ExtractError::Configuration(format!(
                "Embedding model not found: {}",
                path.display()
            )));
        }

        let session = Session::builder()
            .and_then(|b| b.with_intra_threads(1))
            .and_then(|b| b.commit_from_file(path))
            .map_err(|e| ExtractError::Configuration(format!("Failed to load model: {}", e)))?;

        let mut model = Self {
            session: Mutex::new(session),
            frontend: LogMelFrontend::new(config.sample_rate),
            input_name: config.model_input.clone(),
            raw_dim: 0,
        };

        let sample = model.infer(&[])?;
        if sample.is_empty() {
            return Err(ExtractError::Configuration(
                "Model produced an empty embedding".to_string(),
            ));
        }
        model.raw_dim = sample.len();

        info!(path = %path.display(), raw_dim = model.raw_dim, "Embedding model loaded");
        Ok(model)
    }
}

impl EmbeddingModel for OnnxEmbeddingModel {
    fn infer(&self, window: &[f32]) -> Result<Vec<f32>, ExtractError> {
        let patch = self.frontend.log_mel_patch(window)?;
        let input = Array3::from_shape_vec((1, PATCH_FRAMES, MEL_BANDS), patch)
            .map_err(|e| ExtractError::Inference(format!("Input shape error: {}", e)))?;
        let input_tensor = Tensor::from_array(input)
            .map_err(|e| ExtractError::Inference(format!("Tensor creation error: {}", e)))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| ExtractError::Inference("Model session lock poisoned".to_string()))?;

        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => input_tensor])
            .map_err(|e| ExtractError::Inference(format!("Inference error: {}", e)))?;

        let (_, value) = outputs
            .iter()
            .next()
            .ok_or_else(|| ExtractError::Inference("Model produced no output".to_string()))?;
        let (_shape, data) = value
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractError::Inference(format!("Output extraction error: {}", e)))?;

        Ok(data.to_vec())
    }

    fn raw_dim(&self) -> usize {
        self.raw_dim
    }
}
