//! PCA whitening and 8-bit quantization of raw model vectors
//!
//! `q = round((clip(E · (x - μ), min, max) - min) · 255 / (max - min))`

use crate::error::ExtractError;
use serde::Deserialize;
use std::path::Path;

/// Parameter file contents (JSON)
#[derive(Debug, Clone, Deserialize)]
pub struct PcaParams {
    /// Length `raw_dim`
    pub pca_means: Vec<f32>,
    /// `D` rows of length `raw_dim`
    pub pca_eigen_vectors: Vec<Vec<f32>>,
    #[serde(default = "default_quantize_min")]
    pub quantize_min: f32,
    #[serde(default = "default_quantize_max")]
    pub quantize_max: f32,
}

fn default_quantize_min() -> f32 {
    -2.0
}

fn default_quantize_max() -> f32 {
    2.0
}

/// Validated post-processor
#[derive(Debug, Clone)]
pub struct Postprocessor {
    means: Vec<f32>,
    eigen_vectors: Vec<Vec<f32>>,
    min: f32,
    max: f32,
}

impl Postprocessor {
    pub fn new(params: PcaParams) -> Result<Self, ExtractError> {
        let raw_dim = params.pca_means.len();
        if raw_dim == 0 || params.pca_eigen_vectors.is_empty() {
            return Err(ExtractError::Configuration(
                "PCA parameters are empty".to_string(),
            ));
        }
        if let Some(row) = params.pca_eigen_vectors.iter().find(|r| r.len() != raw_dim) {
            return Err(ExtractError::Configuration(format!(
                "PCA eigenvector row has {} entries, expected {}",
                row.len(),
                raw_dim
            )));
        }
        if !(params.quantize_max > params.quantize_min) {
            return Err(ExtractError::Configuration(format!(
                "Quantization range [{}, {}] is empty",
                params.quantize_min, params.quantize_max
            )));
        }
        Ok(Self {
            means: params.pca_means,
            eigen_vectors: params.pca_eigen_vectors,
            min: params.quantize_min,
            max: params.quantize_max,
        })
    }

    /// Load parameters from a JSON file
    pub fn load(path: &Path) -> Result<Self, ExtractError> {
        let content = std::fs::read(path).map_err(|e| {
            ExtractError::Configuration(format!("Cannot read PCA parameters {}: {}", path.display(), e))
        })?;
        let params: PcaParams = serde_json::from_slice(&content).map_err(|e| {
            ExtractError::Configuration(format!("Invalid PCA parameters {}: {}", path.display(), e))
        })?;
        Self::new(params)
    }

    /// Expected raw model vector length
    pub fn input_dim(&self) -> usize {
        self.means.len()
    }

    /// Post-processed vector length `D`
    pub fn output_dim(&self) -> usize {
        self.eigen_vectors.len()
    }

    pub fn apply(&self, raw: &[f32]) -> Result<Vec<f32>, ExtractError> {
        if raw.len() != self.input_dim() {
            return Err(ExtractError::DimensionMismatch {
                expected: self.input_dim(),
                actual: raw.len(),
            });
        }

        let scale = 255.0 / (self.max - self.min);
        let output = self
            .eigen_vectors
            .iter()
            .map(|row| {
                let projected: f32 = row
                    .iter()
                    .zip(raw.iter().zip(&self.means))
                    .map(|(e, (x, mu))| e * (x - mu))
                    .sum();
                ((projected.clamp(self.min, self.max) - self.min) * scale).round()
            })
            .collect();
        Ok(output)
    }
}
