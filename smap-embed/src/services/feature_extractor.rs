//! Track vector extraction from canonical audio
//!
//! Windows of `window_len` samples every `hop_len` samples are embedded
//! independently, post-processed to `D` values each, then max-pooled into
//! one track vector.

use crate::config::ExtractorConfig;
use crate::error::ExtractError;
use crate::services::embedding_model::EmbeddingModel;
use crate::services::postprocessor::Postprocessor;
use crate::utils::TrackSlot;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Split samples into fixed-size analysis windows
///
/// Input no longer than one window yields a single zero-padded window.
/// Otherwise only full windows are produced; a tail shorter than one hop
/// past the last full window is dropped.
pub fn frame_windows(
    samples: &[f32],
    window_len: usize,
    hop_len: usize,
) -> Result<Vec<Vec<f32>>, ExtractError> {
    if samples.is_empty() {
        return Err(ExtractError::EmptyAudio);
    }
    if window_len == 0 || hop_len == 0 {
        return Err(ExtractError::Configuration(format!(
            "Invalid framing: window {} hop {}",
            window_len, hop_len
        )));
    }

    if samples.len() <= window_len {
        let mut window = samples.to_vec();
        window.resize(window_len, 0.0);
        return Ok(vec![window]);
    }

    let count = 1 + (samples.len() - window_len) / hop_len;
    let windows: Vec<Vec<f32>> = (0..count)
        .map(|i| samples[i * hop_len..i * hop_len + window_len].to_vec())
        .collect();

    if windows.is_empty() {
        return Err(ExtractError::NoWindows);
    }
    Ok(windows)
}

/// Coordinate-wise maximum over window vectors
pub fn max_pool(vectors: &[Vec<f32>]) -> Result<Vec<f32>, ExtractError> {
    let (first, rest) = vectors.split_first().ok_or(ExtractError::NoWindows)?;
    let mut pooled = first.clone();
    for vector in rest {
        if vector.len() != pooled.len() {
            return Err(ExtractError::DimensionMismatch {
                expected: pooled.len(),
                actual: vector.len(),
            });
        }
        for (p, &v) in pooled.iter_mut().zip(vector) {
            *p = p.max(v);
        }
    }
    Ok(pooled)
}

/// Read a canonical WAV, checking it is 16-bit mono at `sample_rate`
pub fn read_canonical_wav(path: &Path, sample_rate: u32) -> Result<Vec<f32>, ExtractError> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    if spec.channels != 1
        || spec.sample_rate != sample_rate
        || spec.bits_per_sample != 16
        || spec.sample_format != hound::SampleFormat::Int
    {
        return Err(ExtractError::FormatMismatch(format!(
            "{}: {} ch, {} Hz, {}-bit, expected mono {} Hz 16-bit",
            path.display(),
            spec.channels,
            spec.sample_rate,
            spec.bits_per_sample,
            sample_rate
        )));
    }

    reader
        .samples::<i16>()
        .map(|s| s.map(|v| v as f32 / 32768.0).map_err(ExtractError::from))
        .collect()
}

/// Turns canonical audio into a fixed-length track vector
#[derive(Clone)]
pub struct FeatureExtractor {
    model: Arc<dyn EmbeddingModel>,
    postprocessor: Option<Arc<Postprocessor>>,
    config: ExtractorConfig,
}

impl FeatureExtractor {
    /// Build an extractor, checking dimensions agree before any track runs
    ///
    /// Without a post-processor the raw model output is the window vector.
    pub fn new(
        model: Arc<dyn EmbeddingModel>,
        postprocessor: Option<Postprocessor>,
        config: ExtractorConfig,
    ) -> Result<Self, ExtractError> {
        let output_dim = match &postprocessor {
            Some(post) => {
                if post.input_dim() != model.raw_dim() {
                    return Err(ExtractError::Configuration(format!(
                        "PCA parameters expect {} inputs, model produces {}",
                        post.input_dim(),
                        model.raw_dim()
                    )));
                }
                post.output_dim()
            }
            None => model.raw_dim(),
        };
        if output_dim != config.embedding_dim {
            return Err(ExtractError::Configuration(format!(
                "Configured embedding_dim {} but pipeline produces {}",
                config.embedding_dim, output_dim
            )));
        }

        Ok(Self {
            model,
            postprocessor: postprocessor.map(Arc::new),
            config,
        })
    }

    pub fn embedding_dim(&self) -> usize {
        self.config.embedding_dim
    }

    /// Vector for one window, checked against `D`
    fn window_vector(&self, window: &[f32]) -> Result<Vec<f32>, ExtractError> {
        let raw = self.model.infer(window)?;
        let vector = match &self.postprocessor {
            Some(post) => post.apply(&raw)?,
            None => raw,
        };
        if vector.len() != self.config.embedding_dim {
            return Err(ExtractError::DimensionMismatch {
                expected: self.config.embedding_dim,
                actual: vector.len(),
            });
        }
        Ok(vector)
    }

    /// Track vector from in-memory canonical samples
    pub fn extract_samples(&self, samples: &[f32]) -> Result<Vec<f32>, ExtractError> {
        self.pool_windows(samples, None)
    }

    /// Embed every window and pool, stopping early once `slot` is cancelled
    fn pool_windows(&self, samples: &[f32], slot: Option<&TrackSlot>) -> Result<Vec<f32>, ExtractError> {
        let windows = frame_windows(samples, self.config.window_len(), self.config.hop_len())?;
        let mut vectors = Vec::with_capacity(windows.len());
        for window in &windows {
            if slot.is_some_and(TrackSlot::is_cancelled) {
                debug!(done = vectors.len(), total = windows.len(), "Extraction abandoned");
                return Err(ExtractError::Cancelled);
            }
            vectors.push(self.window_vector(window)?);
        }
        max_pool(&vectors)
    }

    /// Track vector for a canonical audio file
    pub fn extract(&self, path: &Path) -> Result<Vec<f32>, ExtractError> {
        self.extract_in_slot(path, None)
    }

    fn extract_in_slot(&self, path: &Path, slot: Option<&TrackSlot>) -> Result<Vec<f32>, ExtractError> {
        let samples = read_canonical_wav(path, self.config.sample_rate)?;
        debug!(path = %path.display(), samples = samples.len(), "Extracting track vector");
        self.pool_windows(&samples, slot)
    }

    /// `extract` on the blocking pool
    ///
    /// The blocking task holds `slot` until it returns and checks it between
    /// windows, so an abandoned track stops after the window in progress.
    pub async fn extract_async(&self, path: PathBuf, slot: &TrackSlot) -> Result<Vec<f32>, ExtractError> {
        let extractor = self.clone();
        let slot = slot.clone();
        tokio::task::spawn_blocking(move || extractor.extract_in_slot(&path, Some(&slot)))
            .await
            .map_err(|e| ExtractError::Inference(format!("Extraction task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Mean, max and min of the window
    struct StatsModel;

    impl EmbeddingModel for StatsModel {
        fn infer(&self, window: &[f32]) -> Result<Vec<f32>, ExtractError> {
            let sum: f32 = window.iter().sum();
            let max = window.iter().copied().fold(f32::MIN, f32::max);
            let min = window.iter().copied().fold(f32::MAX, f32::min);
            Ok(vec![sum / window.len() as f32, max, min])
        }

        fn raw_dim(&self) -> usize {
            3
        }
    }

    fn config(dim: usize) -> ExtractorConfig {
        ExtractorConfig {
            embedding_dim: dim,
            ..ExtractorConfig::default()
        }
    }

    fn write_wav(path: &Path, rate: u32, channels: u16, samples: &[i16]) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_frame_windows_counts() {
        assert!(matches!(frame_windows(&[], 4, 2), Err(ExtractError::EmptyAudio)));

        let short = frame_windows(&[1.0, 2.0], 4, 2).unwrap();
        assert_eq!(short, vec![vec![1.0, 2.0, 0.0, 0.0]]);

        let exact = frame_windows(&[1.0; 4], 4, 2).unwrap();
        assert_eq!(exact.len(), 1);

        // 1 + (9 - 4) / 2 = 3, last sample dropped
        let samples: Vec<f32> = (0..9).map(|i| i as f32).collect();
        let windows = frame_windows(&samples, 4, 2).unwrap();
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[2], vec![4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_frame_windows_default_geometry() {
        let cfg = ExtractorConfig::default();
        let samples = vec![0.0f32; 16_000 * 3];
        let windows = frame_windows(&samples, cfg.window_len(), cfg.hop_len()).unwrap();
        assert_eq!(windows.len(), 1 + (48_000 - 15_360) / 7_680);
        assert!(windows.iter().all(|w| w.len() == 15_360));
    }

    #[test]
    fn test_max_pool() {
        let pooled = max_pool(&[vec![1.0, 5.0], vec![3.0, 2.0]]).unwrap();
        assert_eq!(pooled, vec![3.0, 5.0]);
        assert_eq!(
            max_pool(&[vec![3.0, 2.0], vec![1.0, 5.0]]).unwrap(),
            pooled
        );
        assert!(matches!(max_pool(&[]), Err(ExtractError::NoWindows)));
        assert!(matches!(
            max_pool(&[vec![1.0], vec![1.0, 2.0]]),
            Err(ExtractError::DimensionMismatch { expected: 1, actual: 2 })
        ));
    }

    #[test]
    fn test_dimension_checked_at_construction() {
        assert!(matches!(
            FeatureExtractor::new(Arc::new(StatsModel), None, config(128)),
            Err(ExtractError::Configuration(_))
        ));
        assert!(FeatureExtractor::new(Arc::new(StatsModel), None, config(3)).is_ok());
    }

    #[test]
    fn test_extract_from_wav_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sp_id_a.wav");
        let samples: Vec<i16> = (0..40_000).map(|i| ((i % 200) as i16 - 100) * 50).collect();
        write_wav(&path, 16_000, 1, &samples);

        let extractor = FeatureExtractor::new(Arc::new(StatsModel), None, config(3)).unwrap();
        let a = extractor.extract(&path).unwrap();
        let b = extractor.extract(&path).unwrap();
        assert_eq!(a.len(), 3);
        assert_eq!(a, b);
        assert!(a[1] > 0.0 && a[2] < 0.0);
    }

    #[test]
    fn test_extract_rejects_non_canonical_wav() {
        let dir = TempDir::new().unwrap();
        let stereo = dir.path().join("stereo.wav");
        write_wav(&stereo, 16_000, 2, &[0; 200]);
        let fast = dir.path().join("fast.wav");
        write_wav(&fast, 44_100, 1, &[0; 200]);
        let empty = dir.path().join("empty.wav");
        write_wav(&empty, 16_000, 1, &[]);

        let extractor = FeatureExtractor::new(Arc::new(StatsModel), None, config(3)).unwrap();
        assert!(matches!(extractor.extract(&stereo), Err(ExtractError::FormatMismatch(_))));
        assert!(matches!(extractor.extract(&fast), Err(ExtractError::FormatMismatch(_))));
        assert!(matches!(extractor.extract(&empty), Err(ExtractError::EmptyAudio)));
    }

    #[tokio::test]
    async fn test_extract_async_with_postprocessor() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sp_id_b.wav");
        write_wav(&path, 16_000, 1, &[1000; 20_000]);

        let post = Postprocessor::new(crate::services::postprocessor::PcaParams {
            pca_means: vec![0.0; 3],
            pca_eigen_vectors: vec![vec![1.0, 0.0, 0.0], vec![0.0, 0.0, 1.0]],
            quantize_min: -2.0,
            quantize_max: 2.0,
        })
        .unwrap();
        let extractor = FeatureExtractor::new(Arc::new(StatsModel), Some(post), config(2)).unwrap();

        let vector = extractor.extract_async(path, &TrackSlot::default()).await.unwrap();
        assert_eq!(vector.len(), 2);
        assert!(vector.iter().all(|v| (0.0..=255.0).contains(v)));
    }

    #[tokio::test]
    async fn test_aborted_slot_stops_extraction() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sp_id_c.wav");
        write_wav(&path, 16_000, 1, &[1000; 40_000]);

        let extractor = FeatureExtractor::new(Arc::new(StatsModel), None, config(3)).unwrap();
        let slot = TrackSlot::default();
        slot.abort();

        let result = extractor.extract_async(path, &slot).await;
        assert!(matches!(result, Err(ExtractError::Cancelled)));
    }
}
