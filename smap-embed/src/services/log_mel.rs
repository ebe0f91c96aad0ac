//! Log-mel input patches for the embedding model
//!
//! Computes the VGGish-style front end for one analysis window:
//! 25 ms periodic Hann frames every 10 ms, magnitude spectrum from a
//! power-of-two real FFT, 64 HTK mel bands between 125 and 7500 Hz,
//! then `ln(mel + 0.01)`. Output is exactly [`PATCH_FRAMES`] × [`MEL_BANDS`].

use crate::error::ExtractError;
use realfft::{RealFftPlanner, RealToComplex};
use std::sync::Arc;

/// Frames per patch
pub const PATCH_FRAMES: usize = 96;

/// Mel bands per frame
pub const MEL_BANDS: usize = 64;

const STFT_WINDOW_SECS: f64 = 0.025;
const STFT_HOP_SECS: f64 = 0.010;
const MEL_MIN_HZ: f64 = 125.0;
const MEL_MAX_HZ: f64 = 7500.0;
const LOG_OFFSET: f32 = 0.01;

const MEL_BREAK_FREQUENCY_HZ: f64 = 700.0;
const MEL_HIGH_FREQUENCY_Q: f64 = 1127.0;

fn hz_to_mel(hz: f64) -> f64 {
    MEL_HIGH_FREQUENCY_Q * (1.0 + hz / MEL_BREAK_FREQUENCY_HZ).ln()
}

/// Periodic Hann window
fn periodic_hann(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| {
            let phase = 2.0 * std::f64::consts::PI * i as f64 / size as f64;
            (0.5 - 0.5 * phase.cos()) as f32
        })
        .collect()
}

/// Triangular mel weights, one row of `num_bins` per band
///
/// Triangles are built in the mel domain; the DC bin never contributes.
fn mel_filterbank(num_bins: usize, sample_rate: f64, bands: usize) -> Vec<Vec<f32>> {
    let nyquist = sample_rate / 2.0;
    let bin_mels: Vec<f64> = (0..num_bins)
        .map(|k| hz_to_mel(nyquist * k as f64 / (num_bins - 1) as f64))
        .collect();

    let mel_lo = hz_to_mel(MEL_MIN_HZ);
    let mel_hi = hz_to_mel(MEL_MAX_HZ.min(nyquist));
    let edges: Vec<f64> = (0..bands + 2)
        .map(|i| mel_lo + (mel_hi - mel_lo) * i as f64 / (bands + 1) as f64)
        .collect();

    (0..bands)
        .map(|band| {
            let (lower, center, upper) = (edges[band], edges[band + 1], edges[band + 2]);
            bin_mels
                .iter()
                .enumerate()
                .map(|(k, &mel)| {
                    if k == 0 {
                        return 0.0;
                    }
                    let rising = (mel - lower) / (center - lower);
                    let falling = (upper - mel) / (upper - center);
                    rising.min(falling).max(0.0) as f32
                })
                .collect()
        })
        .collect()
}

/// Reusable log-mel front end
///
/// Immutable after construction and shareable between threads; scratch
/// buffers are allocated per call.
pub struct LogMelFrontend {
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    hop: usize,
    filterbank: Vec<Vec<f32>>,
}

impl LogMelFrontend {
    pub fn new(sample_rate: u32) -> Self {
        let window_len = (STFT_WINDOW_SECS * sample_rate as f64).round() as usize;
        let hop = (STFT_HOP_SECS * sample_rate as f64).round() as usize;
        let fft_len = window_len.next_power_of_two();

        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_len);
        let filterbank = mel_filterbank(fft_len / 2 + 1, sample_rate as f64, MEL_BANDS);

        Self {
            fft,
            window: periodic_hann(window_len),
            hop,
            filterbank,
        }
    }

    /// Samples needed for exactly `PATCH_FRAMES` frames
    pub fn patch_samples(&self) -> usize {
        (PATCH_FRAMES - 1) * self.hop + self.window.len()
    }

    /// Log-mel patch for one analysis window, row-major `[frame][band]`
    ///
    /// Shorter input is zero-padded and longer input truncated to `patch_samples()`.
    pub fn log_mel_patch(&self, samples: &[f32]) -> Result<Vec<f32>, ExtractError> {
        let needed = self.patch_samples();
        let mut padded = vec![0.0f32; needed];
        let take = samples.len().min(needed);
        padded[..take].copy_from_slice(&samples[..take]);

        let mut frame_buf = self.fft.make_input_vec();
        let mut spectrum = self.fft.make_output_vec();
        let mut scratch = self.fft.make_scratch_vec();
        let mut magnitudes = vec![0.0f32; spectrum.len()];
        let mut patch = Vec::with_capacity(PATCH_FRAMES * MEL_BANDS);

        for frame_idx in 0..PATCH_FRAMES {
            let start = frame_idx * self.hop;

            frame_buf.iter_mut().for_each(|x| *x = 0.0);
            for (i, w) in self.window.iter().enumerate() {
                frame_buf[i] = padded[start + i] * w;
            }

            self.fft
                .process_with_scratch(&mut frame_buf, &mut spectrum, &mut scratch)
                .map_err(|e| ExtractError::Inference(format!("FFT failed: {:?}", e)))?;

            for (m, c) in magnitudes.iter_mut().zip(spectrum.iter()) {
                *m = c.norm();
            }

            for filter in &self.filterbank {
                let energy: f32 = filter.iter().zip(&magnitudes).map(|(w, m)| w * m).sum();
                patch.push((energy + LOG_OFFSET).ln());
            }
        }

        Ok(patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_geometry_at_16k() {
        let frontend = LogMelFrontend::new(16_000);
        assert_eq!(frontend.window.len(), 400);
        assert_eq!(frontend.hop, 160);
        assert_eq!(frontend.fft.len(), 512);
        assert_eq!(frontend.patch_samples(), 15_600);

        let patch = frontend.log_mel_patch(&vec![0.0; 15_360]).unwrap();
        assert_eq!(patch.len(), PATCH_FRAMES * MEL_BANDS);
    }

    #[test]
    fn test_silence_maps_to_log_offset() {
        let frontend = LogMelFrontend::new(16_000);
        let patch = frontend.log_mel_patch(&[]).unwrap();
        let floor = LOG_OFFSET.ln();
        assert!(patch.iter().all(|&v| (v - floor).abs() < 1e-6));
    }

    #[test]
    fn test_tone_energy_lands_in_matching_band() {
        let frontend = LogMelFrontend::new(16_000);
        let tone: Vec<f32> = (0..15_600)
            .map(|i| (2.0 * std::f32::consts::PI * 1000.0 * i as f32 / 16_000.0).sin())
            .collect();
        let patch = frontend.log_mel_patch(&tone).unwrap();

        // Middle frame, loudest band
        let frame = &patch[48 * MEL_BANDS..49 * MEL_BANDS];
        let loudest = frame
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();

        let mel_lo = hz_to_mel(MEL_MIN_HZ);
        let mel_hi = hz_to_mel(MEL_MAX_HZ);
        let step = (mel_hi - mel_lo) / (MEL_BANDS + 1) as f64;
        let expected = ((hz_to_mel(1000.0) - mel_lo) / step).round() as usize - 1;
        assert!(loudest.abs_diff(expected) <= 1, "band {} vs {}", loudest, expected);
    }

    #[test]
    fn test_deterministic() {
        let frontend = LogMelFrontend::new(16_000);
        let signal: Vec<f32> = (0..15_360).map(|i| ((i * 7919) % 1000) as f32 / 1000.0 - 0.5).collect();
        let a = frontend.log_mel_patch(&signal).unwrap();
        let b = frontend.log_mel_patch(&signal).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_filterbank_dc_bin_is_zero() {
        let bank = mel_filterbank(257, 16_000.0, MEL_BANDS);
        assert_eq!(bank.len(), MEL_BANDS);
        assert!(bank.iter().all(|row| row[0] == 0.0));
        assert!(bank.iter().all(|row| row.iter().any(|&w| w > 0.0)));
    }
}
