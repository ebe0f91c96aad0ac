//! Audio decoding and canonical WAV output
//!
//! symphonia decodes the fetched source (MP3, M4A/AAC, FLAC, WAV, OGG/Vorbis),
//! rubato resamples, and hound writes the canonical 16-bit mono WAV.

use crate::error::RetrievalError;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::path::Path;
use symphonia::core::audio::{AudioBuffer, AudioBufferRef, Signal};
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::conv::IntoSample;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::sample::Sample;
use tracing::{debug, warn};

/// Decoded audio result
#[derive(Debug)]
pub struct DecodedAudio {
    /// Mono audio samples (f32, range [-1.0, 1.0])
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Original channel count
    pub channels: usize,
}

impl DecodedAudio {
    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Decode audio file to mono f32 PCM samples
///
/// Multi-channel audio is averaged to mono. Packets that fail to decode are
/// skipped with a warning; any other read error, an unknown format, or a
/// stream that decodes to nothing is `CorruptSource`.
pub fn decode_audio_file(file_path: &Path) -> Result<DecodedAudio, RetrievalError> {
    debug!(path = %file_path.display(), "Decoding audio file");

    let corrupt = |what: &str, e: &dyn std::fmt::Display| {
        RetrievalError::CorruptSource(format!("{}: {} ({})", what, file_path.display(), e))
    };

    let file = std::fs::File::open(file_path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = file_path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| corrupt("Unrecognized audio format", &e))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| corrupt("No audio track", &"none found"))?;

    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| corrupt("Sample rate unknown", &"missing"))?;
    let channel_count = track.codec_params.channels.map(|c| c.count()).unwrap_or(1);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| corrupt("Unsupported codec", &e))?;

    let mut samples: Vec<f32> = Vec::new();
    let mut skipped_packets = 0usize;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(corrupt("Error reading packet", &e)),
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => mix_to_mono(&decoded, &mut samples),
            Err(SymphoniaError::DecodeError(e)) => {
                skipped_packets += 1;
                debug!(path = %file_path.display(), error = %e, "Skipping undecodable packet");
            }
            Err(e) => return Err(corrupt("Decoder failure", &e)),
        }
    }

    if skipped_packets > 0 {
        warn!(
            path = %file_path.display(),
            skipped_packets,
            "Some packets could not be decoded"
        );
    }

    if samples.is_empty() {
        return Err(corrupt("Audio decoded to zero samples", &"empty stream"));
    }

    debug!(
        path = %file_path.display(),
        sample_rate,
        channels = channel_count,
        total_samples = samples.len(),
        "Audio decoding complete"
    );

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels: channel_count,
    })
}

/// Append the channel average of every frame in `decoded` to `out`
fn mix_to_mono(decoded: &AudioBufferRef, out: &mut Vec<f32>) {
    fn average<S>(buf: &AudioBuffer<S>, out: &mut Vec<f32>)
    where
        S: Sample + IntoSample<f32>,
    {
        let num_channels = buf.spec().channels.count().max(1);
        let num_frames = buf.frames();
        out.reserve(num_frames);

        for frame_idx in 0..num_frames {
            let mut sum = 0.0f32;
            for ch in 0..num_channels {
                let value: f32 = buf.chan(ch)[frame_idx].into_sample();
                sum += value;
            }
            out.push(sum / num_channels as f32);
        }
    }

    match decoded {
        AudioBufferRef::U8(buf) => average(&**buf, out),
        AudioBufferRef::U16(buf) => average(&**buf, out),
        AudioBufferRef::U24(buf) => average(&**buf, out),
        AudioBufferRef::U32(buf) => average(&**buf, out),
        AudioBufferRef::S8(buf) => average(&**buf, out),
        AudioBufferRef::S16(buf) => average(&**buf, out),
        AudioBufferRef::S24(buf) => average(&**buf, out),
        AudioBufferRef::S32(buf) => average(&**buf, out),
        AudioBufferRef::F32(buf) => average(&**buf, out),
        AudioBufferRef::F64(buf) => average(&**buf, out),
    }
}

/// Resample mono samples with a sinc interpolator
///
/// Returns the input unchanged when the rates already match.
pub fn resample_mono(
    samples: Vec<f32>,
    source_rate: u32,
    target_rate: u32,
) -> Result<Vec<f32>, RetrievalError> {
    if samples.is_empty() || source_rate == target_rate {
        return Ok(samples);
    }

    let num_frames = samples.len();

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let resample_ratio = target_rate as f64 / source_rate as f64;

    // Single pass: chunk size equals the input length
    let mut resampler = SincFixedIn::<f32>::new(resample_ratio, 1.0, params, num_frames, 1)
        .map_err(|e| RetrievalError::CorruptSource(format!("Resampler setup failed: {}", e)))?;

    let input_channels = vec![samples];
    let mut output = resampler
        .process(&input_channels, None)
        .map_err(|e| RetrievalError::CorruptSource(format!("Resampling failed: {}", e)))?;

    let resampled = output.pop().unwrap_or_default();

    debug!(
        "Resampled {} frames ({} Hz) → {} frames ({} Hz)",
        num_frames,
        source_rate,
        resampled.len(),
        target_rate
    );

    Ok(resampled)
}

/// Write mono samples as 16-bit PCM WAV, atomically
///
/// Samples are clamped to [-1, 1]. The file is written to a temp file beside
/// `dest` and renamed into place, so `dest` either does not exist or is complete.
pub fn write_canonical_wav(
    samples: &[f32],
    sample_rate: u32,
    dest: &Path,
) -> Result<(), RetrievalError> {
    let dir = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let tmp = tempfile::Builder::new()
        .prefix(".wav-")
        .suffix(".tmp")
        .tempfile_in(dir)?;

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    {
        let writer = std::io::BufWriter::new(tmp.as_file());
        let mut wav = hound::WavWriter::new(writer, spec)
            .map_err(|e| RetrievalError::Io(std::io::Error::other(e)))?;
        for &s in samples {
            let value = (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
            wav.write_sample(value)
                .map_err(|e| RetrievalError::Io(std::io::Error::other(e)))?;
        }
        wav.finalize()
            .map_err(|e| RetrievalError::Io(std::io::Error::other(e)))?;
    }

    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| RetrievalError::Io(e.error))?;
    Ok(())
}

/// Decode any supported file and write it as the canonical mono WAV
pub fn transcode_to_canonical(
    source: &Path,
    dest: &Path,
    target_rate: u32,
) -> Result<(), RetrievalError> {
    let decoded = decode_audio_file(source)?;
    debug!(
        source = %source.display(),
        duration_secs = format!("{:.2}", decoded.duration_seconds()),
        channels = decoded.channels,
        "Transcoding to canonical WAV"
    );
    let samples = resample_mono(decoded.samples, decoded.sample_rate, target_rate)?;
    write_canonical_wav(&samples, target_rate, dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_test_wav(path: &Path, sample_rate: u32, channels: u16, seconds: f32) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        let frames = (sample_rate as f32 * seconds) as usize;
        for i in 0..frames {
            let t = i as f32 / sample_rate as f32;
            let v = (t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 0.5;
            for _ in 0..channels {
                writer.write_sample((v * i16::MAX as f32) as i16).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_decode_missing_file_is_io() {
        let result = decode_audio_file(Path::new("/nonexistent/file.mp3"));
        assert!(matches!(result, Err(RetrievalError::Io(_))));
    }

    #[test]
    fn test_decode_garbage_is_corrupt() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("garbage.mp3");
        std::fs::write(&path, b"this is not audio at all").unwrap();
        let result = decode_audio_file(&path);
        assert!(matches!(result, Err(RetrievalError::CorruptSource(_))));
    }

    #[test]
    fn test_stereo_44k_transcodes_to_16k_mono() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("src.wav");
        let dest = dir.path().join("sp_id_abc.wav");
        write_test_wav(&src, 44_100, 2, 1.0);

        transcode_to_canonical(&src, &dest, 16_000).unwrap();

        let reader = hound::WavReader::open(&dest).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 16_000);
        assert_eq!(spec.bits_per_sample, 16);
        let len = reader.len() as i64;
        assert!((len - 16_000).abs() < 400, "unexpected length {}", len);
    }

    #[test]
    fn test_resample_same_rate_is_identity() {
        let samples = vec![0.1, 0.2, 0.3];
        assert_eq!(resample_mono(samples.clone(), 16_000, 16_000).unwrap(), samples);
    }

    #[test]
    fn test_write_canonical_wav_leaves_no_temp_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("out.wav");
        write_canonical_wav(&[0.0, 0.5, -0.5, 2.0], 16_000, &dest).unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);

        let samples: Vec<i16> = hound::WavReader::open(&dest)
            .unwrap()
            .into_samples::<i16>()
            .map(|s| s.unwrap())
            .collect();
        assert_eq!(samples[0], 0);
        // Clamped
        assert_eq!(samples[3], i16::MAX);
    }
}
