//! Audio and table fixture generators

use smap_embed::models::TrackRecord;
use std::path::Path;

/// Shape of a generated WAV
#[derive(Debug, Clone, Copy)]
pub struct AudioFixture {
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    /// Tone frequency, Hz
    pub frequency: f64,
}

impl Default for AudioFixture {
    fn default() -> Self {
        Self {
            duration_seconds: 2.0,
            sample_rate: 22_050,
            channels: 2,
            frequency: 440.0,
        }
    }
}

/// Write a 16-bit sine tone WAV
pub fn write_test_wav(path: &Path, fixture: &AudioFixture) -> hound::Result<()> {
    let spec = hound::WavSpec {
        channels: fixture.channels,
        sample_rate: fixture.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    let total = (fixture.duration_seconds * fixture.sample_rate as f64) as usize;
    for i in 0..total {
        let t = i as f64 / fixture.sample_rate as f64;
        let value = (t * fixture.frequency * 2.0 * std::f64::consts::PI).sin() * 0.5;
        let sample = (value * i16::MAX as f64) as i16;
        for _ in 0..fixture.channels {
            writer.write_sample(sample)?;
        }
    }
    writer.finalize()
}

/// Bytes no decoder will accept
pub fn write_corrupt_file(path: &Path) -> std::io::Result<()> {
    std::fs::write(path, b"this is not audio at all, just text pretending to be an mp3")
}

/// Metadata table in the playlist provider's layout
pub fn write_metadata_tsv(path: &Path, tracks: &[TrackRecord]) -> std::io::Result<()> {
    let mut content =
        String::from("Track ID\tTrack Name\tTrack Url\tArtists\tAlbum\tSong Length (s)\tMetrics\n");
    for track in tracks {
        content.push_str(&format!(
            "{}\t{}\thttps://open.example.com/track/{}\t{}\t{}\t{}\t{{}}\n",
            track.track_id,
            track.name,
            track.track_id,
            track.artists_joined(),
            track.album,
            track.duration_secs
        ));
    }
    std::fs::write(path, content)
}
