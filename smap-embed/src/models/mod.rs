//! Data models

pub mod outcome;
pub mod track;

pub use outcome::{FailureRecord, RunReport, RunSummary, TrackOutcome, TrackReport};
pub use track::{
    canonical_audio_path, is_valid_track_id, load_metadata, LinkKey, TrackRecord, TrackStatus,
};
