//! Utility modules for smap-embed

pub mod audio_decoder;
pub mod track_slot;
pub mod tsv;

pub use audio_decoder::{decode_audio_file, transcode_to_canonical, DecodedAudio};
pub use track_slot::TrackSlot;
