//! # smap-embed
//!
//! Turns a table of track metadata into a dataset of fixed-length audio
//! embeddings: resolve each track to a playable source, fetch and transcode
//! the audio, then embed and max-pool it into one vector per track.
//!
//! Runs are resumable. The link cache remembers resolved sources and the
//! dataset remembers finished tracks.

pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use config::EmbedConfig;
pub use error::{FailureKind, TrackError};
