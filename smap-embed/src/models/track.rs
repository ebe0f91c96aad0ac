//! Track records, link keys, and the metadata table reader

use crate::error::DatasetError;
use crate::utils::tsv::split_row;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Metadata table column names
pub const COL_TRACK_ID: &str = "Track ID";
pub const COL_TRACK_NAME: &str = "Track Name";
pub const COL_ARTISTS: &str = "Artists";
pub const COL_ALBUM: &str = "Album";
pub const COL_SONG_LENGTH: &str = "Song Length (s)";

const REQUIRED_COLUMNS: [&str; 5] = [
    COL_TRACK_ID,
    COL_TRACK_NAME,
    COL_ARTISTS,
    COL_ALBUM,
    COL_SONG_LENGTH,
];

/// Separator between artists in metadata cells
pub const ARTIST_SEPARATOR: &str = ", ";

/// Lifecycle stage of a track within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackStatus {
    Pending,
    Resolved,
    Downloaded,
    Embedded,
    Failed,
}

/// One track flowing through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRecord {
    /// Opaque identifier from the playlist provider
    pub track_id: String,
    pub name: String,
    pub artists: Vec<String>,
    pub album: String,
    /// Target duration, seconds
    pub duration_secs: f64,
    pub source_url: Option<String>,
    pub audio_path: Option<PathBuf>,
    pub embedding: Option<Vec<f32>>,
    pub status: TrackStatus,
}

impl TrackRecord {
    pub fn new(
        track_id: impl Into<String>,
        name: impl Into<String>,
        artists: Vec<String>,
        album: impl Into<String>,
        duration_secs: f64,
    ) -> Self {
        Self {
            track_id: track_id.into(),
            name: name.into(),
            artists,
            album: album.into(),
            duration_secs,
            source_url: None,
            audio_path: None,
            embedding: None,
            status: TrackStatus::Pending,
        }
    }

    /// Artists joined for display and search
    pub fn artists_joined(&self) -> String {
        self.artists.join(ARTIST_SEPARATOR)
    }

    /// Free-text search query: `"<name> by <artists>"`
    ///
    /// `:` is replaced with `-` because the search engine reads it as an operator.
    pub fn search_query(&self) -> String {
        format!("{} by {}", self.name, self.artists_joined()).replace(':', "-")
    }

    pub fn link_key(&self) -> LinkKey {
        LinkKey::new(&self.name, &self.artists_joined())
    }

    pub fn mark_resolved(&mut self, url: impl Into<String>) {
        self.source_url = Some(url.into());
        self.status = TrackStatus::Resolved;
    }

    pub fn mark_downloaded(&mut self, path: impl Into<PathBuf>) {
        self.audio_path = Some(path.into());
        self.status = TrackStatus::Downloaded;
    }

    pub fn mark_embedded(&mut self, vector: Vec<f32>) {
        self.embedding = Some(vector);
        self.status = TrackStatus::Embedded;
    }

    pub fn mark_failed(&mut self) {
        self.status = TrackStatus::Failed;
    }
}

/// Normalized (title, artists) key for the link cache
///
/// Lower-cased, trimmed, whitespace runs collapsed. Stored as `"<title> :: <artists>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkKey(String);

impl LinkKey {
    pub fn new(title: &str, artists: &str) -> Self {
        Self(format!("{} :: {}", normalize(title), normalize(artists)))
    }

    /// Rebuild a key from its stored cell form
    pub fn from_cell(cell: &str) -> Self {
        Self(normalize(cell))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Whether `track_id` is safe to embed in a file name
pub fn is_valid_track_id(track_id: &str) -> bool {
    !track_id.is_empty()
        && track_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Canonical audio file location for a track
pub fn canonical_audio_path(audio_dir: &Path, track_id: &str) -> PathBuf {
    audio_dir.join(format!("sp_id_{}.wav", track_id))
}

/// Parse a metadata table
///
/// Missing required columns fail the whole table. Malformed rows (wrong cell
/// count, unparsable or negative duration) are skipped with a warning.
/// Duplicate track ids keep the first occurrence.
pub fn parse_metadata(content: &str, source: &str) -> Result<Vec<TrackRecord>, DatasetError> {
    let mut lines = content.lines();
    let header = lines.next().ok_or_else(|| DatasetError::Schema {
        path: source.to_string(),
        reason: "empty file".to_string(),
    })?;
    let header = split_row(header);

    let column = |name: &str| -> Result<usize, DatasetError> {
        header
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| DatasetError::MissingColumn {
                path: source.to_string(),
                column: name.to_string(),
            })
    };
    let idx = REQUIRED_COLUMNS
        .iter()
        .map(|c| column(c))
        .collect::<Result<Vec<_>, _>>()?;
    let (id_i, name_i, artists_i, album_i, len_i) = (idx[0], idx[1], idx[2], idx[3], idx[4]);

    let mut seen = HashSet::new();
    let mut tracks = Vec::new();

    for (line_no, line) in lines.enumerate().map(|(i, l)| (i + 2, l)) {
        if line.trim().is_empty() {
            continue;
        }
        let cells = split_row(line);
        if cells.len() != header.len() {
            warn!(
                source,
                line = line_no,
                expected = header.len(),
                found = cells.len(),
                "Skipping row with wrong cell count"
            );
            continue;
        }

        let duration_secs = match cells[len_i].trim().parse::<f64>() {
            Ok(d) if d.is_finite() && d >= 0.0 => d,
            _ => {
                warn!(source, line = line_no, value = cells[len_i], "Skipping row with bad duration");
                continue;
            }
        };

        let track_id = cells[id_i].trim().to_string();
        if !seen.insert(track_id.clone()) {
            warn!(source, line = line_no, track_id = %track_id, "Duplicate track id, keeping first");
            continue;
        }

        let artists = cells[artists_i]
            .split(ARTIST_SEPARATOR)
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(String::from)
            .collect();

        tracks.push(TrackRecord::new(
            track_id,
            cells[name_i].trim(),
            artists,
            cells[album_i].trim(),
            duration_secs,
        ));
    }

    Ok(tracks)
}

/// Read and parse a metadata table from disk
pub fn load_metadata(path: &Path) -> Result<Vec<TrackRecord>, DatasetError> {
    let content = std::fs::read_to_string(path)?;
    let tracks = parse_metadata(&content, &path.display().to_string())?;
    info!(path = %path.display(), tracks = tracks.len(), "Loaded metadata table");
    Ok(tracks)
}
