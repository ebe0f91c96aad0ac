//! Append-only embeddings dataset and table column merging
//!
//! One TSV row per embedded track. The set of written track ids is the
//! resume index: a track with a row is never processed again.

use crate::error::DatasetError;
use crate::models::track::{COL_ALBUM, COL_ARTISTS, COL_SONG_LENGTH, COL_TRACK_ID, COL_TRACK_NAME};
use crate::models::TrackRecord;
use crate::utils::tsv::{append_synced, complete_len, format_row, split_row, write_atomic};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

pub const COL_SOURCE_URL: &str = "Source Url";
pub const COL_AUDIO_PATH: &str = "Audio Path";
pub const COL_EMBEDDING: &str = "Embedding";

/// Dataset file header
pub const DATASET_HEADER: [&str; 8] = [
    COL_TRACK_ID,
    COL_TRACK_NAME,
    COL_ARTISTS,
    COL_ALBUM,
    COL_SONG_LENGTH,
    COL_SOURCE_URL,
    COL_AUDIO_PATH,
    COL_EMBEDDING,
];

/// One dataset row
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetRow {
    pub track_id: String,
    pub name: String,
    pub artists: String,
    pub album: String,
    pub duration_secs: f64,
    pub source_url: String,
    pub audio_path: PathBuf,
    pub embedding: Vec<f32>,
}

impl DatasetRow {
    pub fn new(track: &TrackRecord, source_url: &str, audio_path: &Path, embedding: Vec<f32>) -> Self {
        Self {
            track_id: track.track_id.clone(),
            name: track.name.clone(),
            artists: track.artists_joined(),
            album: track.album.clone(),
            duration_secs: track.duration_secs,
            source_url: source_url.to_string(),
            audio_path: audio_path.to_path_buf(),
            embedding,
        }
    }

    /// Complete TSV line, newline terminated
    pub fn to_tsv(&self) -> Result<String, DatasetError> {
        let embedding = serde_json::to_string(&self.embedding)?;
        let duration = self.duration_secs.to_string();
        let audio_path = self.audio_path.display().to_string();
        Ok(format_row([
            self.track_id.as_str(),
            self.name.as_str(),
            self.artists.as_str(),
            self.album.as_str(),
            duration.as_str(),
            self.source_url.as_str(),
            audio_path.as_str(),
            embedding.as_str(),
        ]))
    }
}

/// Embeddings dataset file
pub struct Dataset {
    path: PathBuf,
    index: RwLock<HashSet<String>>,
    file: Mutex<File>,
}

impl Dataset {
    /// Open or create the dataset and load the resume index
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut index = HashSet::new();

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let complete = complete_len(&bytes);
                if complete < bytes.len() {
                    warn!(
                        path = %path.display(),
                        dropped_bytes = bytes.len() - complete,
                        "Truncating partial trailing row in dataset"
                    );
                    let file = OpenOptions::new().write(true).open(&path).await?;
                    file.set_len(complete as u64).await?;
                    file.sync_all().await?;
                }

                let content = String::from_utf8_lossy(&bytes[..complete]);
                let mut lines = content.lines();
                match lines.next() {
                    Some(header) if split_row(header) == DATASET_HEADER => {}
                    Some(header) => {
                        return Err(DatasetError::Schema {
                            path: path.display().to_string(),
                            reason: format!("unexpected header '{}'", header),
                        })
                    }
                    None => {
                        let mut file = OpenOptions::new().write(true).open(&path).await?;
                        file.write_all(format_row(DATASET_HEADER).as_bytes()).await?;
                        file.sync_all().await?;
                    }
                }

                for (line_no, line) in lines.enumerate().map(|(i, l)| (i + 2, l)) {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let cells = split_row(line);
                    if cells.len() != DATASET_HEADER.len() {
                        // Not a complete row: the track is processed again
                        warn!(path = %path.display(), line = line_no, "Ignoring malformed dataset row");
                        continue;
                    }
                    let track_id = cells[0].trim().to_string();
                    if !index.insert(track_id.clone()) {
                        warn!(path = %path.display(), track_id, "Duplicate dataset row in file");
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut file = File::create(&path).await?;
                file.write_all(format_row(DATASET_HEADER).as_bytes()).await?;
                file.sync_all().await?;
                info!(path = %path.display(), "Created dataset");
            }
            Err(e) => return Err(e.into()),
        }

        let file = OpenOptions::new().append(true).open(&path).await?;
        info!(path = %path.display(), rows = index.len(), "Dataset loaded");

        Ok(Self {
            path,
            index: RwLock::new(index),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn has_row(&self, track_id: &str) -> bool {
        self.index.read().await.contains(track_id)
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Append one row with a single write, synced before returning
    ///
    /// A failed append leaves the file as it was.
    pub async fn append_row(&self, row: &DatasetRow) -> Result<(), DatasetError> {
        let line = row.to_tsv()?;

        let mut file = self.file.lock().await;
        if self.index.read().await.contains(&row.track_id) {
            return Err(DatasetError::DuplicateRow(row.track_id.clone()));
        }

        append_synced(&mut file, line.as_bytes()).await?;
        self.index.write().await.insert(row.track_id.clone());

        debug!(track_id = %row.track_id, "Dataset row appended");
        Ok(())
    }

    /// Embedding cell of every row, keyed by track id
    pub async fn embeddings_by_track_id(&self) -> Result<HashMap<String, String>, DatasetError> {
        let _guard = self.file.lock().await;
        let content = tokio::fs::read_to_string(&self.path).await?;
        read_embeddings(&content, &self.path.display().to_string())
    }
}

/// Parse the embedding column out of dataset TSV content
pub fn read_embeddings(content: &str, source: &str) -> Result<HashMap<String, String>, DatasetError> {
    let mut lines = content.lines();
    let header = lines.next().map(split_row).unwrap_or_default();
    if header != DATASET_HEADER {
        return Err(DatasetError::Schema {
            path: source.to_string(),
            reason: "not a dataset file".to_string(),
        });
    }

    let embedding_col = DATASET_HEADER.len() - 1;
    let mut embeddings = HashMap::new();
    for line in lines.filter(|l| !l.trim().is_empty()) {
        let cells = split_row(line);
        if cells.len() != DATASET_HEADER.len() {
            warn!(source, "Skipping malformed dataset row");
            continue;
        }
        embeddings
            .entry(cells[0].trim().to_string())
            .or_insert_with(|| cells[embedding_col].to_string());
    }
    Ok(embeddings)
}

/// Add `column` to a TSV table, filling cells by `Track ID`
///
/// Fails with `ColumnExists` without touching the file when the header already
/// has the column. Rows without a value get an empty cell. The table is
/// rewritten atomically. Returns the number of rows that received a value.
pub fn add_column_if_absent(
    table_path: &Path,
    column: &str,
    values_by_track_id: &HashMap<String, String>,
) -> Result<usize, DatasetError> {
    let source = table_path.display().to_string();
    let content = std::fs::read_to_string(table_path)?;
    let mut lines = content.lines();

    let header = lines.next().ok_or_else(|| DatasetError::Schema {
        path: source.clone(),
        reason: "file is empty".to_string(),
    })?;
    let columns = split_row(header);
    if columns.iter().any(|c| c.trim() == column) {
        return Err(DatasetError::ColumnExists(column.to_string()));
    }
    let id_col = columns
        .iter()
        .position(|c| c.trim() == COL_TRACK_ID)
        .ok_or_else(|| DatasetError::MissingColumn {
            path: source.clone(),
            column: COL_TRACK_ID.to_string(),
        })?;

    let mut output = String::with_capacity(content.len() * 2);
    output.push_str(&format_row(columns.iter().copied().chain(std::iter::once(column))));

    let mut filled = 0;
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let cells = split_row(line);
        let value = cells
            .get(id_col)
            .and_then(|id| values_by_track_id.get(id.trim()))
            .map(String::as_str);
        if value.is_some() {
            filled += 1;
        }
        output.push_str(&format_row(cells.iter().copied().chain(std::iter::once(value.unwrap_or("")))));
    }

    write_atomic(table_path, output.as_bytes())?;
    info!(path = %source, column, filled, "Column added");
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn row(id: &str, embedding: Vec<f32>) -> DatasetRow {
        DatasetRow {
            track_id: id.to_string(),
            name: "Song\tWith Tab".to_string(),
            artists: "A, B".to_string(),
            album: "Album".to_string(),
            duration_secs: 201.5,
            source_url: format!("https://example.com/{}", id),
            audio_path: PathBuf::from(format!("/audio/sp_id_{}.wav", id)),
            embedding,
        }
    }

    #[tokio::test]
    async fn test_append_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dataset.tsv");

        let dataset = Dataset::open(&path).await.unwrap();
        assert!(dataset.is_empty().await);
        dataset.append_row(&row("t1", vec![1.0, 255.0])).await.unwrap();
        assert!(dataset.has_row("t1").await);
        assert!(matches!(
            dataset.append_row(&row("t1", vec![0.0, 0.0])).await,
            Err(DatasetError::DuplicateRow(_))
        ));
        drop(dataset);

        let reopened = Dataset::open(&path).await.unwrap();
        assert!(reopened.has_row("t1").await);
        assert_eq!(reopened.len().await, 1);

        let embeddings = reopened.embeddings_by_track_id().await.unwrap();
        assert_eq!(embeddings["t1"], "[1.0,255.0]");

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("Song With Tab"));
        assert_eq!(content.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_partial_trailing_row_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dataset.tsv");
        let mut content = format_row(DATASET_HEADER);
        content.push_str(&row("t1", vec![1.0]).to_tsv().unwrap());
        content.push_str("t2\tHalf a ro");
        std::fs::write(&path, &content).unwrap();

        let dataset = Dataset::open(&path).await.unwrap();
        assert!(dataset.has_row("t1").await);
        assert!(!dataset.has_row("t2").await);

        dataset.append_row(&row("t2", vec![2.0])).await.unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 3);
        assert!(!content.contains("Half a ro"));
    }

    #[tokio::test]
    async fn test_row_glued_onto_fragment_not_indexed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dataset.tsv");
        let mut content = format_row(DATASET_HEADER);
        content.push_str(&row("t4", vec![4.0]).to_tsv().unwrap());
        // Remains of a failed append followed by a complete row
        content.push_str("t5\tSong");
        content.push_str(&row("t6", vec![6.0]).to_tsv().unwrap());
        std::fs::write(&path, &content).unwrap();

        let dataset = Dataset::open(&path).await.unwrap();
        assert!(dataset.has_row("t4").await);
        assert!(!dataset.has_row("t5").await);
        assert!(!dataset.has_row("t6").await);
        assert_eq!(dataset.len().await, 1);

        dataset.append_row(&row("t5", vec![5.0])).await.unwrap();
        assert!(dataset.has_row("t5").await);
    }

    #[tokio::test]
    async fn test_wrong_header_is_schema_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dataset.tsv");
        std::fs::write(&path, "Track ID\tSomething\n").unwrap();
        assert!(matches!(Dataset::open(&path).await, Err(DatasetError::Schema { .. })));
    }

    #[test]
    fn test_add_column_if_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("playlist.tsv");
        std::fs::write(
            &path,
            "Track ID\tTrack Name\tMetrics\nt1\tOne\t{}\nt2\tTwo\t{}\n",
        )
        .unwrap();

        let values = HashMap::from([("t1".to_string(), "[1.0,2.0]".to_string())]);
        let filled = add_column_if_absent(&path, "embeddings", &values).unwrap();
        assert_eq!(filled, 1);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "Track ID\tTrack Name\tMetrics\tembeddings");
        assert_eq!(lines[1], "t1\tOne\t{}\t[1.0,2.0]");
        assert_eq!(lines[2], "t2\tTwo\t{}\t");

        // Second attempt leaves the file untouched
        assert!(matches!(
            add_column_if_absent(&path, "embeddings", &values),
            Err(DatasetError::ColumnExists(_))
        ));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), content);
    }

    #[test]
    fn test_add_column_requires_track_id() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("table.tsv");
        std::fs::write(&path, "Name\nx\n").unwrap();
        assert!(matches!(
            add_column_if_absent(&path, "embeddings", &HashMap::new()),
            Err(DatasetError::MissingColumn { .. })
        ));
    }
}
