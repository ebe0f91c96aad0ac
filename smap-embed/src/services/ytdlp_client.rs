//! yt-dlp subprocess client
//!
//! Serves both as the search backend (`ytsearchN:` flat listing) and as an
//! audio fetcher. The client holds no global state: create it, call
//! `health_check`, use it, drop it.

use crate::error::{RetrievalError, SearchError};
use crate::services::retrieval_worker::AudioFetcher;
use crate::services::source_resolver::{SearchBackend, SearchCandidate};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Output file stem inside the staging directory
const OUTPUT_STEM: &str = "source";

/// Preferred formats, best first; M4A decodes without an Opus codec
const FORMAT_SELECTOR: &str = "bestaudio[ext=m4a]/bestaudio/best";

/// Stderr fragments meaning the remote target is gone for good
const UNAVAILABLE_MARKERS: [&str; 7] = [
    "Video unavailable",
    "Private video",
    "has been removed",
    "account associated with this video has been terminated",
    "HTTP Error 404",
    "HTTP Error 410",
    "Unsupported URL",
];

#[derive(Debug, Deserialize)]
struct SearchListing {
    #[serde(default)]
    entries: Vec<SearchEntry>,
}

#[derive(Debug, Deserialize)]
struct SearchEntry {
    id: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
}

impl From<SearchEntry> for SearchCandidate {
    fn from(entry: SearchEntry) -> Self {
        let url = entry
            .url
            .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
            .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={}", entry.id));
        SearchCandidate {
            id: entry.id,
            url,
            duration_secs: entry.duration,
            title: entry.title,
        }
    }
}

/// Parse `--dump-single-json` output of a flat search
pub fn parse_search_output(stdout: &[u8]) -> Result<Vec<SearchCandidate>, SearchError> {
    let listing: SearchListing = serde_json::from_slice(stdout)
        .map_err(|e| SearchError::Parse(format!("Invalid yt-dlp JSON: {}", e)))?;
    Ok(listing.entries.into_iter().map(SearchCandidate::from).collect())
}

/// Map yt-dlp failure output onto the retrieval taxonomy
pub fn classify_fetch_failure(stderr: &str) -> RetrievalError {
    let message = stderr
        .lines()
        .rev()
        .find(|l| l.contains("ERROR"))
        .unwrap_or_else(|| stderr.trim())
        .to_string();
    if UNAVAILABLE_MARKERS.iter().any(|m| stderr.contains(m)) {
        RetrievalError::SourceUnavailable(message)
    } else {
        RetrievalError::Transient(message)
    }
}

/// yt-dlp client
pub struct YtDlpClient {
    program: PathBuf,
}

impl YtDlpClient {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run `--version`; fails when the binary is missing or broken
    pub async fn version(&self) -> std::io::Result<String> {
        let output = self.command().arg("--version").output().await?;
        if !output.status.success() {
            return Err(std::io::Error::other(format!(
                "{} --version exited with {}",
                self.program.display(),
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl SearchBackend for YtDlpClient {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchCandidate>, SearchError> {
        let output = self
            .command()
            .args(["--flat-playlist", "--dump-single-json", "--no-warnings"])
            .arg(format!("ytsearch{}:{}", limit, query))
            .output()
            .await
            .map_err(|e| SearchError::ToolUnavailable(format!("{}: {}", self.program.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SearchError::Failed(stderr.trim().to_string()));
        }

        let candidates = parse_search_output(&output.stdout)?;
        debug!(query, found = candidates.len(), "yt-dlp search complete");
        Ok(candidates)
    }

    async fn health_check(&self) -> Result<(), SearchError> {
        let version = self
            .version()
            .await
            .map_err(|e| SearchError::ToolUnavailable(e.to_string()))?;
        debug!(program = %self.program.display(), version = %version, "yt-dlp available");
        Ok(())
    }
}

#[async_trait]
impl AudioFetcher for YtDlpClient {
    async fn fetch(&self, url: &str, staging_dir: &Path) -> Result<PathBuf, RetrievalError> {
        let template = staging_dir.join(format!("{}.%(ext)s", OUTPUT_STEM));

        let output = self
            .command()
            .args(["-f", FORMAT_SELECTOR, "--no-playlist", "--no-cache-dir", "--no-progress", "-o"])
            .arg(&template)
            .arg(url)
            .output()
            .await
            .map_err(|e| RetrievalError::ToolUnavailable(format!("{}: {}", self.program.display(), e)))?;

        if !output.status.success() {
            return Err(classify_fetch_failure(&String::from_utf8_lossy(&output.stderr)));
        }

        find_output_file(staging_dir).await?.ok_or_else(|| {
            RetrievalError::Transient(format!("yt-dlp produced no output file for {}", url))
        })
    }

    async fn health_check(&self) -> Result<(), RetrievalError> {
        self.version()
            .await
            .map(|_| ())
            .map_err(|e| RetrievalError::ToolUnavailable(e.to_string()))
    }
}

/// First completed `source.*` file in the staging directory
async fn find_output_file(staging_dir: &Path) -> Result<Option<PathBuf>, RetrievalError> {
    let mut entries = tokio::fs::read_dir(staging_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let is_partial = name.ends_with(".part") || name.ends_with(".ytdl");
        if name.starts_with(OUTPUT_STEM) && !is_partial && path.is_file() {
            return Ok(Some(path));
        }
    }
    Ok(None)
}
