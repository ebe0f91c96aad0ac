//! Idempotent, retrying retrieval of canonical track audio
//!
//! A track's canonical file is `<audio_dir>/sp_id_<track_id>.wav`. It only
//! appears through an atomic rename, so if it exists it is complete and no
//! network access happens. Each fetch attempt stages into its own temp
//! directory under `<audio_dir>/.partial`, removed when the attempt ends.

use crate::config::RetrievalConfig;
use crate::error::RetrievalError;
use crate::models::{canonical_audio_path, is_valid_track_id};
use crate::services::retry_policy::RetryPolicy;
use crate::utils::audio_decoder::transcode_to_canonical;
use crate::utils::TrackSlot;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Staging subdirectory of the audio dir
pub const STAGING_DIR_NAME: &str = ".partial";

/// Downloads source audio for a URL
#[async_trait]
pub trait AudioFetcher: Send + Sync {
    /// Download `url` into `staging_dir` and return the downloaded file
    ///
    /// `staging_dir` is owned by the caller and removed after the attempt.
    async fn fetch(&self, url: &str, staging_dir: &Path) -> Result<PathBuf, RetrievalError>;

    /// Verify the fetcher is usable before a run
    async fn health_check(&self) -> Result<(), RetrievalError>;
}

/// Retrieval worker
pub struct RetrievalWorker {
    fetcher: Arc<dyn AudioFetcher>,
    audio_dir: PathBuf,
    staging_root: PathBuf,
    policy: RetryPolicy,
    download_timeout: Duration,
    sample_rate: u32,
}

impl RetrievalWorker {
    /// Create the worker, preparing `audio_dir` and clearing stale staging data
    pub fn new(
        fetcher: Arc<dyn AudioFetcher>,
        audio_dir: impl Into<PathBuf>,
        policy: RetryPolicy,
        download_timeout: Duration,
        sample_rate: u32,
    ) -> Result<Self, RetrievalError> {
        let audio_dir = audio_dir.into();
        let staging_root = audio_dir.join(STAGING_DIR_NAME);

        std::fs::create_dir_all(&audio_dir)?;
        if staging_root.exists() {
            info!(path = %staging_root.display(), "Removing stale staging data");
            std::fs::remove_dir_all(&staging_root)?;
        }
        std::fs::create_dir_all(&staging_root)?;

        Ok(Self {
            fetcher,
            audio_dir,
            staging_root,
            policy,
            download_timeout,
            sample_rate,
        })
    }

    pub fn from_config(
        fetcher: Arc<dyn AudioFetcher>,
        audio_dir: impl Into<PathBuf>,
        config: &RetrievalConfig,
        sample_rate: u32,
    ) -> Result<Self, RetrievalError> {
        Self::new(
            fetcher,
            audio_dir,
            RetryPolicy::new(config),
            config.download_timeout(),
            sample_rate,
        )
    }

    pub fn audio_dir(&self) -> &Path {
        &self.audio_dir
    }

    pub async fn health_check(&self) -> Result<(), RetrievalError> {
        self.fetcher.health_check().await
    }

    /// Canonical file for `track_id`, if it is already present
    pub async fn existing(&self, track_id: &str) -> Result<Option<PathBuf>, RetrievalError> {
        if !is_valid_track_id(track_id) {
            return Err(RetrievalError::InvalidTrackId(track_id.to_string()));
        }
        let dest = canonical_audio_path(&self.audio_dir, track_id);
        Ok(tokio::fs::try_exists(&dest).await?.then_some(dest))
    }

    /// Ensure the canonical file for `track_id` exists, fetching `url` if needed
    ///
    /// The transcode step holds `slot` until it finishes, even if this future
    /// is dropped first.
    pub async fn retrieve(
        &self,
        track_id: &str,
        url: &str,
        slot: &TrackSlot,
    ) -> Result<PathBuf, RetrievalError> {
        if let Some(path) = self.existing(track_id).await? {
            debug!(track_id, path = %path.display(), "Canonical audio already present");
            return Ok(path);
        }

        validate_url(url)?;

        let dest = canonical_audio_path(&self.audio_dir, track_id);
        let operation = format!("fetch {}", track_id);
        self.policy
            .run(&operation, |attempt| self.attempt(track_id, url, &dest, attempt, slot))
            .await?;

        info!(track_id, path = %dest.display(), "Canonical audio written");
        Ok(dest)
    }

    async fn attempt(
        &self,
        track_id: &str,
        url: &str,
        dest: &Path,
        attempt: u32,
        slot: &TrackSlot,
    ) -> Result<(), RetrievalError> {
        let staging = tempfile::Builder::new()
            .prefix(&format!("{}-{}-", track_id, attempt))
            .tempdir_in(&self.staging_root)?;

        debug!(track_id, url, attempt, "Fetching source audio");
        let fetched = tokio::time::timeout(self.download_timeout, self.fetcher.fetch(url, staging.path()))
            .await
            .map_err(|_| RetrievalError::Timeout(self.download_timeout))??;

        let dest = dest.to_path_buf();
        let rate = self.sample_rate;
        let slot = slot.clone();
        tokio::task::spawn_blocking(move || {
            let _slot = slot;
            transcode_to_canonical(&fetched, &dest, rate)
        })
        .await
        .map_err(|e| RetrievalError::Io(std::io::Error::other(format!("Transcode task failed: {}", e))))??;

        if let Err(e) = staging.close() {
            warn!(track_id, error = %e, "Failed to remove staging directory");
        }
        Ok(())
    }
}

/// Accept only absolute http(s) URLs
pub fn validate_url(url: &str) -> Result<reqwest::Url, RetrievalError> {
    let parsed =
        reqwest::Url::parse(url).map_err(|e| RetrievalError::InvalidUrl(format!("{}: {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(RetrievalError::InvalidUrl(format!(
            "{}: unsupported scheme '{}'",
            url, other
        ))),
    }
}
