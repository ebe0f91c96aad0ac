//! Configuration for smap-embed
//!
//! Loaded from TOML with per-key defaults. Lookup order for the file:
//! `--config` → `SMAP_CONFIG` → `~/.config/soundmap/config.toml` → built-in defaults.

use serde::{Deserialize, Serialize};
use smap_common::config::{load_toml, locate_config_file, resolve_under_root, LoggingConfig};
use smap_common::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbedConfig {
    /// Root folder for relative paths (overridden by CLI and `SMAP_ROOT_FOLDER`)
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub resolver: ResolverConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub extractor: ExtractorConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// File locations, relative to the root folder unless absolute
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_audio_dir")]
    pub audio_dir: PathBuf,

    #[serde(default = "default_link_cache")]
    pub link_cache: PathBuf,

    #[serde(default = "default_dataset")]
    pub dataset: PathBuf,

    /// ONNX embedding model
    #[serde(default = "default_model")]
    pub model: PathBuf,

    /// Post-processing parameters (JSON)
    #[serde(default = "default_pca_params")]
    pub pca_params: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            audio_dir: default_audio_dir(),
            link_cache: default_link_cache(),
            dataset: default_dataset(),
            model: default_model(),
            pca_params: default_pca_params(),
        }
    }
}

fn default_audio_dir() -> PathBuf {
    PathBuf::from("audio")
}

fn default_link_cache() -> PathBuf {
    PathBuf::from("links.tsv")
}

fn default_dataset() -> PathBuf {
    PathBuf::from("dataset.tsv")
}

fn default_model() -> PathBuf {
    PathBuf::from("models/vggish.onnx")
}

fn default_pca_params() -> PathBuf {
    PathBuf::from("models/vggish_pca_params.json")
}

/// Source resolver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Maximum accepted |candidate - target| duration difference, seconds
    #[serde(default = "default_tolerance_secs")]
    pub tolerance_secs: f64,

    /// Candidates requested per search
    #[serde(default = "default_candidate_count")]
    pub candidate_count: usize,

    /// Search rate limit
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,

    #[serde(default = "default_search_timeout_secs")]
    pub search_timeout_secs: u64,

    /// Searches per track, first one included (failed or timed-out searches retry)
    #[serde(default = "default_search_max_attempts")]
    pub search_max_attempts: u32,

    /// Added to the wait before each further search retry
    #[serde(default = "default_search_retry_delay_ms")]
    pub search_retry_delay_ms: u64,

    /// yt-dlp executable (name on PATH or absolute path)
    #[serde(default = "default_ytdlp_path")]
    pub ytdlp_path: PathBuf,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            tolerance_secs: default_tolerance_secs(),
            candidate_count: default_candidate_count(),
            requests_per_second: default_requests_per_second(),
            search_timeout_secs: default_search_timeout_secs(),
            search_max_attempts: default_search_max_attempts(),
            search_retry_delay_ms: default_search_retry_delay_ms(),
            ytdlp_path: default_ytdlp_path(),
        }
    }
}

impl ResolverConfig {
    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }
}

fn default_tolerance_secs() -> f64 {
    5.0
}

fn default_candidate_count() -> usize {
    10
}

fn default_requests_per_second() -> u32 {
    2
}

fn default_search_timeout_secs() -> u64 {
    30
}

fn default_search_max_attempts() -> u32 {
    3
}

fn default_search_retry_delay_ms() -> u64 {
    2000
}

fn default_ytdlp_path() -> PathBuf {
    PathBuf::from("yt-dlp")
}

/// Which collaborator downloads source audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchBackend {
    /// yt-dlp subprocess (handles video page URLs)
    #[default]
    Ytdlp,
    /// Plain HTTP GET of a direct media URL
    Http,
}

/// Retrieval worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default)]
    pub backend: FetchBackend,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Added per further retry
    #[serde(default = "default_delay_step_ms")]
    pub delay_step_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Per-attempt deadline
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    /// User-Agent for the HTTP backend
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            backend: FetchBackend::default(),
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            delay_step_ms: default_delay_step_ms(),
            max_delay_ms: default_max_delay_ms(),
            download_timeout_secs: default_download_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl RetrievalConfig {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    5_000
}

fn default_delay_step_ms() -> u64 {
    5_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_download_timeout_secs() -> u64 {
    300
}

fn default_user_agent() -> String {
    format!("smap-embed/{}", env!("CARGO_PKG_VERSION"))
}

/// Feature extractor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Canonical sample rate, Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_window_secs")]
    pub window_secs: f64,

    #[serde(default = "default_hop_secs")]
    pub hop_secs: f64,

    /// Post-processed vector length D
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    /// Name of the model's input tensor
    #[serde(default = "default_model_input")]
    pub model_input: String,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            window_secs: default_window_secs(),
            hop_secs: default_hop_secs(),
            embedding_dim: default_embedding_dim(),
            model_input: default_model_input(),
        }
    }
}

impl ExtractorConfig {
    /// Window length in samples
    pub fn window_len(&self) -> usize {
        (self.window_secs * self.sample_rate as f64).round() as usize
    }

    /// Hop length in samples
    pub fn hop_len(&self) -> usize {
        (self.hop_secs * self.sample_rate as f64).round() as usize
    }
}

fn default_sample_rate() -> u32 {
    16_000
}

fn default_window_secs() -> f64 {
    0.96
}

fn default_hop_secs() -> f64 {
    0.48
}

fn default_embedding_dim() -> usize {
    128
}

fn default_model_input() -> String {
    "input".to_string()
}

/// Batch orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum tracks in flight
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Deadline for one whole track
    #[serde(default = "default_track_timeout_secs")]
    pub track_timeout_secs: u64,

    /// Log progress every N finished tracks
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,

    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            track_timeout_secs: default_track_timeout_secs(),
            progress_every: default_progress_every(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl OrchestratorConfig {
    pub fn track_timeout(&self) -> Duration {
        Duration::from_secs(self.track_timeout_secs)
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_track_timeout_secs() -> u64 {
    900
}

fn default_progress_every() -> usize {
    10
}

fn default_event_capacity() -> usize {
    100
}

/// Paths after resolution against the root folder
#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub root_folder: PathBuf,
    pub audio_dir: PathBuf,
    pub link_cache: PathBuf,
    pub dataset: PathBuf,
    pub model: PathBuf,
    pub pca_params: PathBuf,
}

impl EmbedConfig {
    /// Load configuration, falling back to defaults when no file is found
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match locate_config_file(explicit)? {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                load_toml(&path)
            }
            None => {
                info!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.concurrency == 0 {
            return Err(Error::Config("orchestrator.concurrency must be at least 1".into()));
        }
        if self.retrieval.max_attempts == 0 {
            return Err(Error::Config("retrieval.max_attempts must be at least 1".into()));
        }
        if !self.resolver.tolerance_secs.is_finite() || self.resolver.tolerance_secs < 0.0 {
            return Err(Error::Config(format!(
                "resolver.tolerance_secs must be a non-negative number, got {}",
                self.resolver.tolerance_secs
            )));
        }
        if self.resolver.candidate_count == 0 {
            return Err(Error::Config("resolver.candidate_count must be at least 1".into()));
        }
        if self.resolver.search_max_attempts == 0 {
            return Err(Error::Config("resolver.search_max_attempts must be at least 1".into()));
        }
        if self.resolver.requests_per_second == 0 {
            return Err(Error::Config("resolver.requests_per_second must be at least 1".into()));
        }
        if self.extractor.sample_rate == 0 {
            return Err(Error::Config("extractor.sample_rate must be positive".into()));
        }
        if !(self.extractor.window_secs > 0.0) || self.extractor.window_len() == 0 {
            return Err(Error::Config(format!(
                "extractor.window_secs must be positive, got {}",
                self.extractor.window_secs
            )));
        }
        if !(self.extractor.hop_secs > 0.0) || self.extractor.hop_len() == 0 {
            return Err(Error::Config(format!(
                "extractor.hop_secs must be positive, got {}",
                self.extractor.hop_secs
            )));
        }
        if self.extractor.hop_len() > self.extractor.window_len() {
            return Err(Error::Config(format!(
                "extractor.hop_secs ({}) must not exceed extractor.window_secs ({})",
                self.extractor.hop_secs, self.extractor.window_secs
            )));
        }
        if self.extractor.embedding_dim == 0 {
            return Err(Error::Config("extractor.embedding_dim must be at least 1".into()));
        }
        Ok(())
    }

    /// Resolve every configured path against `root_folder`
    pub fn resolve_paths(&self, root_folder: &Path) -> ResolvedPaths {
        ResolvedPaths {
            root_folder: root_folder.to_path_buf(),
            audio_dir: resolve_under_root(root_folder, &self.paths.audio_dir),
            link_cache: resolve_under_root(root_folder, &self.paths.link_cache),
            dataset: resolve_under_root(root_folder, &self.paths.dataset),
            model: resolve_under_root(root_folder, &self.paths.model),
            pca_params: resolve_under_root(root_folder, &self.paths.pca_params),
        }
    }
}
