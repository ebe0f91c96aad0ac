//! Mock collaborators and a wired-up test pipeline

use super::audio_fixtures::{write_corrupt_file, write_test_wav, AudioFixture};
use async_trait::async_trait;
use smap_common::events::EventBus;
use smap_embed::config::{ExtractorConfig, ResolverConfig};
use smap_embed::error::{ExtractError, RetrievalError, SearchError};
use smap_embed::models::TrackRecord;
use smap_embed::services::{
    AudioFetcher, BatchOrchestrator, Dataset, EmbeddingModel, FeatureExtractor, LinkCache,
    RetrievalWorker, RetryPolicy, SearchBackend, SearchCandidate, SourceResolver, TrackPipeline,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const TEST_EMBEDDING_DIM: usize = 8;

/// Tracks the peak number of concurrent calls
#[derive(Default)]
struct InFlight {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl InFlight {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Search collaborator answering from a fixed table keyed by query
#[derive(Default)]
pub struct MockSearch {
    results: Mutex<HashMap<String, Vec<SearchCandidate>>>,
    failures: Mutex<Vec<SearchError>>,
    calls: AtomicUsize,
}

impl MockSearch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer `track`'s query with one candidate
    pub fn register(&self, track: &TrackRecord, url: &str, duration_secs: f64) {
        let candidate = SearchCandidate {
            id: url.rsplit('/').next().unwrap_or(url).to_string(),
            url: url.to_string(),
            duration_secs: Some(duration_secs),
            title: Some(track.name.clone()),
        };
        self.results
            .lock()
            .unwrap()
            .insert(track.search_query(), vec![candidate]);
    }

    /// Fail the next search, whatever the query
    pub fn fail_next(&self, error: SearchError) {
        self.failures.lock().unwrap().push(error);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchBackend for MockSearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchCandidate>, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.lock().unwrap().pop() {
            return Err(error);
        }
        let results = self.results.lock().unwrap();
        Ok(results
            .get(query)
            .map(|c| c.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn health_check(&self) -> Result<(), SearchError> {
        Ok(())
    }
}

/// What the mock fetcher does for a URL
#[derive(Debug, Clone)]
pub enum FetchBehavior {
    /// Download a generated WAV
    Audio(AudioFixture),
    /// Download bytes that do not decode
    Corrupt,
    /// Remote target removed
    Gone,
    /// Panic inside the track task
    Panic,
}

/// Fetcher serving generated files per URL
pub struct MockFetcher {
    behaviors: Mutex<HashMap<String, FetchBehavior>>,
    calls: AtomicUsize,
    delay: Duration,
    in_flight: InFlight,
}

impl MockFetcher {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            behaviors: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            delay,
            in_flight: InFlight::default(),
        })
    }

    pub fn set(&self, url: &str, behavior: FetchBehavior) {
        self.behaviors.lock().unwrap().insert(url.to_string(), behavior);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Peak concurrent fetches
    pub fn max_in_flight(&self) -> usize {
        self.in_flight.max.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioFetcher for MockFetcher {
    async fn fetch(&self, url: &str, staging_dir: &Path) -> Result<PathBuf, RetrievalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behaviors.lock().unwrap().get(url).cloned();

        self.in_flight.enter();
        tokio::time::sleep(self.delay).await;
        self.in_flight.exit();

        match behavior {
            Some(FetchBehavior::Audio(fixture)) => {
                let path = staging_dir.join("source.wav");
                write_test_wav(&path, &fixture)
                    .map_err(|e| RetrievalError::Transient(e.to_string()))?;
                Ok(path)
            }
            Some(FetchBehavior::Corrupt) => {
                let path = staging_dir.join("source.mp3");
                write_corrupt_file(&path)?;
                Ok(path)
            }
            Some(FetchBehavior::Gone) | None => {
                Err(RetrievalError::SourceUnavailable(format!("{} is gone", url)))
            }
            Some(FetchBehavior::Panic) => panic!("fetcher exploded on {}", url),
        }
    }

    async fn health_check(&self) -> Result<(), RetrievalError> {
        Ok(())
    }
}

/// Deterministic model: per-segment peak magnitude of the window
pub struct MockModel {
    calls: AtomicUsize,
    in_flight: InFlight,
    delay: Duration,
}

impl MockModel {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::from_millis(2))
    }

    /// Model taking `delay` per window
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            in_flight: InFlight::default(),
            delay,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Peak concurrent inferences
    pub fn max_in_flight(&self) -> usize {
        self.in_flight.max.load(Ordering::SeqCst)
    }
}

impl EmbeddingModel for MockModel {
    fn infer(&self, window: &[f32]) -> Result<Vec<f32>, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.in_flight.enter();
        std::thread::sleep(self.delay);
        let segment = window.len().div_ceil(TEST_EMBEDDING_DIM).max(1);
        let vector = (0..TEST_EMBEDDING_DIM)
            .map(|d| {
                window
                    .iter()
                    .skip(d * segment)
                    .take(segment)
                    .fold(0.0f32, |acc, s| acc.max(s.abs()))
            })
            .collect();
        self.in_flight.exit();
        Ok(vector)
    }

    fn raw_dim(&self) -> usize {
        TEST_EMBEDDING_DIM
    }
}

/// A pipeline over mocks rooted in a temp dir
pub struct TestEnvironment {
    pub dir: TempDir,
    pub search: Arc<MockSearch>,
    pub fetcher: Arc<MockFetcher>,
    pub model: Arc<MockModel>,
    /// Whole-track deadline for pipelines built by `orchestrator`
    pub track_timeout: Duration,
}

impl TestEnvironment {
    pub fn audio_dir(&self) -> PathBuf {
        self.dir.path().join("audio")
    }

    pub fn link_cache_path(&self) -> PathBuf {
        self.dir.path().join("links.tsv")
    }

    pub fn dataset_path(&self) -> PathBuf {
        self.dir.path().join("dataset.tsv")
    }

    /// Open the files and wire a fresh orchestrator, as a new process would
    pub async fn orchestrator(&self) -> (BatchOrchestrator, Arc<LinkCache>, Arc<Dataset>) {
        let link_cache = Arc::new(LinkCache::open(self.link_cache_path()).await.unwrap());
        let dataset = Arc::new(Dataset::open(self.dataset_path()).await.unwrap());

        let resolver_config = ResolverConfig {
            requests_per_second: 1000,
            search_retry_delay_ms: 0,
            ..ResolverConfig::default()
        };
        let resolver = Arc::new(SourceResolver::new(self.search.clone(), &resolver_config));

        let retrieval = Arc::new(
            RetrievalWorker::new(
                self.fetcher.clone(),
                self.audio_dir(),
                RetryPolicy::immediate(3),
                Duration::from_secs(10),
                16_000,
            )
            .unwrap(),
        );

        let extractor_config = ExtractorConfig {
            embedding_dim: TEST_EMBEDDING_DIM,
            ..ExtractorConfig::default()
        };
        let extractor = FeatureExtractor::new(self.model.clone(), None, extractor_config).unwrap();

        let pipeline = Arc::new(TrackPipeline::new(
            Arc::clone(&link_cache),
            resolver,
            retrieval,
            extractor,
            Arc::clone(&dataset),
            self.track_timeout,
        ));

        (
            BatchOrchestrator::new(pipeline, EventBus::new(100), 10),
            link_cache,
            dataset,
        )
    }
}

pub fn test_environment(fetch_delay: Duration) -> TestEnvironment {
    TestEnvironment {
        dir: TempDir::new().unwrap(),
        search: MockSearch::new(),
        fetcher: MockFetcher::new(fetch_delay),
        model: MockModel::new(),
        track_timeout: Duration::from_secs(60),
    }
}
