//! Per-track pipeline: resume check → link lookup/resolve → retrieve → extract → append
//!
//! Every error is converted to a [`TrackOutcome`] here; nothing escapes to the
//! orchestrator except the report.

use crate::error::{LinkCacheError, RetrievalError, TrackError};
use crate::models::{is_valid_track_id, LinkKey, TrackOutcome, TrackRecord, TrackReport};
use crate::services::dataset::{Dataset, DatasetRow};
use crate::services::feature_extractor::FeatureExtractor;
use crate::services::link_cache::LinkCache;
use crate::services::retrieval_worker::RetrievalWorker;
use crate::services::source_resolver::{MatchDecision, SourceResolver};
use crate::utils::TrackSlot;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Shared components for processing one track at a time
pub struct TrackPipeline {
    link_cache: Arc<LinkCache>,
    resolver: Arc<SourceResolver>,
    retrieval: Arc<RetrievalWorker>,
    extractor: FeatureExtractor,
    dataset: Arc<Dataset>,
    /// Overrides the resolver's configured tolerance
    tolerance_secs: Option<f64>,
    track_timeout: Duration,
}

impl TrackPipeline {
    pub fn new(
        link_cache: Arc<LinkCache>,
        resolver: Arc<SourceResolver>,
        retrieval: Arc<RetrievalWorker>,
        extractor: FeatureExtractor,
        dataset: Arc<Dataset>,
        track_timeout: Duration,
    ) -> Self {
        Self {
            link_cache,
            resolver,
            retrieval,
            extractor,
            dataset,
            tolerance_secs: None,
            track_timeout,
        }
    }

    pub fn with_tolerance(mut self, tolerance_secs: Option<f64>) -> Self {
        self.tolerance_secs = tolerance_secs;
        self
    }

    pub fn dataset(&self) -> &Arc<Dataset> {
        &self.dataset
    }

    /// Run one track to a terminal outcome
    ///
    /// A cancelled slot before start means no work at all. In-flight async work
    /// is dropped on cancellation or timeout, which removes any staging files
    /// it owned; blocking work is told to stop through `slot` and keeps the
    /// slot until it does.
    pub async fn process(&self, mut track: TrackRecord, slot: TrackSlot) -> TrackReport {
        let start = Instant::now();
        let track_id = track.track_id.clone();

        let outcome = if slot.is_cancelled() {
            TrackOutcome::Cancelled
        } else {
            let outcome = tokio::select! {
                biased;
                _ = slot.cancelled() => {
                    debug!(track_id = %track_id, "Track aborted by cancellation");
                    TrackOutcome::Cancelled
                }
                result = tokio::time::timeout(self.track_timeout, self.run_stages(&mut track, &slot)) => {
                    match result {
                        Ok(Ok(outcome)) => outcome,
                        Ok(Err(e)) => TrackOutcome::from(e),
                        Err(_) => TrackOutcome::from(TrackError::Timeout(self.track_timeout)),
                    }
                }
            };
            slot.abort();
            outcome
        };

        let elapsed = start.elapsed();
        match &outcome {
            TrackOutcome::Failed { kind, reason } => {
                track.mark_failed();
                error!(track_id = %track_id, kind = %kind, reason = %reason, "Track failed");
            }
            TrackOutcome::NoMatch { best_diff } => {
                info!(track_id = %track_id, best_diff = ?best_diff, "No source within tolerance");
            }
            other => {
                debug!(
                    track_id = %track_id,
                    outcome = other.label(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Track finished"
                );
            }
        }

        TrackReport {
            track_id,
            outcome,
            elapsed,
        }
    }

    async fn run_stages(&self, track: &mut TrackRecord, slot: &TrackSlot) -> Result<TrackOutcome, TrackError> {
        if self.dataset.has_row(&track.track_id).await {
            return Ok(TrackOutcome::Skipped);
        }
        if !is_valid_track_id(&track.track_id) {
            return Err(RetrievalError::InvalidTrackId(track.track_id.clone()).into());
        }

        let key = track.link_key();
        let (mut url, cached) = match self.link_cache.lookup(&key).await {
            Some(url) => (url, true),
            None => (self.resolve_and_cache(track, &key).await?, false),
        };
        track.mark_resolved(&url);

        let audio_path = match self.retrieval.retrieve(&track.track_id, &url, slot).await {
            Ok(path) => path,
            Err(RetrievalError::SourceUnavailable(reason)) if cached => {
                warn!(
                    track_id = %track.track_id,
                    url = %url,
                    reason = %reason,
                    "Cached source is gone, re-resolving"
                );
                self.link_cache.invalidate(&key).await?;
                url = self.resolve_and_cache(track, &key).await?;
                track.mark_resolved(&url);
                self.retrieval.retrieve(&track.track_id, &url, slot).await?
            }
            Err(e) => return Err(e.into()),
        };
        track.mark_downloaded(&audio_path);

        let vector = self.extractor.extract_async(audio_path.clone(), slot).await?;

        let row = DatasetRow::new(track, &url, &audio_path, vector.clone());
        self.dataset.append_row(&row).await?;
        track.mark_embedded(vector.clone());

        Ok(TrackOutcome::Success { vector })
    }

    /// Search for a source and record it in the link cache
    ///
    /// If another task cached a different URL for the key first, that URL is used.
    async fn resolve_and_cache(&self, track: &TrackRecord, key: &LinkKey) -> Result<String, TrackError> {
        let decision = self
            .resolver
            .resolve(&track.search_query(), track.duration_secs, self.tolerance_secs)
            .await?;

        let candidate = match decision {
            MatchDecision::Match { candidate, diff } => {
                debug!(track_id = %track.track_id, url = %candidate.url, diff, "Source resolved");
                candidate
            }
            MatchDecision::NoMatch { best_diff } => return Err(TrackError::NoMatch { best_diff }),
        };

        match self.link_cache.insert(key.clone(), &candidate.url).await {
            Ok(_) => Ok(candidate.url),
            Err(LinkCacheError::Conflict { existing, .. }) => Ok(existing),
            Err(e) => Err(e.into()),
        }
    }
}
