//! Source resolution by duration matching
//!
//! One bounded search per track (retried when it fails transiently), then the
//! candidate whose duration is closest to the target wins, provided the
//! difference is within tolerance.

use crate::config::ResolverConfig;
use crate::error::SearchError;
use crate::services::retry_policy::RetryPolicy;
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One search result, in rank order
#[derive(Debug, Clone, PartialEq)]
pub struct SearchCandidate {
    pub id: String,
    pub url: String,
    /// Unknown for live streams and some playlists
    pub duration_secs: Option<f64>,
    pub title: Option<String>,
}

/// Search collaborator
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Up to `limit` candidates for a free-text query, best-ranked first
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchCandidate>, SearchError>;

    /// Verify the backend is usable before a run
    async fn health_check(&self) -> Result<(), SearchError>;
}

/// Result of candidate selection
#[derive(Debug, Clone, PartialEq)]
pub enum MatchDecision {
    Match {
        candidate: SearchCandidate,
        /// |candidate duration - target|, seconds
        diff: f64,
    },
    NoMatch {
        /// Smallest difference seen, if any candidate had a duration
        best_diff: Option<f64>,
    },
}

/// Pick the candidate closest in duration to `target_secs`
///
/// Candidates without a finite duration are ignored. Ties go to the
/// earliest-ranked candidate. A difference equal to `tolerance_secs` is accepted.
pub fn select_best_candidate(
    candidates: &[SearchCandidate],
    target_secs: f64,
    tolerance_secs: f64,
) -> MatchDecision {
    let mut best: Option<(&SearchCandidate, f64)> = None;

    for candidate in candidates {
        let duration = match candidate.duration_secs {
            Some(d) if d.is_finite() => d,
            _ => continue,
        };
        let diff = (duration - target_secs).abs();
        if best.map_or(true, |(_, best_diff)| diff < best_diff) {
            best = Some((candidate, diff));
        }
    }

    match best {
        Some((candidate, diff)) if diff <= tolerance_secs => MatchDecision::Match {
            candidate: candidate.clone(),
            diff,
        },
        Some((_, diff)) => MatchDecision::NoMatch {
            best_diff: Some(diff),
        },
        None => MatchDecision::NoMatch { best_diff: None },
    }
}

/// Rate-limited resolver over a search backend
pub struct SourceResolver {
    backend: Arc<dyn SearchBackend>,
    rate_limiter: DefaultDirectRateLimiter,
    candidate_count: usize,
    search_timeout: Duration,
    tolerance_secs: f64,
    retry: RetryPolicy,
}

impl SourceResolver {
    pub fn new(backend: Arc<dyn SearchBackend>, config: &ResolverConfig) -> Self {
        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            backend,
            rate_limiter: RateLimiter::direct(Quota::per_second(per_second)),
            candidate_count: config.candidate_count,
            search_timeout: config.search_timeout(),
            tolerance_secs: config.tolerance_secs,
            retry: RetryPolicy::for_search(config),
        }
    }

    pub fn tolerance_secs(&self) -> f64 {
        self.tolerance_secs
    }

    pub async fn health_check(&self) -> Result<(), SearchError> {
        self.backend.health_check().await
    }

    /// Search and select the best candidate
    ///
    /// Failed or timed-out searches are retried under the search policy, each
    /// attempt waiting on the rate limiter. `tolerance_secs` overrides the
    /// configured tolerance for this call.
    pub async fn resolve(
        &self,
        query: &str,
        target_secs: f64,
        tolerance_secs: Option<f64>,
    ) -> Result<MatchDecision, SearchError> {
        let candidates = self
            .retry
            .run("search", |_| async move { self.search_once(query).await })
            .await?;

        let tolerance = tolerance_secs.unwrap_or(self.tolerance_secs);
        let decision = select_best_candidate(&candidates, target_secs, tolerance);

        debug!(
            query,
            candidates = candidates.len(),
            target_secs,
            tolerance,
            decision = ?decision,
            "Search resolved"
        );

        Ok(decision)
    }

    async fn search_once(&self, query: &str) -> Result<Vec<SearchCandidate>, SearchError> {
        self.rate_limiter.until_ready().await;
        tokio::time::timeout(
            self.search_timeout,
            self.backend.search(query, self.candidate_count),
        )
        .await
        .map_err(|_| SearchError::Timeout(self.search_timeout))?
    }
}
