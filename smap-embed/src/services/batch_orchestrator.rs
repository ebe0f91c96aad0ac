//! Bounded-concurrency batch runs over the track pipeline

use crate::error::FailureKind;
use crate::models::{RunReport, RunSummary, TrackOutcome, TrackRecord, TrackReport};
use crate::services::track_pipeline::TrackPipeline;
use crate::utils::TrackSlot;
use futures::stream::{self, StreamExt};
use smap_common::events::{EventBus, PipelineEvent};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Runs a batch of tracks with at most `concurrency` pipelines in flight
pub struct BatchOrchestrator {
    pipeline: Arc<TrackPipeline>,
    event_bus: EventBus,
    progress_every: usize,
}

impl BatchOrchestrator {
    pub fn new(pipeline: Arc<TrackPipeline>, event_bus: EventBus, progress_every: usize) -> Self {
        Self {
            pipeline,
            event_bus,
            progress_every: progress_every.max(1),
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Process every track once and summarize
    ///
    /// One track's failure or panic never affects the others. Reports come
    /// back in input order. A track's slot is only handed to the next track
    /// once its blocking work has ended, so the bound also holds across
    /// timeouts.
    pub async fn run(
        &self,
        tracks: Vec<TrackRecord>,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> RunReport {
        let run_id = Uuid::new_v4();
        let total = tracks.len();
        let concurrency = concurrency.clamp(1, Semaphore::MAX_PERMITS);
        let start = Instant::now();

        info!(%run_id, total, concurrency, "Batch run starting");
        self.event_bus.emit_lossy(PipelineEvent::RunStarted {
            run_id,
            total,
            concurrency,
            timestamp: chrono::Utc::now(),
        });

        let completed = Arc::new(AtomicUsize::new(0));
        let slots = Arc::new(Semaphore::new(concurrency));
        let progress_every = self.progress_every;

        // Tasks are spawned lazily as slots free up
        let mut indexed: Vec<(usize, TrackReport)> = stream::iter(tracks.into_iter().enumerate())
            .map(|(index, track)| {
                let pipeline = Arc::clone(&self.pipeline);
                let event_bus = self.event_bus.clone();
                let completed = Arc::clone(&completed);
                let slots = Arc::clone(&slots);
                let cancel = cancel.clone();
                let track_id = track.track_id.clone();

                async move {
                    let task_start = Instant::now();
                    let permit = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        permit = slots.acquire_owned() => permit.ok(),
                    };
                    let slot = TrackSlot::new(permit, cancel.child_token());
                    let handle = tokio::spawn(async move { pipeline.process(track, slot).await });

                    let report = match handle.await {
                        Ok(report) => report,
                        Err(e) => {
                            let reason = if e.is_panic() {
                                "task panicked"
                            } else {
                                "task aborted"
                            };
                            error!(%run_id, track_id = %track_id, reason, "Track task did not complete");
                            TrackReport {
                                track_id,
                                outcome: TrackOutcome::Failed {
                                    kind: FailureKind::CorruptInput,
                                    reason: reason.to_string(),
                                },
                                elapsed: task_start.elapsed(),
                            }
                        }
                    };

                    let current = completed.fetch_add(1, Ordering::Relaxed) + 1;
                    event_bus.emit_lossy(PipelineEvent::TrackFinished {
                        run_id,
                        track_id: report.track_id.clone(),
                        outcome: report.outcome.label().to_string(),
                        completed: current,
                        total,
                        timestamp: chrono::Utc::now(),
                    });
                    if current % progress_every == 0 || current == total {
                        info!(%run_id, progress = format!("{}/{}", current, total), "Batch progress");
                    }

                    (index, report)
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        // Blocking work from abandoned tracks still holds slots
        let all_slots = u32::try_from(concurrency).unwrap_or(u32::MAX);
        if slots.available_permits() < concurrency {
            debug!(%run_id, "Waiting for abandoned blocking work to stop");
            let _ = slots.acquire_many(all_slots).await;
        }

        indexed.sort_by_key(|(index, _)| *index);
        let reports: Vec<TrackReport> = indexed.into_iter().map(|(_, report)| report).collect();
        let summary = RunSummary::from_reports(&reports);
        let duration = start.elapsed();
        let cancelled = cancel.is_cancelled();

        if cancelled {
            info!(%run_id, completed = summary.total - summary.cancelled, total, "Batch run cancelled");
            self.event_bus.emit_lossy(PipelineEvent::RunCancelled {
                run_id,
                completed: summary.total - summary.cancelled,
                total,
                timestamp: chrono::Utc::now(),
            });
        }

        info!(
            %run_id,
            success = summary.success,
            no_match = summary.no_match,
            failed = summary.failed,
            skipped = summary.skipped,
            cancelled = summary.cancelled,
            duration_ms = duration.as_millis() as u64,
            "Batch run finished"
        );
        self.event_bus.emit_lossy(PipelineEvent::RunFinished {
            run_id,
            success: summary.success,
            no_match: summary.no_match,
            failed: summary.failed,
            skipped: summary.skipped,
            cancelled: summary.cancelled,
            duration_ms: duration.as_millis() as u64,
            timestamp: chrono::Utc::now(),
        });

        RunReport {
            run_id,
            reports,
            summary,
            cancelled,
        }
    }
}
