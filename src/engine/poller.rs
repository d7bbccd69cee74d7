//! Poll loop driver: fetch, detect change, emit, trace, sleep, sweep.
//!
//! One poller per source. Entities are processed one at a time in fetch
//! order, and every per-cycle failure is logged and absorbed; the loop only
//! ends when the shutdown signal fires.

use opentelemetry::KeyValue;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, warn};

use crate::config::PollSettings;
use crate::dedup::DedupCache;
use crate::error::Error;
use crate::event::Emitter;
use crate::identity;
use crate::model::{EntitySnapshot, RunState, SourceType};
use crate::source::{SnapshotSource, TimeWindow};
use crate::telemetry::metrics;
use crate::telemetry::poll::{record_cycle_result, start_cycle_span};
use crate::trace::{TraceSink, build_trace};

/// What happened to one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Same state as last published; nothing sent.
    Unchanged,
    /// Published; `traced` is set when a terminal state produced a trace.
    Emitted { traced: bool },
    /// Building or publishing the event failed; the cache was not touched.
    Failed,
}

/// Counters for one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// The fetch itself failed and the cycle was skipped.
    pub fetch_failed: bool,
    pub fetched: usize,
    pub excluded: usize,
    pub unchanged: usize,
    pub emitted: usize,
    pub failed: usize,
    pub traced: usize,
}

pub struct Poller {
    source: Box<dyn SnapshotSource>,
    emitter: Emitter,
    traces: Arc<dyn TraceSink>,
    cache: DedupCache<String, RunState>,
    settings: PollSettings,
}

impl Poller {
    pub fn new(
        source: Box<dyn SnapshotSource>,
        emitter: Emitter,
        traces: Arc<dyn TraceSink>,
        settings: PollSettings,
        cache_ttl: std::time::Duration,
    ) -> Self {
        Self {
            source,
            emitter,
            traces,
            cache: DedupCache::new(cache_ttl),
            settings,
        }
    }

    pub fn source_type(&self) -> SourceType {
        self.source.source_type()
    }

    pub fn cache(&self) -> &DedupCache<String, RunState> {
        &self.cache
    }

    /// Poll until `shutdown` flips to true or its sender goes away.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let source = self.source_type();
        info!(
            %source,
            interval_secs = self.settings.interval.as_secs(),
            window_secs = self.settings.window.as_secs(),
            "poller started"
        );

        while !*shutdown.borrow() {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.poll_once() => {}
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
            let swept = self.cache.sweep_expired();
            if swept > 0 {
                debug!(%source, swept, remaining = self.cache.len(), "expired dedup entries");
            }
        }

        info!(%source, "poller stopped");
    }

    /// One fetch-and-process pass.
    pub async fn poll_once(&mut self) -> CycleReport {
        let source = self.source_type();
        let span = start_cycle_span(source);
        let started = Instant::now();

        let report = self.cycle(source).instrument(span.clone()).await;

        record_cycle_result(
            &span,
            report.fetched,
            report.emitted,
            report.failed,
            report.traced,
        );
        metrics::poll_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("source", source.as_str())],
        );
        metrics::poll_cycles().add(
            1,
            &[
                KeyValue::new("source", source.as_str()),
                KeyValue::new("result", if report.fetch_failed { "error" } else { "ok" }),
            ],
        );
        report
    }

    async fn cycle(&mut self, source: SourceType) -> CycleReport {
        let mut report = CycleReport::default();
        let window = TimeWindow::trailing(self.settings.window);

        let snapshots = match self.source.fetch(&window, &self.settings.exclude).await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                error!(%source, error = %e, "fetch failed, skipping cycle");
                report.fetch_failed = true;
                return report;
            }
        };
        report.fetched = snapshots.len();

        for snapshot in snapshots {
            if self.settings.exclude.excludes(&snapshot.logical_name) {
                report.excluded += 1;
                continue;
            }
            match self.process(snapshot).await {
                Outcome::Unchanged => report.unchanged += 1,
                Outcome::Emitted { traced } => {
                    report.emitted += 1;
                    report.traced += usize::from(traced);
                }
                Outcome::Failed => report.failed += 1,
            }
        }

        debug!(%source, ?report, "cycle complete");
        report
    }

    /// Run change detection for one snapshot and act on it.
    pub async fn process(&mut self, snapshot: EntitySnapshot) -> Outcome {
        if !self.cache.is_changed(&snapshot.id, &snapshot.state) {
            return Outcome::Unchanged;
        }

        let source = snapshot.source;
        let name = identity::normalize(&snapshot);
        match self.emitter.emit(&snapshot, &name).await {
            Ok(msg_id) => {
                self.cache.set(snapshot.id.clone(), snapshot.state.clone());
                debug!(
                    %source,
                    entity_id = %snapshot.id,
                    %name,
                    state = %snapshot.state,
                    %msg_id,
                    "published state change"
                );
                metrics::events_published().add(
                    1,
                    &[
                        KeyValue::new("source", source.as_str()),
                        KeyValue::new("result", "ok"),
                    ],
                );
            }
            Err(e) => {
                let result = match &e {
                    Error::Serialization(_) => "serialization_error",
                    _ => "publish_error",
                };
                error!(
                    %source,
                    entity_id = %snapshot.id,
                    %name,
                    state = %snapshot.state,
                    error = %e,
                    "failed to publish state change"
                );
                metrics::events_published().add(
                    1,
                    &[
                        KeyValue::new("source", source.as_str()),
                        KeyValue::new("result", result),
                    ],
                );
                return Outcome::Failed;
            }
        }

        if !snapshot.state.is_terminal() {
            return Outcome::Emitted { traced: false };
        }
        self.trace(snapshot, &name).await;
        Outcome::Emitted { traced: true }
    }

    async fn trace(&self, snapshot: EntitySnapshot, name: &str) {
        let source = snapshot.source;
        let snapshot = match self.source.sub_records(&snapshot).await {
            Ok(sub_records) => EntitySnapshot {
                sub_records,
                ..snapshot
            },
            Err(e) => {
                warn!(
                    %source,
                    entity_id = %snapshot.id,
                    error = %e,
                    "failed to fetch sub-records, tracing run without them"
                );
                snapshot
            }
        };

        debug!(%source, entity_id = %snapshot.id, state = %snapshot.state, "trace");
        let tree = build_trace(&snapshot, name, self.emitter.identity());
        self.traces.export(source, &tree);
    }
}
