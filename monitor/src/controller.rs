//! Collection & Retrain Controller
//!
//! One cycle: fetch a batch, aggregate it, score the current window
//! against the reference, publish the report (and an alert on drift),
//! then check whether enough readings arrived to ask for a retrain.
//!
//! ```text
//! Idle -> Collecting -> Scoring -> Alerting -> Idle
//!                          \----------------> Idle
//! any completed cycle -> RetrainRequested -> Idle   (volume reached)
//! ```
//!
//! Cycles never overlap. A tick or trigger that arrives while one is in
//! flight is dropped and counted, not queued.

use crate::config::{BootstrapPolicy, MonitorConfig};
use crate::error::{MonitorError, MonitorResult};
use crate::features::{self, FeatureSet, ScoringRow};
use crate::retrain::{LogRetrainTrigger, RetrainRequest, RetrainTrigger};
use crate::sink::{AlertRecord, MetricsRegistry, MetricsSink};
use crate::source::ReadingSource;
use crate::state::{MonitorState, SharedState};
use crate::store::{self, BlobStore};
use drift::{
    CurrentWindow, DriftError, DriftReport, DriftScorer, FeatureTable, ReferenceOrigin,
    ReferenceSnapshot, Side, TableRow,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use telemetry::WindowAggregator;
use tokio::sync::{watch, MutexGuard};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Collecting,
    Scoring,
    Alerting,
    RetrainRequested,
}

/// Counters and phase, owned by the controller
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ControllerState {
    pub phase: Phase,
    pub readings_since_last_retrain: u64,
    pub last_check_us: Option<u64>,
    pub cycles_completed: u64,
    pub cycles_skipped: u64,
    pub batches_ingested: u64,
    pub drift_detections: u64,
    pub retrain_requests: u64,
}

/// What a scored (or unscored) batch led to
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    EmptyBatch,
    /// The batch became the reference
    Bootstrapped(DriftReport),
    /// No reference and bootstrapping is disabled
    AwaitingReference,
    /// No reference yet; `rows` are set aside toward the bootstrap one
    CollectingReference { rows: usize },
    Scored(DriftReport),
    /// Scoring was not possible this cycle
    NotScored(DriftError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Another cycle was in flight
    Dropped,
    SourceUnavailable,
    Completed {
        readings: usize,
        verdict: Verdict,
        retrain_requested: bool,
    },
}

#[derive(Debug, Clone)]
struct Settings {
    interval: Duration,
    fetch_timeout: Duration,
    retrain_volume_threshold: u64,
    checkpoint_every: u64,
    bootstrap: BootstrapPolicy,
    min_reference_rows: usize,
    features: FeatureSet,
    reference_name: String,
    reference_path: Option<PathBuf>,
}

pub struct ControllerBuilder {
    config: MonitorConfig,
    source: Arc<dyn ReadingSource>,
    sink: Arc<dyn MetricsSink>,
    trigger: Arc<dyn RetrainTrigger>,
    store: Option<Arc<dyn BlobStore>>,
    state: Option<SharedState>,
}

impl ControllerBuilder {
    pub fn sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn trigger(mut self, trigger: Arc<dyn RetrainTrigger>) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Share state with a [`crate::DriftService`]
    pub fn state(mut self, state: SharedState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn build(self) -> MonitorResult<Controller> {
        self.config.validate()?;
        let aggregator = WindowAggregator::new(self.config.windows.clone())
            .map_err(|e| MonitorError::Config(e.to_string()))?;
        let state = self
            .state
            .unwrap_or_else(|| SharedState::new(MonitorState::new(self.config.drift.window_size)));
        let (shutdown, _) = watch::channel(false);

        Ok(Controller {
            scorer: self.config.scorer(),
            aggregator,
            state,
            source: self.source,
            sink: self.sink,
            trigger: self.trigger,
            store: self.store,
            settings: Settings {
                interval: self.config.check_interval(),
                fetch_timeout: self.config.fetch_timeout(),
                retrain_volume_threshold: self.config.schedule.retrain_volume_threshold,
                checkpoint_every: self.config.schedule.checkpoint_every,
                bootstrap: self.config.drift.bootstrap,
                min_reference_rows: self.config.drift.min_reference_rows,
                features: self.config.drift.features,
                reference_name: self.config.storage.reference_name.clone(),
                reference_path: self.config.storage.reference_path.clone(),
            },
            window_capacity: self.config.drift.window_size,
            control: Mutex::new(ControllerState::default()),
            shutdown,
        })
    }
}

pub struct Controller {
    scorer: DriftScorer,
    aggregator: WindowAggregator,
    state: SharedState,
    source: Arc<dyn ReadingSource>,
    sink: Arc<dyn MetricsSink>,
    trigger: Arc<dyn RetrainTrigger>,
    store: Option<Arc<dyn BlobStore>>,
    settings: Settings,
    window_capacity: usize,
    control: Mutex<ControllerState>,
    shutdown: watch::Sender<bool>,
}

/// Puts the controller back to Idle however the cycle ends
struct IdleOnDrop<'a>(&'a Mutex<ControllerState>);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        self.0.lock().phase = Phase::Idle;
    }
}

impl Controller {
    pub fn builder(config: MonitorConfig, source: Arc<dyn ReadingSource>) -> ControllerBuilder {
        ControllerBuilder {
            config,
            source,
            sink: Arc::new(MetricsRegistry::new()),
            trigger: Arc::new(LogRetrainTrigger),
            store: None,
            state: None,
        }
    }

    /// Controller with the default sink and trigger and no persistence.
    pub fn new(config: MonitorConfig, source: Arc<dyn ReadingSource>) -> MonitorResult<Self> {
        Self::builder(config, source).build()
    }

    pub fn status(&self) -> ControllerState {
        self.control.lock().clone()
    }

    pub fn shared_state(&self) -> SharedState {
        self.state.clone()
    }

    pub fn aggregator(&self) -> &WindowAggregator {
        &self.aggregator
    }

    /// Load the persisted reference and newest checkpoint, falling back to
    /// the configured reference file
    pub async fn restore(&self) -> MonitorResult<()> {
        let mut reference = None;
        let mut checkpoint = None;
        if let Some(store) = &self.store {
            reference = store::load_reference(store.as_ref(), &self.settings.reference_name)?;
            checkpoint = store::load_latest_checkpoint(store.as_ref(), self.window_capacity)?;
        }
        if reference.is_none() {
            if let Some(path) = &self.settings.reference_path {
                reference = Some(store::read_reference_file(
                    path,
                    &self.settings.reference_name,
                    self.aggregator.windows(),
                    self.settings.features,
                )?);
            }
        }

        let mut state = self.state.lock().await;
        if let Some(reference) = reference {
            info!(
                name = %reference.name,
                version = reference.version,
                rows = reference.len(),
                "reference loaded"
            );
            state.reference = Some(reference);
        }
        if let Some((window, batches)) = checkpoint {
            info!(rows = window.len(), batches, "current window restored from checkpoint");
            state.current = window;
            self.control.lock().batches_ingested = batches;
        }
        Ok(())
    }

    /// Run one cycle now, unless one is already in flight
    pub async fn trigger(&self) -> CycleOutcome {
        if !self.begin() {
            debug!("cycle in flight, dropping tick");
            return CycleOutcome::Dropped;
        }
        let _idle = IdleOnDrop(&self.control);

        let batch = match self.fetch().await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(source = self.source.name(), error = %e, "collection failed, skipping cycle");
                return CycleOutcome::SourceUnavailable;
            }
        };
        let readings = batch.len();

        let verdict = if batch.is_empty() {
            debug!(source = self.source.name(), "empty batch");
            Verdict::EmptyBatch
        } else {
            let rows: Vec<ScoringRow> = batch
                .iter()
                .map(|reading| features::ingest_row(&self.aggregator, reading, self.settings.features))
                .collect();
            let batches = {
                let mut control = self.control.lock();
                control.batches_ingested += 1;
                control.phase = Phase::Scoring;
                control.batches_ingested
            };
            self.score_batch(rows, batches).await
        };

        {
            let mut control = self.control.lock();
            control.cycles_completed += 1;
            control.readings_since_last_retrain += readings as u64;
            if matches!(verdict, Verdict::Scored(_) | Verdict::Bootstrapped(_)) {
                control.last_check_us = Some(telemetry::now_us());
            }
        }
        let retrain_requested = self.check_retrain().await;

        CycleOutcome::Completed {
            readings,
            verdict,
            retrain_requested,
        }
    }

    /// Tick every check interval until [`Controller::shutdown`] is called.
    /// The first cycle starts immediately.
    pub async fn run(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            interval_s = self.settings.interval.as_secs(),
            source = self.source.name(),
            "controller started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.trigger().await;
                    debug!(?outcome, "cycle finished");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("controller stopped");
    }

    /// Stop `run` once the current cycle has finished
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn begin(&self) -> bool {
        let mut control = self.control.lock();
        if control.phase != Phase::Idle {
            control.cycles_skipped += 1;
            return false;
        }
        control.phase = Phase::Collecting;
        true
    }

    fn set_phase(&self, phase: Phase) {
        self.control.lock().phase = phase;
    }

    async fn fetch(&self) -> MonitorResult<Vec<telemetry::Reading>> {
        match tokio::time::timeout(self.settings.fetch_timeout, self.source.fetch_batch()).await {
            Ok(result) => result,
            Err(_) => Err(MonitorError::SourceUnavailable(format!(
                "{} timed out after {:?}",
                self.source.name(),
                self.settings.fetch_timeout
            ))),
        }
    }

    async fn score_batch(&self, rows: Vec<ScoringRow>, batches: u64) -> Verdict {
        let now = telemetry::now_us();
        let mut state = self.state.lock().await;

        if state.reference.is_none() {
            return self.without_reference(state, rows, batches, now);
        }

        state.current.extend(rows.into_iter().map(|r| r.row));
        let checkpoint = self.checkpoint_due(batches).then(|| state.current.clone());
        let result = match &state.reference {
            Some(reference) => self.scorer.score(reference, &state.current, now),
            None => Err(DriftError::EmptyInput(Side::Reference)),
        };
        let verdict = match result {
            Ok(report) => {
                state.latest_report = Some(report.clone());
                state.last_check_us = Some(now);
                Verdict::Scored(report)
            }
            Err(e) => {
                info!(error = %e, "nothing to score this cycle");
                Verdict::NotScored(e)
            }
        };
        drop(state);

        if let Some(window) = checkpoint {
            self.persist_checkpoint(&window, batches, now);
        }
        if let Verdict::Scored(report) = &verdict {
            self.publish(report);
        }
        verdict
    }

    fn without_reference(
        &self,
        mut state: MutexGuard<'_, MonitorState>,
        rows: Vec<ScoringRow>,
        batches: u64,
        now: u64,
    ) -> Verdict {
        match self.settings.bootstrap {
            BootstrapPolicy::FirstBatch => {
                let total = rows.len();
                let warm: Vec<TableRow> = rows.into_iter().filter(|r| r.warm).map(|r| r.row).collect();
                let skipped = total - warm.len();
                let Some(gathered) = state.gather_reference(warm, self.settings.min_reference_rows) else {
                    let rows = state.pending_reference.len();
                    info!(
                        rows,
                        needed = self.settings.min_reference_rows,
                        skipped,
                        "collecting rows for the bootstrap reference"
                    );
                    return Verdict::CollectingReference { rows };
                };

                let reference = ReferenceSnapshot::new(
                    self.settings.reference_name.clone(),
                    1,
                    now,
                    ReferenceOrigin::Bootstrap,
                    FeatureTable::from_rows(&gathered),
                );
                let report = DriftReport::bootstrap(&reference, self.scorer.threshold(), now);
                state.reference = Some(reference.clone());
                state.latest_report = Some(report.clone());
                state.last_check_us = Some(now);
                drop(state);

                info!(
                    name = %reference.name,
                    rows = reference.len(),
                    skipped,
                    "no reference loaded, collected rows taken as reference"
                );
                self.persist_reference(&reference);
                if let Err(e) = self.sink.export(&report) {
                    warn!(error = %e, "failed to export bootstrap report");
                }
                Verdict::Bootstrapped(report)
            }
            BootstrapPolicy::RequireReference => {
                state.current.extend(rows.into_iter().map(|r| r.row));
                let checkpoint = self.checkpoint_due(batches).then(|| state.current.clone());
                drop(state);

                debug!("no reference loaded, scoring skipped");
                if let Some(window) = checkpoint {
                    self.persist_checkpoint(&window, batches, now);
                }
                Verdict::AwaitingReference
            }
        }
    }

    fn publish(&self, report: &DriftReport) {
        if let Err(e) = self.sink.export(report) {
            warn!(error = %e, "failed to export drift report");
        }
        if !report.detected {
            debug!(score = report.overall_score, "no drift");
            return;
        }

        {
            let mut control = self.control.lock();
            control.phase = Phase::Alerting;
            control.drift_detections += 1;
        }
        let alert = AlertRecord::from(report);
        warn!(
            score = report.overall_score,
            threshold = report.threshold,
            features = ?alert.drifted_features,
            "drift detected"
        );
        if let Err(e) = self.sink.export_alert(&alert) {
            warn!(error = %e, "failed to export drift alert");
        }
    }

    async fn check_retrain(&self) -> bool {
        let threshold = self.settings.retrain_volume_threshold;
        let count = self.control.lock().readings_since_last_retrain;
        if threshold == 0 || count < threshold {
            return false;
        }

        self.set_phase(Phase::RetrainRequested);
        let request = RetrainRequest::volume(count, telemetry::now_us());
        info!(readings = count, threshold, "readings threshold reached, requesting retrain");
        match tokio::time::timeout(self.settings.fetch_timeout, self.trigger.request_retrain(&request)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "retrain request failed"),
            Err(_) => warn!(
                error = %MonitorError::RetrainTriggerFailed("timed out".into()),
                "retrain request failed"
            ),
        }

        let mut control = self.control.lock();
        control.readings_since_last_retrain = 0;
        control.retrain_requests += 1;
        true
    }

    fn checkpoint_due(&self, batches: u64) -> bool {
        self.store.is_some()
            && self.settings.checkpoint_every > 0
            && batches % self.settings.checkpoint_every == 0
    }

    fn persist_reference(&self, reference: &ReferenceSnapshot) {
        let Some(store) = &self.store else {
            return;
        };
        match store::save_reference(store.as_ref(), reference) {
            Ok(key) => debug!(%key, "reference persisted"),
            Err(e) => warn!(error = %e, "failed to persist reference"),
        }
    }

    fn persist_checkpoint(&self, window: &CurrentWindow, batches: u64, now: u64) {
        let Some(store) = &self.store else {
            return;
        };
        match store::save_checkpoint(store.as_ref(), window, batches, now) {
            Ok(key) => info!(%key, rows = window.len(), batches, "checkpoint saved"),
            Err(e) => warn!(error = %e, "failed to save checkpoint"),
        }
    }
}
