//! Pipeline orchestration: source loops, batch processing and maintenance.
//!
//! Per batch:
//! 1. Normalize each raw event (dedup against the processed ledger).
//! 2. Extract it into memory, then commit it (ledger + cursor).
//! 3. Apply the page cursor once the whole page is committed.
//! 4. Run the detectors over the touched entities, re-read from memory.
//! 5. Triage every candidate and dispatch what is Delivered.
//!
//! Each source runs its own loop with an adaptive interval and a circuit
//! breaker, so one failing source never stalls the others.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::watch;

use crate::connectors::{poll_with_timeout, AdaptiveInterval, CircuitBreaker, Connector, PollResult};
use crate::context::ContextEngine;
use crate::delivery::{dispatch_with_retry, Delivery, RetryPolicy};
use crate::embeddings::Embedder;
use crate::error::PipelineError;
use crate::memory::VectorMemory;
use crate::normalizer::{self, NormalizeOutcome};
use crate::proactive::{default_generator, AlertGenerator, DetectorInput};
use crate::triage::{RetrainOutcome, Triage, TriageOutcome};
use crate::types::{Config, SourceConfig};

/// Entities re-embedded per maintenance run.
const BACKFILL_LIMIT: usize = 256;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    pub normalized: usize,
    pub duplicates: usize,
    pub malformed: usize,
    pub merged: usize,
    pub relationships: usize,
    pub candidates: usize,
    pub detector_failures: usize,
    pub delivered: usize,
    pub suppressed: usize,
    pub deduplicated: usize,
    pub undelivered: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub compacted: usize,
    pub pruned: usize,
    pub backfilled: usize,
    pub ignored: usize,
    pub retrain: Option<RetrainOutcome>,
    pub errors: Vec<String>,
}

pub struct Pipeline {
    memory: Arc<VectorMemory>,
    engine: ContextEngine,
    generator: AlertGenerator,
    triage: Triage,
    delivery: Arc<dyn Delivery>,
    config: Arc<Config>,
}

impl Pipeline {
    pub fn new(
        memory: Arc<VectorMemory>,
        embedder: Arc<dyn Embedder>,
        delivery: Arc<dyn Delivery>,
        config: Arc<Config>,
    ) -> Result<Self, PipelineError> {
        let triage = Triage::new(Arc::clone(&memory), Arc::clone(&config))?;
        let engine = ContextEngine::new(Arc::clone(&memory), embedder, Arc::clone(&config));
        Ok(Self {
            memory,
            engine,
            generator: default_generator(),
            triage,
            delivery,
            config,
        })
    }

    pub fn memory(&self) -> &Arc<VectorMemory> {
        &self.memory
    }

    pub fn triage(&self) -> &Triage {
        &self.triage
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stored cursor for `source_id`, if any.
    pub fn cursor(&self, source_id: &str) -> Result<Option<String>, PipelineError> {
        Ok(self
            .memory
            .with_reader(|db| db.get_cursor(source_id))?
            .map(|c| c.cursor))
    }

    /// Poll one page from `connector` and process it.
    pub async fn poll_once(
        &self,
        connector: &dyn Connector,
        now: DateTime<Utc>,
    ) -> Result<BatchReport, PipelineError> {
        let cursor = self.cursor(connector.source_id())?;
        let page = poll_with_timeout(connector, cursor.as_deref(), self.config.connector_timeout_secs)
            .await?;
        self.process_batch(connector.source_id(), page, now).await
    }

    /// Ingest one page, then generate, triage and deliver.
    pub async fn process_batch(
        &self,
        source_id: &str,
        page: PollResult,
        now: DateTime<Utc>,
    ) -> Result<BatchReport, PipelineError> {
        let mut report = BatchReport {
            received: page.events.len(),
            ..BatchReport::default()
        };
        let mut touched: BTreeSet<String> = BTreeSet::new();

        for raw in &page.events {
            let outcome = self.memory.with_reader(|db| normalizer::normalize(db, raw))?;
            match outcome {
                NormalizeOutcome::Duplicate => report.duplicates += 1,
                NormalizeOutcome::Malformed(reason) => {
                    log::warn!(
                        "Pipeline: malformed event {}:{}: {}",
                        raw.source_id,
                        raw.external_id,
                        reason
                    );
                    self.memory
                        .with_writer(|db| normalizer::commit_rejected(db, raw, now))?;
                    report.malformed += 1;
                }
                NormalizeOutcome::Normalized(event) => {
                    let extraction = self.engine.extract(&event, now).await?;
                    self.memory.with_writer(|db| {
                        normalizer::commit(db, &event, Some(&extraction.entity.entity_id), now)
                    })?;
                    report.normalized += 1;
                    report.relationships += extraction.relationships.len();
                    if extraction.merged {
                        report.merged += 1;
                    }
                    touched.insert(extraction.entity.entity_id);
                }
            }
        }

        if let Some(next) = page.next_cursor.as_deref() {
            self.memory
                .with_writer(|db| normalizer::advance_cursor(db, source_id, next))?;
        }

        if !touched.is_empty() {
            self.generate_and_triage(&touched, now, &mut report).await?;
        }

        log::info!(
            "Pipeline: {} batch: {} received, {} new, {} duplicate, {} malformed, {} candidates, {} delivered",
            source_id,
            report.received,
            report.normalized,
            report.duplicates,
            report.malformed,
            report.candidates,
            report.delivered
        );
        Ok(report)
    }

    async fn generate_and_triage(
        &self,
        touched: &BTreeSet<String>,
        now: DateTime<Utc>,
        report: &mut BatchReport,
    ) -> Result<(), PipelineError> {
        let ids: Vec<String> = touched.iter().cloned().collect();
        let (entities, relationships) = self.memory.with_reader(|db| {
            Ok((db.get_entities(&ids)?, db.relationships_for(&ids)?))
        })?;

        let input = DetectorInput {
            entities: &entities,
            relationships: &relationships,
            memory: self.memory.as_ref(),
            now,
            config: &self.config,
        };
        let generated = self.generator.run(&input);
        report.candidates += generated.candidates.len();
        report.detector_failures += generated.failures.len();

        let policy = RetryPolicy::with_attempts(self.config.delivery_max_attempts);
        for candidate in &generated.candidates {
            let outcome = self.triage.process(candidate, now)?;
            match &outcome {
                TriageOutcome::Merged(_) => report.deduplicated += 1,
                TriageOutcome::Created(a) if a.state.is_terminal() => report.suppressed += 1,
                TriageOutcome::Created(_) => {}
            }
            let Some(alert) = outcome.to_deliver() else {
                continue;
            };
            let dispatch = dispatch_with_retry(self.delivery.as_ref(), alert, &policy).await;
            self.triage
                .record_delivery(&alert.alert_id, dispatch.attempts, dispatch.delivered)?;
            if dispatch.delivered {
                report.delivered += 1;
            } else {
                report.undelivered += 1;
            }
        }
        Ok(())
    }

    /// Compact, prune, backfill, sweep ignores, then check the retrain
    /// trigger. A failing step is logged and the rest still run, except a
    /// fatal store error which is returned.
    pub async fn run_maintenance(
        &self,
        now: DateTime<Utc>,
    ) -> Result<MaintenanceReport, PipelineError> {
        let mut report = MaintenanceReport::default();
        let embedder = self.engine.embedder();

        match self.memory.compact(now, embedder).await {
            Ok(r) => report.compacted = r.compacted,
            Err(e) => note_failure(&mut report, "compact", e.into())?,
        }
        match self.memory.prune(now) {
            Ok(r) => report.pruned = r.entities_removed,
            Err(e) => note_failure(&mut report, "prune", e.into())?,
        }
        match self.memory.backfill_embeddings(embedder, BACKFILL_LIMIT).await {
            Ok(n) => report.backfilled = n,
            Err(e) => note_failure(&mut report, "backfill", e.into())?,
        }
        match self.triage.sweep_implicit_ignores(now) {
            Ok(n) => report.ignored = n,
            Err(e) => note_failure(&mut report, "sweep", e)?,
        }
        match self.triage.maybe_retrain(now).await {
            Ok(outcome) => report.retrain = Some(outcome),
            Err(e) => note_failure(&mut report, "retrain", e)?,
        }

        log::info!(
            "Pipeline: maintenance done: {} compacted, {} pruned, {} backfilled, {} ignored",
            report.compacted,
            report.pruned,
            report.backfilled,
            report.ignored
        );
        Ok(report)
    }
}

fn note_failure(
    report: &mut MaintenanceReport,
    step: &str,
    err: PipelineError,
) -> Result<(), PipelineError> {
    if err.is_fatal() {
        return Err(err);
    }
    log::warn!("Pipeline: maintenance step {} failed: {}", step, err);
    report.errors.push(format!("{}: {}", step, err));
    Ok(())
}

/// Sleep for `duration` or until shutdown is signalled. Returns false on
/// shutdown.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

/// Poll one source until shutdown. Only fatal errors end the loop early.
///
/// A batch in flight is never cancelled: shutdown is only observed between
/// batches.
pub async fn run_source_loop(
    pipeline: Arc<Pipeline>,
    connector: Arc<dyn Connector>,
    source: SourceConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), PipelineError> {
    let config = pipeline.config();
    let mut interval = AdaptiveInterval::new(
        Duration::from_secs(source.poll_interval_min_secs),
        Duration::from_secs(source.poll_interval_max_secs),
    );
    let mut breaker = CircuitBreaker::new(
        config.circuit_breaker_threshold,
        Duration::from_secs(config.circuit_breaker_cooldown_secs),
    );
    log::info!("Pipeline: source {} started", connector.source_id());

    loop {
        if *shutdown.borrow() {
            break;
        }

        if let Err(remaining) = breaker.check(Instant::now()) {
            if !sleep_or_shutdown(remaining, &mut shutdown).await {
                break;
            }
            continue;
        }

        let wait = match pipeline.poll_once(connector.as_ref(), Utc::now()).await {
            Ok(report) => {
                breaker.record_success();
                if report.received > 0 {
                    interval.on_change()
                } else {
                    interval.on_idle()
                }
            }
            Err(e) if e.is_fatal() => {
                log::error!("Pipeline: source {} hit a fatal error: {}", connector.source_id(), e);
                return Err(e);
            }
            Err(e) => {
                if breaker.record_failure(Instant::now()) {
                    log::warn!(
                        "Pipeline: source {} circuit open after {} failures",
                        connector.source_id(),
                        breaker.consecutive_failures()
                    );
                }
                log::warn!("Pipeline: source {} poll failed: {}", connector.source_id(), e);
                interval.on_idle()
            }
        };

        if !sleep_or_shutdown(wait, &mut shutdown).await {
            break;
        }
    }

    log::info!("Pipeline: source {} stopped", connector.source_id());
    Ok(())
}

pub fn parse_schedule(expr: &str) -> Result<Schedule, PipelineError> {
    Schedule::from_str(expr).map_err(|e| {
        PipelineError::Configuration(format!("Invalid cron expression '{}': {}", expr, e))
    })
}

/// Run maintenance on the cron schedule until shutdown.
pub async fn run_maintenance_loop(
    pipeline: Arc<Pipeline>,
    schedule: Schedule,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), PipelineError> {
    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            log::warn!("Pipeline: maintenance schedule has no upcoming run");
            return Ok(());
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if !sleep_or_shutdown(wait, &mut shutdown).await {
            return Ok(());
        }
        if let Err(e) = pipeline.run_maintenance(Utc::now()).await {
            log::error!("Pipeline: maintenance hit a fatal error: {}", e);
            return Err(e);
        }
    }
}
