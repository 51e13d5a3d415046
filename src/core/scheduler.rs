use chrono::Duration;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::clock::Clock;
use super::error::{EngineError, Result};
use super::events::{EngineEvent, EventBus};
use super::generator::{ResponseGenerator, ThreadContext};
use super::health::HealthMonitor;
use super::ledger::{Ledger, RetryOutcome, StaleAction};
use super::model::{DispatchOutcome, PendingResponse};
use super::store::Store;
use super::thread::{Commit, ThreadMaterializer};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub poll_interval: std::time::Duration,
    /// Upper bound on posts being worked on at the same time.
    pub max_concurrency: usize,
    pub batch_size: usize,
    /// Generator calls allowed per pending response before it fails for good.
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for each later one.
    pub retry_backoff: Duration,
    pub max_processing: Duration,
    pub generator_timeout: std::time::Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval: std::time::Duration::from_secs(30),
            max_concurrency: 4,
            batch_size: 200,
            max_attempts: 3,
            retry_backoff: Duration::seconds(60),
            max_processing: Duration::seconds(300),
            generator_timeout: std::time::Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Materialized,
    Skipped,
    DuplicateLike,
    Retried,
    Failed,
    Superseded,
    Orphaned,
    /// Another dispatcher claimed the row first.
    Lost,
    Errored,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub due: usize,
    pub materialized: usize,
    pub skipped: usize,
    pub retried: usize,
    pub failed: usize,
    pub orphaned: usize,
    pub lost: usize,
    pub errored: usize,
    pub reaped: usize,
}

impl TickReport {
    fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Materialized => self.materialized += 1,
            ItemOutcome::Skipped | ItemOutcome::DuplicateLike => self.skipped += 1,
            ItemOutcome::Retried => self.retried += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Superseded | ItemOutcome::Orphaned => self.orphaned += 1,
            ItemOutcome::Lost => self.lost += 1,
            ItemOutcome::Errored => self.errored += 1,
        }
    }
}

/// Split due rows by post, keeping each post's rows in due order.
fn group_by_post(items: Vec<PendingResponse>) -> Vec<Vec<PendingResponse>> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<Vec<PendingResponse>> = Vec::new();
    for item in items {
        let slot = *slots.entry(item.post_id.clone()).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(item);
    }
    groups
}

/// Polls the ledger and turns due pending responses into interactions.
///
/// Rows of one post run one after another in due order; different posts run
/// in parallel up to `max_concurrency`. The ledger claim is the only
/// exclusion mechanism, so several dispatchers may share a database.
pub struct Dispatcher {
    store: Store,
    ledger: Ledger,
    materializer: ThreadMaterializer,
    generator: Arc<dyn ResponseGenerator>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    health: Arc<HealthMonitor>,
    settings: SchedulerSettings,
}

impl Dispatcher {
    pub fn new(
        store: Store,
        generator: Arc<dyn ResponseGenerator>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        health: Arc<HealthMonitor>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            ledger: Ledger::new(store.clone()),
            materializer: ThreadMaterializer::new(store.clone()),
            store,
            generator,
            clock,
            events,
            health,
            settings,
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// One polling pass: reap stale claims, then dispatch everything due.
    pub async fn tick(self: &Arc<Self>) -> Result<TickReport> {
        let started = self.clock.now();
        let result = self.dispatch_due().await;
        self.health
            .record_tick(started, result.as_ref().err().map(|e| e.to_string()));
        result
    }

    async fn dispatch_due(self: &Arc<Self>) -> Result<TickReport> {
        let now = self.clock.now();
        let mut report = TickReport::default();

        for (row, action) in self.ledger.reap_stale(now, self.settings.max_processing)? {
            report.reaped += 1;
            match action {
                StaleAction::Requeued => {
                    warn!(pending_id = %row.id, post_id = %row.post_id, "requeued stale dispatch")
                }
                StaleAction::Superseded => {
                    debug!(pending_id = %row.id, "stale dispatch superseded by newer row")
                }
                StaleAction::Failed => {
                    warn!(pending_id = %row.id, post_id = %row.post_id, "stale dispatch failed for good");
                    self.events.emit(EngineEvent::ResponseFailed {
                        pending_id: row.id.clone(),
                        post_id: row.post_id.clone(),
                        reason: "processing timed out twice".to_string(),
                    });
                }
            }
        }

        let due = self.ledger.due_items(now, self.settings.batch_size)?;
        report.due = due.len();
        if due.is_empty() {
            return Ok(report);
        }

        let permits = Arc::new(Semaphore::new(self.settings.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for group in group_by_post(due) {
            let this = Arc::clone(self);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return Vec::new();
                };
                let mut outcomes = Vec::with_capacity(group.len());
                for item in group {
                    outcomes.push(this.process(item).await);
                }
                outcomes
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcomes) => outcomes.into_iter().for_each(|o| report.record(o)),
                Err(e) => {
                    error!(error = %e, "dispatch task aborted");
                    report.errored += 1;
                }
            }
        }

        Ok(report)
    }

    /// Errors stay inside the item; the row is left for the stale reaper.
    async fn process(&self, item: PendingResponse) -> ItemOutcome {
        match self.try_process(&item).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(pending_id = %item.id, post_id = %item.post_id, error = %e, "dispatch failed");
                ItemOutcome::Errored
            }
        }
    }

    async fn try_process(&self, item: &PendingResponse) -> Result<ItemOutcome> {
        let now = self.clock.now();
        if !self.ledger.claim(&item.id, now)? {
            return Ok(ItemOutcome::Lost);
        }

        let post = match self.store.get_post(&item.post_id) {
            Ok(post) => post,
            Err(EngineError::NotFound(_)) => return self.finish(item, DispatchOutcome::Orphaned),
            Err(e) => return Err(e),
        };
        let follower = match self.store.get_follower(&item.follower_id) {
            Ok(follower) => follower,
            Err(EngineError::NotFound(_)) => return self.finish(item, DispatchOutcome::Orphaned),
            Err(e) => return Err(e),
        };
        if !follower.active {
            debug!(pending_id = %item.id, follower_id = %follower.id, "follower deactivated, skipping");
            return self.finish(item, DispatchOutcome::Skipped);
        }

        let tree = self.materializer.tree_for_post(&post.id)?;
        let trigger = item
            .trigger_id
            .as_deref()
            .and_then(|id| tree.get(id).cloned());
        let context = ThreadContext::new(tree, trigger);

        let timeout = self.settings.generator_timeout;
        let generated =
            match tokio::time::timeout(timeout, self.generator.generate(&post, &follower, &context))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(EngineError::GeneratorTimeout(timeout)),
            };

        let decision = match generated {
            Ok(decision) => decision,
            Err(e) if e.is_transient() => return self.retry_or_fail(item, &e),
            Err(e) => return self.fail(item, &e.to_string()),
        };

        match self.materializer.commit(item, &decision, self.clock.now()) {
            Ok(Commit::Materialized(interaction)) => {
                self.health.record_commit(true);
                info!(
                    pending_id = %item.id,
                    post_id = %item.post_id,
                    follower_id = %item.follower_id,
                    kind = decision.label(),
                    "response materialized"
                );
                self.events.emit(EngineEvent::ResponseMaterialized {
                    pending_id: item.id.clone(),
                    interaction,
                });
                Ok(ItemOutcome::Materialized)
            }
            Ok(Commit::Skipped) => {
                self.health.record_commit(true);
                self.events.emit(EngineEvent::ResponseSkipped {
                    pending_id: item.id.clone(),
                    post_id: item.post_id.clone(),
                });
                Ok(ItemOutcome::Skipped)
            }
            Ok(Commit::Orphaned) => Ok(ItemOutcome::Orphaned),
            Err(EngineError::DuplicateLike { .. }) => {
                self.health.record_commit(true);
                self.ledger
                    .mark_dispatched(&item.id, DispatchOutcome::DuplicateLike, None, self.clock.now())?;
                Ok(ItemOutcome::DuplicateLike)
            }
            Err(e @ EngineError::InvalidThreadTarget { .. }) => self.fail(item, &e.to_string()),
            Err(e) => {
                self.health.record_commit(false);
                Err(e)
            }
        }
    }

    fn finish(&self, item: &PendingResponse, outcome: DispatchOutcome) -> Result<ItemOutcome> {
        self.ledger
            .mark_dispatched(&item.id, outcome, None, self.clock.now())?;
        Ok(match outcome {
            DispatchOutcome::Skipped => {
                self.events.emit(EngineEvent::ResponseSkipped {
                    pending_id: item.id.clone(),
                    post_id: item.post_id.clone(),
                });
                ItemOutcome::Skipped
            }
            _ => ItemOutcome::Orphaned,
        })
    }

    fn retry_or_fail(&self, item: &PendingResponse, err: &EngineError) -> Result<ItemOutcome> {
        let attempt = item.attempts + 1;
        if attempt >= self.settings.max_attempts {
            return self.fail(
                item,
                &format!("gave up after {} attempts: {}", attempt, err),
            );
        }

        let backoff = self.settings.retry_backoff * 2i32.pow(item.attempts.min(16));
        let next_attempt_at = self.clock.now() + backoff;
        match self.ledger.retry(&item.id, next_attempt_at, &err.to_string())? {
            RetryOutcome::Rescheduled => {
                warn!(
                    pending_id = %item.id,
                    attempt,
                    next_attempt_at = %next_attempt_at,
                    error = %err,
                    "generator failed, retrying"
                );
                self.events.emit(EngineEvent::ResponseRetrying {
                    pending_id: item.id.clone(),
                    attempt,
                    next_attempt_at,
                    reason: err.to_string(),
                });
                Ok(ItemOutcome::Retried)
            }
            RetryOutcome::Superseded => Ok(ItemOutcome::Superseded),
            RetryOutcome::Gone => Ok(ItemOutcome::Orphaned),
        }
    }

    fn fail(&self, item: &PendingResponse, reason: &str) -> Result<ItemOutcome> {
        if !self.ledger.mark_failed(&item.id, reason)? {
            return Ok(ItemOutcome::Orphaned);
        }
        warn!(pending_id = %item.id, post_id = %item.post_id, reason, "response failed");
        self.events.emit(EngineEvent::ResponseFailed {
            pending_id: item.id.clone(),
            post_id: item.post_id.clone(),
            reason: reason.to_string(),
        });
        Ok(ItemOutcome::Failed)
    }

    /// Spawn the polling loop. Stop it with [`SchedulerHandle::stop`].
    pub fn start(self: &Arc<Self>) -> SchedulerHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let this = Arc::clone(self);

        let task = tokio::spawn(async move {
            this.health.set_running(true);
            info!(
                poll_interval = ?this.settings.poll_interval,
                max_concurrency = this.settings.max_concurrency,
                "response scheduler started"
            );

            let mut interval = tokio::time::interval(this.settings.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match this.tick().await {
                            Ok(report) if report.due > 0 || report.reaped > 0 => {
                                info!(
                                    due = report.due,
                                    materialized = report.materialized,
                                    retried = report.retried,
                                    failed = report.failed,
                                    "scheduler tick"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "scheduler tick failed"),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            this.health.set_running(false);
            info!("response scheduler stopped");
        });

        SchedulerHandle { shutdown, task }
    }
}

pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Ask the loop to exit after its current tick and wait for it.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "scheduler task ended abnormally");
        }
    }
}
