//! Per-worker dispatch loop: claim → validate → execute → record.
//!
//! Each worker owns one polling task plus up to `max_in_flight` execution
//! tasks, bounded by a semaphore. The intent store is the only coordination
//! point; workers never talk to each other. An executor failure (including
//! a panic) never escapes the per-intent scope: it is classified, fed to
//! the retry policy, and the loop keeps polling.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::EngineSettings;
use crate::executor::{
    ClaimedJob, ExecutionContext, ExecutionError, ExecutionOutput, ExecutorRegistry,
};
use crate::metrics;
use crate::models::{Intent, IntentStatus};
use crate::repository::{IntentRepository, StoreError};
use crate::retry::{RetryDecision, RetryPolicy};

/// Tracks when the poll loop last completed a cycle.
///
/// The health surface reports healthy iff the last cycle finished within
/// `2 × poll_interval`.
pub struct HealthProbe {
    last_poll_ms: AtomicI64,
    poll_interval: Duration,
}

impl HealthProbe {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            last_poll_ms: AtomicI64::new(0),
            poll_interval,
        }
    }

    pub fn mark_poll(&self, now: DateTime<Utc>) {
        self.last_poll_ms
            .store(now.timestamp_millis(), Ordering::Relaxed);
        metrics::set_last_poll_timestamp(now.timestamp_millis() as f64 / 1000.0);
    }

    pub fn is_healthy(&self, now: DateTime<Utc>) -> bool {
        let last = self.last_poll_ms.load(Ordering::Relaxed);
        if last == 0 {
            return false;
        }
        let age_ms = now.timestamp_millis().saturating_sub(last);
        age_ms >= 0 && age_ms as u128 <= 2 * self.poll_interval.as_millis()
    }
}

/// One polling worker. Cheap to share; execution tasks hold an `Arc`.
pub(crate) struct Worker {
    worker_id: String,
    queue: String,
    supported: Vec<String>,
    poll_interval: Duration,
    lease_ttl: Duration,
    max_in_flight: usize,
    store_failure_threshold: u32,
    policy: RetryPolicy,
    soft_deadlines: std::collections::BTreeMap<String, Duration>,
    repo: IntentRepository,
    registry: Arc<ExecutorRegistry>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    health: Arc<HealthProbe>,
    semaphore: Arc<Semaphore>,
}

impl Worker {
    pub(crate) fn from_settings(
        settings: &EngineSettings,
        index: usize,
        repo: IntentRepository,
        registry: Arc<ExecutorRegistry>,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
        health: Arc<HealthProbe>,
    ) -> Arc<Self> {
        // A worker claims only what it can execute: the configured subset,
        // or everything registered when no subset is given.
        let supported = if settings.supported_jobs.is_empty() {
            registry.names()
        } else {
            settings
                .supported_jobs
                .iter()
                .filter(|name| registry.get(name).is_some())
                .cloned()
                .collect()
        };

        Arc::new(Self {
            worker_id: format!("{}-w{}", settings.worker_id, index),
            queue: settings.queue_name.clone(),
            supported,
            poll_interval: settings.poll_interval,
            lease_ttl: settings.lease_ttl,
            max_in_flight: settings.max_in_flight.max(1),
            store_failure_threshold: settings.store_failure_threshold.max(1),
            policy: RetryPolicy::new(settings.retry_base, settings.retry_cap),
            soft_deadlines: settings.soft_deadlines.clone(),
            repo,
            registry,
            clock,
            shutdown,
            health,
            semaphore: Arc::new(Semaphore::new(settings.max_in_flight.max(1))),
        })
    }

    pub(crate) fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self: Arc<Self>) {
        info!(
            worker = %self.worker_id,
            queue = %self.queue,
            jobs = ?self.supported,
            "worker starting"
        );
        if self.supported.is_empty() {
            warn!(worker = %self.worker_id, "no executors registered; worker is idle");
        }

        let mut store_failures = 0u32;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            // Back-pressure: wait for a free execution slot before claiming.
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let now = self.clock.now();
            match self
                .repo
                .claim_one(&self.worker_id, &self.supported, &self.queue, self.lease_ttl, now)
                .await
            {
                Ok(Some(intent)) => {
                    store_failures = 0;
                    self.health.mark_poll(now);
                    metrics::record_claim(&intent.name);
                    debug!(
                        worker = %self.worker_id,
                        intent = %intent.id,
                        job = %intent.name,
                        attempt = intent.attempt_count,
                        "claimed intent"
                    );

                    let worker = Arc::clone(&self);
                    tokio::spawn(async move {
                        worker.execute_claimed(intent).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    store_failures = 0;
                    self.health.mark_poll(now);
                    self.refresh_queue_depth().await;
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    store_failures += 1;
                    metrics::record_store_error();
                    warn!(
                        worker = %self.worker_id,
                        error = %e,
                        consecutive = store_failures,
                        "claim poll failed"
                    );
                    if store_failures >= self.store_failure_threshold {
                        error!(
                            worker = %self.worker_id,
                            "intent store unreachable for too long; worker exiting"
                        );
                        break;
                    }
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        self.drain().await;
        info!(worker = %self.worker_id, "worker stopped");
    }

    /// Wait for every in-flight execution to release its permit.
    async fn drain(&self) {
        let _ = self
            .semaphore
            .acquire_many(self.max_in_flight as u32)
            .await;
    }

    async fn refresh_queue_depth(&self) {
        let pending = self.repo.count_status(IntentStatus::Pending).await;
        let retrying = self.repo.count_status(IntentStatus::Failed).await;
        if let (Ok(p), Ok(r)) = (pending, retrying) {
            metrics::set_queue_depth((p + r) as f64);
        }
    }

    /// Run one claimed intent to a recorded outcome.
    async fn execute_claimed(&self, intent: Intent) {
        metrics::add_in_flight(1.0);
        let started = Instant::now();
        let outcome = self.attempt(&intent).await;
        let elapsed = started.elapsed().as_secs_f64();
        self.record_outcome(&intent, outcome, elapsed).await;
        metrics::add_in_flight(-1.0);
    }

    /// One attempt: resolve the executor, validate, run under lease renewal,
    /// cancellation, and the soft deadline.
    async fn attempt(&self, intent: &Intent) -> Result<ExecutionOutput, ExecutionError> {
        let Some(executor) = self.registry.get(&intent.name) else {
            return Err(ExecutionError::permanent(format!(
                "unknown job name: {}",
                intent.name
            )));
        };

        if let Err(e) = executor.validate_payload(&intent.payload) {
            return Err(ExecutionError::permanent(format!("invalid payload: {e}")));
        }

        // Checkpoints are advisory; a load failure only costs the resume.
        let resume = match self.repo.load_checkpoint(&intent.id).await {
            Ok(cp) => cp,
            Err(e) => {
                warn!(intent = %intent.id, error = %e, "checkpoint load failed; starting fresh");
                None
            }
        };

        let cancel = self.shutdown.child_token();
        let ctx = ExecutionContext::new(
            intent.id.clone(),
            self.repo.clone(),
            cancel.clone(),
            resume,
            Arc::clone(&self.clock),
        );
        let job = ClaimedJob {
            intent_id: intent.id.clone(),
            name: intent.name.clone(),
            payload: intent.payload.clone(),
            attempt_count: intent.attempt_count,
            max_attempts: intent.max_attempts,
        };

        let renew_stop = CancellationToken::new();
        let renewal = tokio::spawn(renew_lease_loop(
            self.repo.clone(),
            intent.id.clone(),
            intent.name.clone(),
            self.worker_id.clone(),
            self.lease_ttl,
            Arc::clone(&self.clock),
            cancel.clone(),
            renew_stop.clone(),
        ));

        let deadline = self
            .soft_deadlines
            .get(&intent.name)
            .copied()
            .or_else(|| executor.soft_deadline());

        // Run the executor in its own task so a panic is contained as a
        // JoinError instead of taking the worker down.
        let mut execution = tokio::spawn({
            let ctx = ctx.clone();
            async move { executor.execute(&job, &ctx).await }
        });

        let outcome = match deadline {
            Some(limit) => {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        execution.abort();
                        Err(ExecutionError::transient(
                            "execution canceled: shutdown or lease lost",
                        ))
                    }
                    _ = tokio::time::sleep(limit) => {
                        cancel.cancel();
                        execution.abort();
                        Err(ExecutionError::transient(format!(
                            "soft deadline of {}s exceeded",
                            limit.as_secs()
                        )))
                    }
                    res = &mut execution => flatten_join(res),
                }
            }
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        execution.abort();
                        Err(ExecutionError::transient(
                            "execution canceled: shutdown or lease lost",
                        ))
                    }
                    res = &mut execution => flatten_join(res),
                }
            }
        };

        renew_stop.cancel();
        let _ = renewal.await;

        // A renewal failure mid-flight means another worker may already own
        // this intent; the guarded record step below will notice, but don't
        // present a canceled execution as a success.
        if cancel.is_cancelled() && outcome.is_ok() {
            return Err(ExecutionError::transient(
                "execution finished after its lease was lost; result discarded",
            ));
        }

        outcome
    }

    async fn record_outcome(
        &self,
        intent: &Intent,
        outcome: Result<ExecutionOutput, ExecutionError>,
        elapsed: f64,
    ) {
        let now = self.clock.now();
        match outcome {
            Ok(output) => {
                match self
                    .repo
                    .complete(&intent.id, &self.worker_id, output.result, now)
                    .await
                {
                    Ok(()) => {
                        metrics::record_success(&intent.name, elapsed);
                        info!(
                            worker = %self.worker_id,
                            intent = %intent.id,
                            job = %intent.name,
                            attempt = intent.attempt_count,
                            "intent succeeded"
                        );
                    }
                    Err(StoreError::StaleLease) => {
                        metrics::record_lease_lost(&intent.name);
                        warn!(
                            worker = %self.worker_id,
                            intent = %intent.id,
                            "lease lost before completion; result discarded"
                        );
                    }
                    Err(e) => {
                        metrics::record_store_error();
                        warn!(intent = %intent.id, error = %e, "failed to record completion");
                    }
                }
            }
            Err(err) => {
                let decision =
                    self.policy
                        .decide(intent.attempt_count, intent.max_attempts, err.kind());
                let message = err.to_string();

                let recorded = match decision {
                    RetryDecision::Retry(delay) => {
                        metrics::record_retry(&intent.name, elapsed);
                        info!(
                            worker = %self.worker_id,
                            intent = %intent.id,
                            job = %intent.name,
                            attempt = intent.attempt_count,
                            delay_ms = delay.as_millis() as u64,
                            error = %message,
                            "attempt failed; retry scheduled"
                        );
                        let run_after = now
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::zero());
                        self.repo
                            .fail_retry(&intent.id, &self.worker_id, &message, run_after, now)
                            .await
                    }
                    RetryDecision::Deadletter => {
                        metrics::record_deadletter(&intent.name);
                        warn!(
                            worker = %self.worker_id,
                            intent = %intent.id,
                            job = %intent.name,
                            attempt = intent.attempt_count,
                            error = %message,
                            "intent deadlettered"
                        );
                        self.repo
                            .fail_deadletter(&intent.id, &self.worker_id, &message, now)
                            .await
                    }
                };

                match recorded {
                    Ok(()) => {}
                    Err(StoreError::StaleLease) => {
                        metrics::record_lease_lost(&intent.name);
                        debug!(
                            intent = %intent.id,
                            "failure not recorded: intent reclaimed elsewhere"
                        );
                    }
                    Err(e) => {
                        metrics::record_store_error();
                        warn!(intent = %intent.id, error = %e, "failed to record failure");
                    }
                }
            }
        }
    }
}

/// Collapse a JoinHandle result into the execution outcome, treating panics
/// and aborts as transient failures.
fn flatten_join(
    res: Result<Result<ExecutionOutput, ExecutionError>, tokio::task::JoinError>,
) -> Result<ExecutionOutput, ExecutionError> {
    match res {
        Ok(outcome) => outcome,
        Err(join) if join.is_panic() => {
            error!("executor panicked; counting as transient failure");
            Err(ExecutionError::transient("executor panicked"))
        }
        Err(_) => Err(ExecutionError::transient("execution aborted")),
    }
}

/// Keep the lease alive while an executor runs.
///
/// Renews at `lease_ttl / 3`. Losing ownership cancels the execution;
/// transient store errors just leave the remaining lease as slack.
#[allow(clippy::too_many_arguments)]
async fn renew_lease_loop(
    repo: IntentRepository,
    intent_id: String,
    job: String,
    worker_id: String,
    lease_ttl: Duration,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    stop: CancellationToken,
) {
    let interval = lease_ttl / 3;
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        match repo
            .renew_lease(&intent_id, &worker_id, lease_ttl, clock.now())
            .await
        {
            Ok(()) => {
                metrics::record_lease_renewal(&job);
                debug!(intent = %intent_id, "lease renewed");
            }
            Err(StoreError::StaleLease) | Err(StoreError::NotFound(_)) => {
                metrics::record_lease_lost(&job);
                warn!(
                    intent = %intent_id,
                    worker = %worker_id,
                    "lease no longer owned; canceling execution"
                );
                cancel.cancel();
                return;
            }
            Err(e) => {
                metrics::record_store_error();
                warn!(intent = %intent_id, error = %e, "lease renewal errored; will retry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn health_probe_tracks_poll_age() {
        let probe = HealthProbe::new(Duration::from_secs(1));
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

        // Never polled: unhealthy.
        assert!(!probe.is_healthy(t0));

        probe.mark_poll(t0);
        assert!(probe.is_healthy(t0 + chrono::Duration::seconds(1)));
        assert!(probe.is_healthy(t0 + chrono::Duration::seconds(2)));
        assert!(!probe.is_healthy(t0 + chrono::Duration::seconds(3)));
    }
}
