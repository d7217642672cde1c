//! Metric registration and recording helpers.
//!
//! Uses the metrics-rs facade so any recorder (Prometheus, statsd, ...) can
//! collect these series. The server crate installs the Prometheus recorder
//! and renders them on its scrape endpoint.

use metrics::{describe_counter, describe_gauge, describe_histogram};

/// Register all pipeline metric descriptions.
///
/// Called once at engine startup, after any recorder is installed.
pub fn register_metrics() {
    describe_counter!(
        "contentpipe_submissions_total",
        "Process requests accepted by the client API"
    );
    describe_counter!("contentpipe_claims_total", "Intents claimed by workers");
    describe_counter!(
        "contentpipe_executions_succeeded_total",
        "Executions recorded as succeeded"
    );
    describe_counter!(
        "contentpipe_executions_retried_total",
        "Failed attempts scheduled for retry"
    );
    describe_counter!(
        "contentpipe_deadletter_total",
        "Intents transitioned to deadletter (alerting signal)"
    );
    describe_counter!(
        "contentpipe_skipped_total",
        "Executions short-circuited by skip-if-present"
    );
    describe_counter!(
        "contentpipe_lease_renewals_total",
        "Successful lease renewals"
    );
    describe_counter!(
        "contentpipe_lease_lost_total",
        "Leases discovered stale mid-execution; results discarded"
    );
    describe_counter!(
        "contentpipe_store_errors_total",
        "Intent store round-trips that failed"
    );
    describe_gauge!(
        "contentpipe_in_flight",
        "Executor invocations currently running in this process"
    );
    describe_gauge!(
        "contentpipe_queue_depth",
        "Intents waiting in pending or awaiting-retry"
    );
    describe_gauge!(
        "contentpipe_last_poll_timestamp_seconds",
        "Unix time of the last completed poll cycle"
    );
    describe_histogram!(
        "contentpipe_execution_seconds",
        "Wall-clock duration of executor invocations"
    );
}

pub fn record_submission(job: &str) {
    metrics::counter!("contentpipe_submissions_total", "job" => job.to_string()).increment(1);
}

pub fn record_claim(job: &str) {
    metrics::counter!("contentpipe_claims_total", "job" => job.to_string()).increment(1);
}

pub fn record_success(job: &str, seconds: f64) {
    metrics::counter!("contentpipe_executions_succeeded_total", "job" => job.to_string())
        .increment(1);
    metrics::histogram!("contentpipe_execution_seconds", "job" => job.to_string()).record(seconds);
}

pub fn record_retry(job: &str, seconds: f64) {
    metrics::counter!("contentpipe_executions_retried_total", "job" => job.to_string())
        .increment(1);
    metrics::histogram!("contentpipe_execution_seconds", "job" => job.to_string()).record(seconds);
}

pub fn record_deadletter(job: &str) {
    metrics::counter!("contentpipe_deadletter_total", "job" => job.to_string()).increment(1);
}

/// Recorded by executors that hit the skip-if-present fast path.
pub fn record_skipped(job: &str) {
    metrics::counter!("contentpipe_skipped_total", "job" => job.to_string()).increment(1);
}

pub fn record_lease_renewal(job: &str) {
    metrics::counter!("contentpipe_lease_renewals_total", "job" => job.to_string()).increment(1);
}

pub fn record_lease_lost(job: &str) {
    metrics::counter!("contentpipe_lease_lost_total", "job" => job.to_string()).increment(1);
}

pub fn record_store_error() {
    metrics::counter!("contentpipe_store_errors_total").increment(1);
}

pub fn add_in_flight(delta: f64) {
    metrics::gauge!("contentpipe_in_flight").increment(delta);
}

pub fn set_queue_depth(depth: f64) {
    metrics::gauge!("contentpipe_queue_depth").set(depth);
}

pub fn set_last_poll_timestamp(unix_seconds: f64) {
    metrics::gauge!("contentpipe_last_poll_timestamp_seconds").set(unix_seconds);
}
