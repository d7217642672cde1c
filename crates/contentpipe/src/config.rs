//! Engine settings.

use std::collections::BTreeMap;
use std::time::Duration;

/// Default logical queue partition.
pub const DEFAULT_QUEUE_NAME: &str = "default";

/// Configuration for the engine, its workers, and the client API.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Connection string for the intent store.
    /// Supports sqlite paths/URLs and postgres:// URLs (with the `postgres`
    /// feature).
    pub database_url: String,
    /// Identity recorded in claims. Defaults to `hostname-pid`.
    pub worker_id: String,
    /// Logical partition; workers only see intents submitted to the same
    /// queue.
    pub queue_name: String,
    /// Delay between idle polls.
    pub poll_interval: Duration,
    /// Claim lifetime before an intent becomes reclaimable.
    pub lease_ttl: Duration,
    /// Per-worker executor concurrency.
    pub max_in_flight: usize,
    /// Attempt ceiling when the submitter does not set one.
    pub max_attempts_default: u32,
    /// Backoff base for transient retries.
    pub retry_base: Duration,
    /// Backoff cap for transient retries.
    pub retry_cap: Duration,
    /// Job names this worker will claim. Empty means "all registered".
    pub supported_jobs: Vec<String>,
    /// Wall-clock bound for a single attempt, per job name. Jobs without an
    /// entry fall back to the executor's own declared deadline, if any.
    pub soft_deadlines: BTreeMap<String, Duration>,
    /// Consecutive store failures after which a worker gives up and exits
    /// (orchestration restarts it).
    pub store_failure_threshold: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            worker_id: default_worker_id(),
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            poll_interval: Duration::from_secs(1),
            lease_ttl: Duration::from_secs(60),
            max_in_flight: 4,
            max_attempts_default: 5,
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(300),
            supported_jobs: Vec::new(),
            soft_deadlines: BTreeMap::new(),
            store_failure_threshold: 30,
        }
    }
}

impl EngineSettings {
    /// Settings for a given database with everything else defaulted.
    pub fn with_database_url(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Default::default()
        }
    }

    /// Build settings from the environment.
    ///
    /// `DATABASE_URL` is required; the `PIPELINE_*` variables override the
    /// defaults documented on each field.
    pub fn from_env() -> Result<Self, String> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| "DATABASE_URL is required".to_string())?;

        let mut settings = Self::with_database_url(database_url);

        if let Ok(v) = std::env::var("PIPELINE_WORKER_ID") {
            settings.worker_id = v;
        }
        if let Ok(v) = std::env::var("PIPELINE_QUEUE_NAME") {
            settings.queue_name = v;
        }
        if let Some(v) = env_duration("PIPELINE_POLL_INTERVAL_MS", 1.0)? {
            settings.poll_interval = v;
        }
        if let Some(v) = env_duration("PIPELINE_LEASE_TTL_SECS", 1000.0)? {
            settings.lease_ttl = v;
        }
        if let Ok(v) = std::env::var("PIPELINE_MAX_IN_FLIGHT") {
            settings.max_in_flight = v
                .parse()
                .map_err(|_| format!("invalid PIPELINE_MAX_IN_FLIGHT: {v}"))?;
        }
        if let Ok(v) = std::env::var("PIPELINE_MAX_ATTEMPTS") {
            settings.max_attempts_default = v
                .parse()
                .map_err(|_| format!("invalid PIPELINE_MAX_ATTEMPTS: {v}"))?;
        }
        if let Some(v) = env_duration("PIPELINE_RETRY_BASE_MS", 1.0)? {
            settings.retry_base = v;
        }
        if let Some(v) = env_duration("PIPELINE_RETRY_CAP_SECS", 1000.0)? {
            settings.retry_cap = v;
        }
        if let Ok(v) = std::env::var("PIPELINE_SUPPORTED_JOBS") {
            settings.supported_jobs = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if settings.max_attempts_default < 1 {
            return Err("PIPELINE_MAX_ATTEMPTS must be at least 1".to_string());
        }

        Ok(settings)
    }

    /// Lease renewal period: strictly less than the lease itself.
    pub fn renew_interval(&self) -> Duration {
        self.lease_ttl / 3
    }

    /// Soft deadline for one attempt of the named job, if configured.
    pub fn soft_deadline_for(&self, job: &str) -> Option<Duration> {
        self.soft_deadlines.get(job).copied()
    }
}

fn default_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "worker".to_string());
    format!("{}-{}", host, std::process::id())
}

/// Parse an env var holding a number of `unit_ms`-sized units into a Duration.
fn env_duration(key: &str, unit_ms: f64) -> Result<Option<Duration>, String> {
    match std::env::var(key) {
        Ok(v) => {
            let n: f64 = v.parse().map_err(|_| format!("invalid {key}: {v}"))?;
            if n < 0.0 {
                return Err(format!("{key} must not be negative"));
            }
            Ok(Some(Duration::from_millis((n * unit_ms) as u64)))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = EngineSettings::default();
        assert_eq!(s.queue_name, "default");
        assert_eq!(s.poll_interval, Duration::from_secs(1));
        assert_eq!(s.lease_ttl, Duration::from_secs(60));
        assert_eq!(s.max_in_flight, 4);
        assert_eq!(s.max_attempts_default, 5);
        assert_eq!(s.retry_base, Duration::from_secs(1));
        assert_eq!(s.retry_cap, Duration::from_secs(300));
        assert!(s.supported_jobs.is_empty());
    }

    #[test]
    fn worker_id_carries_pid() {
        let s = EngineSettings::default();
        assert!(s.worker_id.ends_with(&std::process::id().to_string()));
    }

    #[test]
    fn renew_interval_is_a_fraction_of_the_lease() {
        let s = EngineSettings::default();
        assert!(s.renew_interval() < s.lease_ttl);
    }
}
