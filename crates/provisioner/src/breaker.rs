//! Per-template provisioning backoff.
//!
//! A template that keeps failing to provision is suppressed for an
//! exponentially growing interval. Each template has its own record, so one
//! broken template never blocks a healthy one.

use std::collections::HashSet;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{BackoffConfig, MAX_BACKOFF_SECONDS};

/// Backoff state of a single template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffRecord {
    /// When the most recent failure was recorded.
    pub last_failure: Instant,
    /// Current suppression interval.
    pub interval: Duration,
}

impl BackoffRecord {
    /// Instant at which provisioning is allowed again.
    #[must_use]
    pub fn retry_at(&self) -> Instant {
        self.last_failure + self.interval
    }
}

/// Exponential backoff gate keyed by template name.
///
/// Every read-modify-write runs under the map's shard lock, so concurrent
/// failures for the same template never lose an interval update.
#[derive(Debug)]
pub struct ProvisionBackoff {
    initial: Duration,
    max: Duration,
    records: DashMap<String, BackoffRecord>,
}

impl Default for ProvisionBackoff {
    fn default() -> Self {
        Self::new(&BackoffConfig::default())
    }
}

impl ProvisionBackoff {
    /// Create a gate from configuration.
    #[must_use]
    pub fn new(config: &BackoffConfig) -> Self {
        let ceiling = Duration::from_secs(MAX_BACKOFF_SECONDS);
        let initial = Duration::from_secs(config.initial_seconds).min(ceiling);
        Self {
            initial,
            max: Duration::from_secs(config.max_seconds).clamp(initial, ceiling),
            records: DashMap::new(),
        }
    }

    /// Record a failed provisioning attempt. Returns the new interval.
    pub fn failure(&self, template: &str) -> Duration {
        let now = Instant::now();
        let record = self
            .records
            .entry(template.to_string())
            .and_modify(|r| {
                r.interval = r.interval.saturating_mul(2).min(self.max);
                r.last_failure = now;
            })
            .or_insert(BackoffRecord {
                last_failure: now,
                interval: self.initial,
            });
        let interval = record.interval;
        drop(record);

        warn!(
            template = %template,
            backoff_secs = interval.as_secs(),
            "Provisioning failed, backing off"
        );
        interval
    }

    /// Record a successful provisioning, clearing any backoff.
    pub fn success(&self, template: &str) {
        if self.records.remove(template).is_some() {
            info!(template = %template, "Provisioning recovered, backoff cleared");
        }
    }

    /// Whether provisioning of `template` is currently allowed.
    #[must_use]
    pub fn is_enabled(&self, template: &str) -> bool {
        self.is_enabled_at(template, Instant::now())
    }

    /// Whether provisioning of `template` is allowed at `now`.
    #[must_use]
    pub fn is_enabled_at(&self, template: &str, now: Instant) -> bool {
        self.records
            .get(template)
            .is_none_or(|r| now >= r.retry_at())
    }

    /// Time left until `template` may be provisioned again.
    #[must_use]
    pub fn retry_in(&self, template: &str) -> Option<Duration> {
        let now = Instant::now();
        self.records
            .get(template)
            .map(|r| r.retry_at().saturating_duration_since(now))
            .filter(|remaining| !remaining.is_zero())
    }

    /// Current record for `template`.
    #[must_use]
    pub fn record(&self, template: &str) -> Option<BackoffRecord> {
        self.records.get(template).map(|r| *r.value())
    }

    /// Drop records of templates that are no longer configured.
    pub fn prune<'a>(&self, known: impl IntoIterator<Item = &'a str>) -> usize {
        let known: HashSet<&str> = known.into_iter().collect();
        let before = self.records.len();
        self.records.retain(|name, _| known.contains(name.as_str()));
        let pruned = before.saturating_sub(self.records.len());
        if pruned > 0 {
            debug!(pruned, "Pruned backoff records of removed templates");
        }
        pruned
    }

    /// Number of templates currently backing off or recently failed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no template has a backoff record.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
