//! Agent retention policies.
//!
//! The scheduler's retention loop calls [`RetentionPolicy::check`] about once
//! a minute for every agent and terminates the ones it is told to.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Idle minutes after which a run-once agent is reclaimed anyway.
pub const ONCE_IDLE_MINUTES: i64 = 10;

/// Agents that went idle within this window of connecting never ran anything.
const CONNECT_LAPSE_SECONDS: i64 = 5;

fn default_idle_minutes() -> u64 {
    10
}

/// When to get rid of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RetentionPolicy {
    /// Terminate once idle longer than `idle_minutes`. Zero keeps the agent
    /// forever.
    #[serde(rename_all = "camelCase")]
    Idle {
        #[serde(default = "default_idle_minutes")]
        idle_minutes: u64,
    },
    /// Terminate after the first task, or after ten idle minutes.
    Once,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::Idle {
            idle_minutes: default_idle_minutes(),
        }
    }
}

/// What the scheduler knows about one agent's activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputerActivity {
    /// When the agent became idle, `None` while it runs a task.
    pub idle_since: Option<DateTime<Utc>>,
    /// When the agent connected.
    pub connected_at: DateTime<Utc>,
    /// When the scheduler itself came up.
    pub scheduler_started_at: DateTime<Utc>,
}

/// Outcome of a retention check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionDecision {
    /// Leave the agent alone.
    Keep,
    /// Terminate the agent.
    Terminate,
}

impl RetentionPolicy {
    /// Decide whether the agent should be terminated at `now`.
    #[must_use]
    pub fn check(&self, activity: &ComputerActivity, now: DateTime<Utc>) -> RetentionDecision {
        let Some(idle_since) = activity.idle_since else {
            return RetentionDecision::Keep;
        };
        let idle_for = now.signed_duration_since(idle_since);

        match *self {
            Self::Idle { idle_minutes: 0 } => RetentionDecision::Keep,
            Self::Idle { idle_minutes } => {
                let lapse = Duration::seconds(CONNECT_LAPSE_SECONDS);
                let mut never_connected = idle_since - activity.connected_at < lapse;
                // After a scheduler restart every agent looks freshly connected.
                if idle_since - activity.scheduler_started_at < lapse {
                    never_connected = false;
                }
                let limit = i64::try_from(idle_minutes)
                    .ok()
                    .and_then(Duration::try_minutes)
                    .unwrap_or(Duration::MAX);
                if !never_connected && idle_for > limit {
                    RetentionDecision::Terminate
                } else {
                    RetentionDecision::Keep
                }
            }
            Self::Once => {
                if idle_for > Duration::minutes(ONCE_IDLE_MINUTES) {
                    RetentionDecision::Terminate
                } else {
                    RetentionDecision::Keep
                }
            }
        }
    }

    /// Decide what happens once the agent finished a task.
    #[must_use]
    pub fn on_task_completed(&self) -> RetentionDecision {
        match self {
            Self::Once => RetentionDecision::Terminate,
            Self::Idle { .. } => RetentionDecision::Keep,
        }
    }
}
