//! Persistent per-client rate limiting with escalating blocks.
//!
//! Attempts are counted per (client identifier, action) over a sliding window.
//! Reaching the limit appends a violation to the audit log and blocks the
//! (identifier, user agent) pair for a fixed duration. While a block is active
//! the counters are neither read nor written.
//!
//! The guard fails open: if the store cannot be reached the request is
//! admitted and the failure is logged. An outage must never lock out genuine
//! respondents.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::error::StoreError;
use crate::store::{Admission, AttemptWindow, BlockRecord, CounterKey, GatewayStore, ViolationRecord};
use crate::survey::SecuritySettings;

/// User agents longer than this are truncated before they key a block.
pub const MAX_USER_AGENT_LEN: usize = 512;

const UNKNOWN: &str = "unknown";

/// Limits applied by the [`AbuseGuard`].
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Attempts allowed inside the window.
    pub max_attempts: u32,
    /// Sliding window length.
    pub window: Duration,
    /// How long a client is blocked after exceeding the limit.
    pub block_duration: Duration,
    /// Counter namespace.
    pub action: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::from(&SecuritySettings::default())
    }
}

impl From<&SecuritySettings> for RateLimitConfig {
    fn from(settings: &SecuritySettings) -> Self {
        Self {
            max_attempts: settings.rate_limit_max_attempts,
            window: Duration::minutes(i64::from(settings.rate_limit_window_minutes)),
            block_duration: Duration::minutes(i64::from(settings.block_duration_minutes)),
            action: settings.rate_limit_action.clone(),
        }
    }
}

/// Who is making a request, as far as rate limiting is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity {
    pub identifier: String,
    pub user_agent: String,
}

impl ClientIdentity {
    /// Blank parts become `"unknown"`; the user agent is capped.
    pub fn new(identifier: impl AsRef<str>, user_agent: Option<&str>) -> Self {
        let identifier = identifier.as_ref().trim();
        let user_agent: String = user_agent
            .map(str::trim)
            .filter(|ua| !ua.is_empty())
            .unwrap_or(UNKNOWN)
            .chars()
            .take(MAX_USER_AGENT_LEN)
            .collect();
        Self {
            identifier: if identifier.is_empty() {
                UNKNOWN.to_string()
            } else {
                identifier.to_string()
            },
            user_agent,
        }
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq)]
pub enum RateDecision {
    /// Attempt recorded and admitted.
    Allowed { remaining: u32 },
    /// Store unavailable; admitted without counting.
    FailedOpen,
    /// An earlier block is still active.
    Blocked {
        blocked_until: DateTime<Utc>,
        retry_after_secs: u64,
    },
    /// This attempt hit the limit; a new block now applies.
    Limited {
        attempts: u32,
        blocked_until: DateTime<Utc>,
        retry_after_secs: u64,
    },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. } | Self::FailedOpen)
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Blocked {
                retry_after_secs, ..
            }
            | Self::Limited {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }

    pub fn blocked_until(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Blocked { blocked_until, .. } | Self::Limited { blocked_until, .. } => {
                Some(*blocked_until)
            }
            _ => None,
        }
    }
}

fn whole_seconds(d: Duration) -> u64 {
    // Round up so clients never retry a moment too early.
    let secs = d.num_seconds() + i64::from(d.subsec_nanos() > 0);
    u64::try_from(secs.max(1)).unwrap_or(1)
}

/// Counts attempts and escalates to blocks, backed by a [`GatewayStore`].
pub struct AbuseGuard {
    store: Arc<dyn GatewayStore>,
    config: RateLimitConfig,
}

impl AbuseGuard {
    pub fn new(store: Arc<dyn GatewayStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check and record an attempt now.
    pub fn check(&self, client: &ClientIdentity) -> RateDecision {
        self.check_at(client, Utc::now())
    }

    /// Check and record an attempt at an explicit time.
    pub fn check_at(&self, client: &ClientIdentity, now: DateTime<Utc>) -> RateDecision {
        match self
            .store
            .find_active_block(&client.identifier, &client.user_agent, now)
        {
            Ok(Some(block)) => {
                tracing::info!(
                    target: "intake::security",
                    identifier = %client.identifier,
                    blocked_until = %block.blocked_until,
                    "request from blocked client rejected"
                );
                return RateDecision::Blocked {
                    blocked_until: block.blocked_until,
                    retry_after_secs: whole_seconds(block.remaining(now)),
                };
            }
            Ok(None) => {}
            Err(e) => return self.fail_open("find_active_block", client, &e),
        }

        let key = CounterKey::new(&client.identifier, &self.config.action);
        let since = now - self.config.window;
        match self
            .store
            .admit_attempt(&key, now, since, self.config.max_attempts)
        {
            Ok(Admission::Admitted { count }) => RateDecision::Allowed {
                remaining: self.config.max_attempts.saturating_sub(count),
            },
            Ok(Admission::Exhausted(window)) => self.escalate(client, window, now),
            Err(e) => self.fail_open("admit_attempt", client, &e),
        }
    }

    fn escalate(
        &self,
        client: &ClientIdentity,
        window: AttemptWindow,
        now: DateTime<Utc>,
    ) -> RateDecision {
        let blocked_until = now + self.config.block_duration;
        let violation = ViolationRecord {
            identifier: client.identifier.clone(),
            action: self.config.action.clone(),
            user_agent: client.user_agent.clone(),
            attempt_count: window.count,
            timestamp: now,
            metadata: BTreeMap::from([
                (
                    "window_minutes".to_string(),
                    self.config.window.num_minutes().to_string(),
                ),
                (
                    "max_attempts".to_string(),
                    self.config.max_attempts.to_string(),
                ),
            ]),
        };
        let block = BlockRecord {
            identifier: client.identifier.clone(),
            user_agent: client.user_agent.clone(),
            blocked_until,
            reason: format!(
                "exceeded {} {} attempts within {} minutes",
                self.config.max_attempts,
                self.config.action,
                self.config.window.num_minutes()
            ),
            created_at: now,
        };
        if let Err(e) = self.store.record_violation_and_block(&violation, &block) {
            return self.fail_open("record_violation_and_block", client, &e);
        }

        tracing::warn!(
            target: "intake::security",
            identifier = %client.identifier,
            action = %self.config.action,
            attempts = window.count,
            %blocked_until,
            "rate limit exceeded, client blocked"
        );

        // The window frees up when its oldest attempt expires.
        let retry_after = window
            .oldest
            .map(|oldest| oldest + self.config.window - now)
            .unwrap_or(self.config.block_duration);
        RateDecision::Limited {
            attempts: window.count,
            blocked_until,
            retry_after_secs: whole_seconds(retry_after),
        }
    }

    fn fail_open(&self, op: &str, client: &ClientIdentity, error: &StoreError) -> RateDecision {
        tracing::error!(
            target: "intake::security",
            op,
            identifier = %client.identifier,
            error = %error,
            "rate limit store unavailable, failing open"
        );
        RateDecision::FailedOpen
    }
}
