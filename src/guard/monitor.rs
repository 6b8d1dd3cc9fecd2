//! Operator views over the abuse audit trail.
//!
//! Unlike the request path, monitoring fails closed: store errors are
//! returned to the operator rather than swallowed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::store::{BlockRecord, GatewayStore, StoreResult, ViolationRecord};

/// One client's share of the violations in a summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Offender {
    pub identifier: String,
    pub violations: usize,
    pub last_seen: DateTime<Utc>,
}

/// Aggregate view of a set of violations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ViolationSummary {
    pub total: usize,
    pub distinct_identifiers: usize,
    pub by_action: BTreeMap<String, usize>,
    /// Most frequent offenders, most violations first.
    pub top_offenders: Vec<Offender>,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl ViolationSummary {
    pub fn from_records(records: &[ViolationRecord], top_n: usize) -> Self {
        let mut by_action = BTreeMap::new();
        let mut per_client: HashMap<&str, (usize, DateTime<Utc>)> = HashMap::new();
        for record in records {
            *by_action.entry(record.action.clone()).or_insert(0) += 1;
            let entry = per_client
                .entry(record.identifier.as_str())
                .or_insert((0, record.timestamp));
            entry.0 += 1;
            entry.1 = entry.1.max(record.timestamp);
        }

        let mut top_offenders: Vec<Offender> = per_client
            .iter()
            .map(|(identifier, (violations, last_seen))| Offender {
                identifier: identifier.to_string(),
                violations: *violations,
                last_seen: *last_seen,
            })
            .collect();
        top_offenders.sort_by(|a, b| {
            b.violations
                .cmp(&a.violations)
                .then_with(|| b.last_seen.cmp(&a.last_seen))
                .then_with(|| a.identifier.cmp(&b.identifier))
        });
        top_offenders.truncate(top_n);

        Self {
            total: records.len(),
            distinct_identifiers: per_client.len(),
            by_action,
            top_offenders,
            first_seen: records.iter().map(|r| r.timestamp).min(),
            last_seen: records.iter().map(|r| r.timestamp).max(),
        }
    }
}

/// What one purge removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub attempts: usize,
    pub blocks: usize,
}

/// Read-side access to violations and blocks.
pub struct AbuseMonitor {
    store: Arc<dyn GatewayStore>,
}

impl AbuseMonitor {
    pub fn new(store: Arc<dyn GatewayStore>) -> Self {
        Self { store }
    }

    /// Newest violations first.
    pub fn recent_violations(
        &self,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StoreResult<Vec<ViolationRecord>> {
        self.store.list_violations(since, limit)
    }

    pub fn summary(&self, since: Option<DateTime<Utc>>, top_n: usize) -> StoreResult<ViolationSummary> {
        let records = self.store.list_violations(since, usize::MAX)?;
        Ok(ViolationSummary::from_records(&records, top_n))
    }

    pub fn active_blocks(&self, now: DateTime<Utc>) -> StoreResult<Vec<BlockRecord>> {
        self.store.list_active_blocks(now)
    }

    /// Lift a block early.
    pub fn unblock(&self, identifier: &str, user_agent: &str) -> StoreResult<bool> {
        let removed = self.store.remove_block(identifier, user_agent)?;
        tracing::info!(
            target: "intake::security",
            identifier,
            removed,
            "block lifted by operator"
        );
        Ok(removed)
    }

    /// Drop counter entries that can no longer affect any window, and
    /// blocks that have run out.
    pub fn purge_expired(&self, now: DateTime<Utc>, window: Duration) -> StoreResult<PurgeReport> {
        let report = PurgeReport {
            attempts: self.store.purge_attempts_before(now - window)?,
            blocks: self.store.purge_expired_blocks(now)?,
        };
        tracing::info!(
            attempts = report.attempts,
            blocks = report.blocks,
            "expired rate-limit state purged"
        );
        Ok(report)
    }
}
