//! Persistence for the abuse guard and accepted submissions.
//!
//! Two backends implement [`GatewayStore`]:
//!
//! - [`MemGatewayStore`](mem::MemGatewayStore): concurrent hashmaps (DashMap),
//!   lost on exit, correct only within one process
//! - [`DurableGatewayStore`](durable::DurableGatewayStore): ACID transactions
//!   (redb), surviving restarts. redb locks its file, so one process owns a
//!   data directory; its worker threads share the handle
//!
//! The guard's correctness depends on [`GatewayStore::admit_attempt`] and
//! [`GatewayStore::record_violation_and_block`] being atomic, so concurrent
//! requests from one client can never all observe "under the limit".

pub mod durable;
pub mod mem;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::submission::SubmissionRecord;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Identifies one rate-limit counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterKey {
    pub identifier: String,
    pub action: String,
}

impl CounterKey {
    pub fn new(identifier: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            action: action.into(),
        }
    }

    /// Flat key used by the durable backend.
    pub fn storage_key(&self) -> String {
        format!("{}\u{1f}{}", self.action, self.identifier)
    }
}

/// A block on a (client identifier, user agent) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub identifier: String,
    pub user_agent: String,
    pub blocked_until: DateTime<Utc>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl BlockRecord {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.blocked_until > now
    }

    /// Time left on the block, zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.blocked_until - now).max(Duration::zero())
    }

    pub fn storage_key(&self) -> String {
        block_key(&self.identifier, &self.user_agent)
    }
}

pub(crate) fn block_key(identifier: &str, user_agent: &str) -> String {
    format!("{identifier}\u{1f}{user_agent}")
}

/// Append-only audit record of a rate-limit violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub identifier: String,
    pub action: String,
    pub user_agent: String,
    /// Attempts counted in the window when the limit was hit.
    pub attempt_count: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Attempts inside a window, and when the earliest of them happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptWindow {
    pub count: u32,
    pub oldest: Option<DateTime<Utc>>,
}

/// Outcome of an atomic check-and-record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Attempt recorded; `count` includes it.
    Admitted { count: u32 },
    /// Limit already reached; nothing recorded.
    Exhausted(AttemptWindow),
}

/// Storage operations the gateway depends on.
pub trait GatewayStore: Send + Sync {
    /// Record one attempt at `at`.
    fn create_counter_attempt(&self, key: &CounterKey, at: DateTime<Utc>) -> StoreResult<()>;

    /// Attempts recorded strictly after `since`.
    fn count_attempts_since(&self, key: &CounterKey, since: DateTime<Utc>)
    -> StoreResult<AttemptWindow>;

    /// Atomically count attempts after `since` and, if fewer than `max`,
    /// record one at `now`. Attempts at or before `since` may be pruned.
    fn admit_attempt(
        &self,
        key: &CounterKey,
        now: DateTime<Utc>,
        since: DateTime<Utc>,
        max: u32,
    ) -> StoreResult<Admission>;

    /// The block on this pair, if one is active at `now`.
    fn find_active_block(
        &self,
        identifier: &str,
        user_agent: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<BlockRecord>>;

    /// Insert or replace the block on the record's pair.
    fn upsert_block(&self, block: &BlockRecord) -> StoreResult<()>;

    fn append_violation(&self, violation: &ViolationRecord) -> StoreResult<()>;

    /// Append the violation and upsert the block as one unit.
    fn record_violation_and_block(
        &self,
        violation: &ViolationRecord,
        block: &BlockRecord,
    ) -> StoreResult<()>;

    /// Persist a submission. Fails with [`StoreError::Duplicate`] if its
    /// id or fingerprint is already present.
    fn create_submission(&self, record: &SubmissionRecord) -> StoreResult<()>;

    fn get_submission(&self, id: &str) -> StoreResult<Option<SubmissionRecord>>;

    fn submission_count(&self) -> StoreResult<usize>;

    /// Violations at or after `since`, newest first, at most `limit`.
    fn list_violations(
        &self,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StoreResult<Vec<ViolationRecord>>;

    fn list_active_blocks(&self, now: DateTime<Utc>) -> StoreResult<Vec<BlockRecord>>;

    /// Lift a block. Returns whether one existed.
    fn remove_block(&self, identifier: &str, user_agent: &str) -> StoreResult<bool>;

    /// Drop attempts at or before `cutoff`. Returns how many were dropped.
    fn purge_attempts_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize>;

    /// Drop blocks no longer active at `now`. Returns how many were dropped.
    fn purge_expired_blocks(&self, now: DateTime<Utc>) -> StoreResult<usize>;
}

/// Open the in-memory backend.
pub fn memory_only() -> Arc<dyn GatewayStore> {
    tracing::warn!(
        "using in-memory gateway store: limits are per process and lost on restart"
    );
    Arc::new(mem::MemGatewayStore::new())
}

/// Open (or create) the durable backend in `data_dir`.
pub fn with_persistence(data_dir: &Path) -> StoreResult<Arc<dyn GatewayStore>> {
    Ok(Arc::new(durable::DurableGatewayStore::open(data_dir)?))
}

/// Keep the `limit` newest violations at or after `since`.
pub(crate) fn newest_violations(
    mut records: Vec<ViolationRecord>,
    since: Option<DateTime<Utc>>,
    limit: usize,
) -> Vec<ViolationRecord> {
    if let Some(since) = since {
        records.retain(|v| v.timestamp >= since);
    }
    records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    records.truncate(limit);
    records
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn violation(identifier: &str, at: DateTime<Utc>) -> ViolationRecord {
        ViolationRecord {
            identifier: identifier.into(),
            action: "submission".into(),
            user_agent: "test-agent".into(),
            attempt_count: 1,
            timestamp: at,
            metadata: BTreeMap::new(),
        }
    }

    pub(crate) fn block(identifier: &str, until: DateTime<Utc>) -> BlockRecord {
        BlockRecord {
            identifier: identifier.into(),
            user_agent: "test-agent".into(),
            blocked_until: until,
            reason: "test".into(),
            created_at: until - Duration::hours(1),
        }
    }

    /// Behaviour every backend must share.
    pub(crate) fn exercise_backend(store: &dyn GatewayStore) {
        // Attempts are kept at millisecond precision.
        let now = DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap();
        let key = CounterKey::new("1.2.3.4", "submission");
        let since = now - Duration::days(3);

        assert_eq!(
            store.admit_attempt(&key, now, since, 2).unwrap(),
            Admission::Admitted { count: 1 }
        );
        assert_eq!(
            store.admit_attempt(&key, now, since, 2).unwrap(),
            Admission::Admitted { count: 2 }
        );
        assert_eq!(
            store.admit_attempt(&key, now, since, 2).unwrap(),
            Admission::Exhausted(AttemptWindow {
                count: 2,
                oldest: Some(now)
            })
        );
        // Attempts outside the window no longer count.
        let later = now + Duration::days(4);
        assert_eq!(
            store
                .count_attempts_since(&key, later - Duration::days(3))
                .unwrap()
                .count,
            0
        );

        let other = CounterKey::new("1.2.3.4", "login");
        store.create_counter_attempt(&other, now).unwrap();
        assert_eq!(store.count_attempts_since(&other, since).unwrap().count, 1);
        assert_eq!(store.purge_attempts_before(now).unwrap(), 3);
        assert_eq!(store.count_attempts_since(&other, since).unwrap().count, 0);

        assert!(store.find_active_block("1.2.3.4", "test-agent", now).unwrap().is_none());
        store
            .record_violation_and_block(
                &violation("1.2.3.4", now),
                &block("1.2.3.4", now + Duration::hours(1)),
            )
            .unwrap();
        let active = store
            .find_active_block("1.2.3.4", "test-agent", now)
            .unwrap()
            .unwrap();
        assert_eq!(active.blocked_until, now + Duration::hours(1));
        // Different user agent is a different pair.
        assert!(store.find_active_block("1.2.3.4", "other", now).unwrap().is_none());
        // Expired blocks are not active.
        assert!(
            store
                .find_active_block("1.2.3.4", "test-agent", now + Duration::hours(2))
                .unwrap()
                .is_none()
        );

        store.upsert_block(&block("1.2.3.4", now + Duration::hours(5))).unwrap();
        assert_eq!(store.list_active_blocks(now).unwrap().len(), 1);

        store
            .append_violation(&violation("5.6.7.8", now + Duration::minutes(1)))
            .unwrap();
        let listed = store.list_violations(None, 10).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].identifier, "5.6.7.8");
        assert_eq!(store.list_violations(None, 1).unwrap().len(), 1);
        assert_eq!(
            store
                .list_violations(Some(now + Duration::seconds(30)), 10)
                .unwrap()
                .len(),
            1
        );

        assert!(store.remove_block("1.2.3.4", "test-agent").unwrap());
        assert!(!store.remove_block("1.2.3.4", "test-agent").unwrap());
        assert!(store.list_active_blocks(now).unwrap().is_empty());

        store.upsert_block(&block("9.9.9.1", now - Duration::minutes(1))).unwrap();
        store.upsert_block(&block("9.9.9.2", now)).unwrap();
        store.upsert_block(&block("9.9.9.3", now + Duration::minutes(1))).unwrap();
        assert_eq!(store.purge_expired_blocks(now).unwrap(), 2);
        assert_eq!(store.purge_expired_blocks(now).unwrap(), 0);
        assert!(store.remove_block("9.9.9.3", "test-agent").unwrap());
        assert!(!store.remove_block("9.9.9.1", "test-agent").unwrap());
    }

    #[test]
    fn block_remaining_is_never_negative() {
        let now = Utc::now();
        let b = block("x", now - Duration::minutes(5));
        assert!(!b.is_active(now));
        assert_eq!(b.remaining(now), Duration::zero());
    }

    #[test]
    fn newest_violations_orders_and_limits() {
        let now = Utc::now();
        let records = vec![
            violation("a", now - Duration::hours(2)),
            violation("b", now),
            violation("c", now - Duration::hours(1)),
        ];
        let out = newest_violations(records, Some(now - Duration::minutes(90)), 5);
        let ids: Vec<_> = out.iter().map(|v| v.identifier.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }
}
