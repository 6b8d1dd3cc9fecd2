//! In-memory gateway store backed by DashMap.
//!
//! Counter updates hold the DashMap shard lock for their key, which makes
//! check-and-record atomic within one process. Nothing survives a restart,
//! and separate processes do not share limits.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::StoreError;
use crate::store::{
    Admission, AttemptWindow, BlockRecord, CounterKey, GatewayStore, StoreResult,
    ViolationRecord, block_key, newest_violations,
};
use crate::submission::SubmissionRecord;

#[derive(Debug, Default)]
struct AuditLog {
    blocks: HashMap<String, BlockRecord>,
    violations: Vec<ViolationRecord>,
}

/// Concurrent in-memory store.
#[derive(Debug, Default)]
pub struct MemGatewayStore {
    attempts: DashMap<CounterKey, Vec<DateTime<Utc>>>,
    audit: Mutex<AuditLog>,
    submissions: DashMap<String, SubmissionRecord>,
    fingerprints: DashMap<String, String>,
}

impl MemGatewayStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn audit(&self) -> MutexGuard<'_, AuditLog> {
        self.audit.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn window(stamps: &[DateTime<Utc>], since: DateTime<Utc>) -> AttemptWindow {
    let live = stamps.iter().filter(|t| **t > since);
    AttemptWindow {
        count: u32::try_from(live.clone().count()).unwrap_or(u32::MAX),
        oldest: live.min().copied(),
    }
}

impl GatewayStore for MemGatewayStore {
    fn create_counter_attempt(&self, key: &CounterKey, at: DateTime<Utc>) -> StoreResult<()> {
        self.attempts.entry(key.clone()).or_default().push(at);
        Ok(())
    }

    fn count_attempts_since(
        &self,
        key: &CounterKey,
        since: DateTime<Utc>,
    ) -> StoreResult<AttemptWindow> {
        Ok(self
            .attempts
            .get(key)
            .map(|stamps| window(&stamps, since))
            .unwrap_or(AttemptWindow {
                count: 0,
                oldest: None,
            }))
    }

    fn admit_attempt(
        &self,
        key: &CounterKey,
        now: DateTime<Utc>,
        since: DateTime<Utc>,
        max: u32,
    ) -> StoreResult<Admission> {
        let mut stamps = self.attempts.entry(key.clone()).or_default();
        stamps.retain(|t| *t > since);
        let current = window(&stamps, since);
        if current.count >= max {
            return Ok(Admission::Exhausted(current));
        }
        stamps.push(now);
        Ok(Admission::Admitted {
            count: current.count + 1,
        })
    }

    fn find_active_block(
        &self,
        identifier: &str,
        user_agent: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<BlockRecord>> {
        Ok(self
            .audit()
            .blocks
            .get(&block_key(identifier, user_agent))
            .filter(|b| b.is_active(now))
            .cloned())
    }

    fn upsert_block(&self, block: &BlockRecord) -> StoreResult<()> {
        self.audit().blocks.insert(block.storage_key(), block.clone());
        Ok(())
    }

    fn append_violation(&self, violation: &ViolationRecord) -> StoreResult<()> {
        self.audit().violations.push(violation.clone());
        Ok(())
    }

    fn record_violation_and_block(
        &self,
        violation: &ViolationRecord,
        block: &BlockRecord,
    ) -> StoreResult<()> {
        let mut audit = self.audit();
        audit.violations.push(violation.clone());
        audit.blocks.insert(block.storage_key(), block.clone());
        Ok(())
    }

    fn create_submission(&self, record: &SubmissionRecord) -> StoreResult<()> {
        let duplicate = || StoreError::Duplicate {
            fingerprint: record.fingerprint.clone(),
        };
        if self.submissions.contains_key(&record.id) {
            return Err(duplicate());
        }
        match self.fingerprints.entry(record.fingerprint.clone()) {
            Entry::Occupied(_) => Err(duplicate()),
            Entry::Vacant(slot) => {
                slot.insert(record.id.clone());
                self.submissions.insert(record.id.clone(), record.clone());
                Ok(())
            }
        }
    }

    fn get_submission(&self, id: &str) -> StoreResult<Option<SubmissionRecord>> {
        Ok(self.submissions.get(id).map(|r| r.value().clone()))
    }

    fn submission_count(&self) -> StoreResult<usize> {
        Ok(self.submissions.len())
    }

    fn list_violations(
        &self,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StoreResult<Vec<ViolationRecord>> {
        let records = self.audit().violations.clone();
        Ok(newest_violations(records, since, limit))
    }

    fn list_active_blocks(&self, now: DateTime<Utc>) -> StoreResult<Vec<BlockRecord>> {
        let mut blocks: Vec<_> = self
            .audit()
            .blocks
            .values()
            .filter(|b| b.is_active(now))
            .cloned()
            .collect();
        blocks.sort_by(|a, b| a.blocked_until.cmp(&b.blocked_until));
        Ok(blocks)
    }

    fn remove_block(&self, identifier: &str, user_agent: &str) -> StoreResult<bool> {
        Ok(self
            .audit()
            .blocks
            .remove(&block_key(identifier, user_agent))
            .is_some())
    }

    fn purge_attempts_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let mut purged = 0;
        self.attempts.retain(|_, stamps| {
            let before = stamps.len();
            stamps.retain(|t| *t > cutoff);
            purged += before - stamps.len();
            !stamps.is_empty()
        });
        Ok(purged)
    }

    fn purge_expired_blocks(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut audit = self.audit();
        let before = audit.blocks.len();
        audit.blocks.retain(|_, block| block.is_active(now));
        Ok(before - audit.blocks.len())
    }
}
