//! ACID-durable gateway store backed by redb.
//!
//! Every check-and-record runs inside one write transaction. redb serialises
//! write transactions, so concurrent threads sharing this store can never
//! both observe "under the limit" for the same counter.
//!
//! redb holds an exclusive lock on the database file for as long as it is
//! open. A second process pointed at the same data directory fails with
//! [`StoreError::Locked`] instead of waiting.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;
use crate::store::{
    Admission, AttemptWindow, BlockRecord, CounterKey, GatewayStore, StoreResult,
    ViolationRecord, block_key, newest_violations,
};
use crate::submission::SubmissionRecord;

/// Attempt timestamps (unix millis) per counter key.
const ATTEMPTS: TableDefinition<&str, &[u8]> = TableDefinition::new("attempts");
/// Active and expired blocks per (identifier, user agent).
const BLOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("blocks");
/// Append-only violation audit, keyed by sequence number.
const VIOLATIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("violations");
/// Submissions by id (JSON: answers are self-describing).
const SUBMISSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("submissions");
/// Fingerprint uniqueness index: fingerprint -> submission id.
const FINGERPRINTS: TableDefinition<&str, &str> = TableDefinition::new("submission_fingerprints");

const DB_FILE: &str = "intake-gateway.redb";

fn redb_err<E: std::fmt::Display>(op: &'static str) -> impl FnOnce(E) -> StoreError {
    move |e| StoreError::Redb {
        message: format!("{op} failed: {e}"),
    }
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization {
        message: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization {
        message: e.to_string(),
    })
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::Serialization {
        message: format!("attempt timestamp out of range: {ms}"),
    })
}

fn window(stamps: &[i64], since: DateTime<Utc>) -> StoreResult<AttemptWindow> {
    let since = millis(since);
    let live: Vec<i64> = stamps.iter().copied().filter(|t| *t > since).collect();
    Ok(AttemptWindow {
        count: u32::try_from(live.len()).unwrap_or(u32::MAX),
        oldest: live.iter().min().copied().map(from_millis).transpose()?,
    })
}

/// ACID-durable store using redb.
pub struct DurableGatewayStore {
    db: Arc<Database>,
}

impl DurableGatewayStore {
    /// Open or create the store in the given directory. All tables are
    /// created up front so read transactions never meet a missing table.
    pub fn open(data_dir: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| StoreError::Io { source: e })?;
        let db_path = data_dir.join(DB_FILE);
        let db = Database::create(&db_path).map_err(|e| match e {
            redb::DatabaseError::DatabaseAlreadyOpen => StoreError::Locked {
                path: db_path.display().to_string(),
            },
            other => StoreError::Redb {
                message: format!("failed to open redb at {}: {other}", db_path.display()),
            },
        })?;

        let txn = db.begin_write().map_err(redb_err("begin_write"))?;
        {
            txn.open_table(ATTEMPTS).map_err(redb_err("open_table"))?;
            txn.open_table(BLOCKS).map_err(redb_err("open_table"))?;
            txn.open_table(VIOLATIONS).map_err(redb_err("open_table"))?;
            txn.open_table(SUBMISSIONS).map_err(redb_err("open_table"))?;
            txn.open_table(FINGERPRINTS).map_err(redb_err("open_table"))?;
        }
        txn.commit().map_err(redb_err("commit"))?;

        tracing::debug!(path = %db_path.display(), "durable gateway store opened");
        Ok(Self { db: Arc::new(db) })
    }

    fn read_attempts(&self, key: &CounterKey) -> StoreResult<Vec<i64>> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn.open_table(ATTEMPTS).map_err(redb_err("open_table"))?;
        match table.get(key.storage_key().as_str()).map_err(redb_err("get"))? {
            Some(guard) => decode(guard.value()),
            None => Ok(Vec::new()),
        }
    }
}

impl GatewayStore for DurableGatewayStore {
    fn create_counter_attempt(&self, key: &CounterKey, at: DateTime<Utc>) -> StoreResult<()> {
        let storage_key = key.storage_key();
        let txn = self.db.begin_write().map_err(redb_err("begin_write"))?;
        {
            let mut table = txn.open_table(ATTEMPTS).map_err(redb_err("open_table"))?;
            let mut stamps: Vec<i64> = match table.get(storage_key.as_str()).map_err(redb_err("get"))? {
                Some(guard) => decode(guard.value())?,
                None => Vec::new(),
            };
            stamps.push(millis(at));
            let bytes = encode(&stamps)?;
            table
                .insert(storage_key.as_str(), bytes.as_slice())
                .map_err(redb_err("insert"))?;
        }
        txn.commit().map_err(redb_err("commit"))?;
        Ok(())
    }

    fn count_attempts_since(
        &self,
        key: &CounterKey,
        since: DateTime<Utc>,
    ) -> StoreResult<AttemptWindow> {
        window(&self.read_attempts(key)?, since)
    }

    fn admit_attempt(
        &self,
        key: &CounterKey,
        now: DateTime<Utc>,
        since: DateTime<Utc>,
        max: u32,
    ) -> StoreResult<Admission> {
        let storage_key = key.storage_key();
        let txn = self.db.begin_write().map_err(redb_err("begin_write"))?;
        let admission = {
            let mut table = txn.open_table(ATTEMPTS).map_err(redb_err("open_table"))?;
            let mut stamps: Vec<i64> = match table.get(storage_key.as_str()).map_err(redb_err("get"))? {
                Some(guard) => decode(guard.value())?,
                None => Vec::new(),
            };
            let cutoff = millis(since);
            stamps.retain(|t| *t > cutoff);
            let current = window(&stamps, since)?;
            let admission = if current.count >= max {
                Admission::Exhausted(current)
            } else {
                stamps.push(millis(now));
                Admission::Admitted {
                    count: current.count + 1,
                }
            };
            let bytes = encode(&stamps)?;
            table
                .insert(storage_key.as_str(), bytes.as_slice())
                .map_err(redb_err("insert"))?;
            admission
        };
        txn.commit().map_err(redb_err("commit"))?;
        Ok(admission)
    }

    fn find_active_block(
        &self,
        identifier: &str,
        user_agent: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<BlockRecord>> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn.open_table(BLOCKS).map_err(redb_err("open_table"))?;
        let key = block_key(identifier, user_agent);
        let Some(guard) = table.get(key.as_str()).map_err(redb_err("get"))? else {
            return Ok(None);
        };
        let block: BlockRecord = decode(guard.value())?;
        Ok(block.is_active(now).then_some(block))
    }

    fn upsert_block(&self, block: &BlockRecord) -> StoreResult<()> {
        let bytes = encode(block)?;
        let txn = self.db.begin_write().map_err(redb_err("begin_write"))?;
        {
            let mut table = txn.open_table(BLOCKS).map_err(redb_err("open_table"))?;
            table
                .insert(block.storage_key().as_str(), bytes.as_slice())
                .map_err(redb_err("insert"))?;
        }
        txn.commit().map_err(redb_err("commit"))?;
        Ok(())
    }

    fn append_violation(&self, violation: &ViolationRecord) -> StoreResult<()> {
        let bytes = encode(violation)?;
        let txn = self.db.begin_write().map_err(redb_err("begin_write"))?;
        {
            let mut table = txn.open_table(VIOLATIONS).map_err(redb_err("open_table"))?;
            append(&mut table, &bytes)?;
        }
        txn.commit().map_err(redb_err("commit"))?;
        Ok(())
    }

    fn record_violation_and_block(
        &self,
        violation: &ViolationRecord,
        block: &BlockRecord,
    ) -> StoreResult<()> {
        let violation_bytes = encode(violation)?;
        let block_bytes = encode(block)?;
        let txn = self.db.begin_write().map_err(redb_err("begin_write"))?;
        {
            let mut violations = txn.open_table(VIOLATIONS).map_err(redb_err("open_table"))?;
            append(&mut violations, &violation_bytes)?;
            let mut blocks = txn.open_table(BLOCKS).map_err(redb_err("open_table"))?;
            blocks
                .insert(block.storage_key().as_str(), block_bytes.as_slice())
                .map_err(redb_err("insert"))?;
        }
        txn.commit().map_err(redb_err("commit"))?;
        Ok(())
    }

    fn create_submission(&self, record: &SubmissionRecord) -> StoreResult<()> {
        let bytes = serde_json::to_vec(record).map_err(|e| StoreError::Serialization {
            message: e.to_string(),
        })?;
        let txn = self.db.begin_write().map_err(redb_err("begin_write"))?;
        {
            let mut index = txn.open_table(FINGERPRINTS).map_err(redb_err("open_table"))?;
            let mut submissions = txn.open_table(SUBMISSIONS).map_err(redb_err("open_table"))?;
            let taken = index
                .get(record.fingerprint.as_str())
                .map_err(redb_err("get"))?
                .is_some()
                || submissions
                    .get(record.id.as_str())
                    .map_err(redb_err("get"))?
                    .is_some();
            if taken {
                // Dropping the transaction uncommitted rolls it back.
                return Err(StoreError::Duplicate {
                    fingerprint: record.fingerprint.clone(),
                });
            }
            index
                .insert(record.fingerprint.as_str(), record.id.as_str())
                .map_err(redb_err("insert"))?;
            submissions
                .insert(record.id.as_str(), bytes.as_slice())
                .map_err(redb_err("insert"))?;
        }
        txn.commit().map_err(redb_err("commit"))?;
        Ok(())
    }

    fn get_submission(&self, id: &str) -> StoreResult<Option<SubmissionRecord>> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn.open_table(SUBMISSIONS).map_err(redb_err("open_table"))?;
        let Some(guard) = table.get(id).map_err(redb_err("get"))? else {
            return Ok(None);
        };
        serde_json::from_slice(guard.value())
            .map(Some)
            .map_err(|e| StoreError::Serialization {
                message: e.to_string(),
            })
    }

    fn submission_count(&self) -> StoreResult<usize> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn.open_table(SUBMISSIONS).map_err(redb_err("open_table"))?;
        let len = table.len().map_err(redb_err("len"))?;
        Ok(usize::try_from(len).unwrap_or(usize::MAX))
    }

    fn list_violations(
        &self,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StoreResult<Vec<ViolationRecord>> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn.open_table(VIOLATIONS).map_err(redb_err("open_table"))?;
        let mut records = Vec::new();
        for entry in table.iter().map_err(redb_err("iter"))? {
            let (_, value) = entry.map_err(redb_err("iter"))?;
            records.push(decode::<ViolationRecord>(value.value())?);
        }
        Ok(newest_violations(records, since, limit))
    }

    fn list_active_blocks(&self, now: DateTime<Utc>) -> StoreResult<Vec<BlockRecord>> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn.open_table(BLOCKS).map_err(redb_err("open_table"))?;
        let mut blocks = Vec::new();
        for entry in table.iter().map_err(redb_err("iter"))? {
            let (_, value) = entry.map_err(redb_err("iter"))?;
            let block: BlockRecord = decode(value.value())?;
            if block.is_active(now) {
                blocks.push(block);
            }
        }
        blocks.sort_by(|a, b| a.blocked_until.cmp(&b.blocked_until));
        Ok(blocks)
    }

    fn remove_block(&self, identifier: &str, user_agent: &str) -> StoreResult<bool> {
        let key = block_key(identifier, user_agent);
        let txn = self.db.begin_write().map_err(redb_err("begin_write"))?;
        let existed = {
            let mut table = txn.open_table(BLOCKS).map_err(redb_err("open_table"))?;
            let removed = table.remove(key.as_str()).map_err(redb_err("remove"))?;
            removed.is_some()
        };
        txn.commit().map_err(redb_err("commit"))?;
        Ok(existed)
    }

    fn purge_attempts_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let cutoff = millis(cutoff);
        let txn = self.db.begin_write().map_err(redb_err("begin_write"))?;
        let purged = {
            let mut table = txn.open_table(ATTEMPTS).map_err(redb_err("open_table"))?;
            let mut updates: Vec<(String, Vec<i64>)> = Vec::new();
            let mut purged = 0;
            for entry in table.iter().map_err(redb_err("iter"))? {
                let (key, value) = entry.map_err(redb_err("iter"))?;
                let stamps: Vec<i64> = decode(value.value())?;
                let kept: Vec<i64> = stamps.iter().copied().filter(|t| *t > cutoff).collect();
                if kept.len() != stamps.len() {
                    purged += stamps.len() - kept.len();
                    updates.push((key.value().to_string(), kept));
                }
            }
            for (key, kept) in updates {
                if kept.is_empty() {
                    table.remove(key.as_str()).map_err(redb_err("remove"))?;
                } else {
                    let bytes = encode(&kept)?;
                    table
                        .insert(key.as_str(), bytes.as_slice())
                        .map_err(redb_err("insert"))?;
                }
            }
            purged
        };
        txn.commit().map_err(redb_err("commit"))?;
        Ok(purged)
    }

    fn purge_expired_blocks(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let txn = self.db.begin_write().map_err(redb_err("begin_write"))?;
        let purged = {
            let mut table = txn.open_table(BLOCKS).map_err(redb_err("open_table"))?;
            let mut expired = Vec::new();
            for entry in table.iter().map_err(redb_err("iter"))? {
                let (key, value) = entry.map_err(redb_err("iter"))?;
                let block: BlockRecord = decode(value.value())?;
                if !block.is_active(now) {
                    expired.push(key.value().to_string());
                }
            }
            for key in &expired {
                table.remove(key.as_str()).map_err(redb_err("remove"))?;
            }
            expired.len()
        };
        txn.commit().map_err(redb_err("commit"))?;
        Ok(purged)
    }
}

fn append(table: &mut redb::Table<'_, u64, &'static [u8]>, bytes: &[u8]) -> StoreResult<()> {
    let next = table
        .last()
        .map_err(redb_err("last"))?
        .map(|(k, _)| k.value() + 1)
        .unwrap_or(0);
    table.insert(next, bytes).map_err(redb_err("insert"))?;
    Ok(())
}

impl std::fmt::Debug for DurableGatewayStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableGatewayStore").finish()
    }
}
