// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Persistent outbox of peer deliveries, backed by redb.
//!
//! ## Table Layout
//!
//! - `outbox_items`: item id → serialized [`OutboxItem`]
//!
//! Items hold references only (file address, recipient, options). Tokens and
//! key material are resolved again at send time.

use std::path::Path;
use std::time::Duration;

use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::wire::PayloadInstruction;
use crate::drive::FileSystemType;
use crate::models::{unix_millis_now, GlobalTransitIdFileIdentifier, IdentityId, InternalDriveFileId, TargetDrive};
use crate::upload::instruction_set::{AppNotificationOptions, SendContents};

// =============================================================================
// Table Definitions
// =============================================================================

const OUTBOX_ITEMS: TableDefinition<&str, &[u8]> = TableDefinition::new("outbox_items");

/// How long a sweep owns an item it picked up before another sweep may
/// pick it up again.
const LEASE: Duration = Duration::from_secs(5 * 60);

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("outbox item not found: {0}")]
    NotFound(Uuid),
}

pub type OutboxResult<T> = Result<T, OutboxError>;

// =============================================================================
// Items
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboxWork {
    #[serde(rename_all = "camelCase")]
    SendFile {
        remote_target_drive: Option<TargetDrive>,
        remote_global_transit_id: Option<Uuid>,
        send_contents: SendContents,
        file_system_type: FileSystemType,
        app_notification: Option<AppNotificationOptions>,
    },
    /// Apply payload instructions to the recipient's copy of `target`.
    #[serde(rename_all = "camelCase")]
    UpdateFile {
        target: GlobalTransitIdFileIdentifier,
        payload_instructions: Vec<PayloadInstruction>,
        new_version_tag: Uuid,
        app_notification: Option<AppNotificationOptions>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxItem {
    pub id: Uuid,
    pub file: InternalDriveFileId,
    pub recipient: IdentityId,
    pub work: OutboxWork,
    /// Delete the source file once no items for it remain.
    pub is_transient: bool,
    pub attempt_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub added_at: i64,
    pub next_attempt_at: i64,
}

impl OutboxItem {
    pub fn new(file: InternalDriveFileId, recipient: IdentityId, work: OutboxWork, is_transient: bool) -> Self {
        let now = unix_millis_now();
        Self {
            id: Uuid::new_v4(),
            file,
            recipient,
            work,
            is_transient,
            attempt_count: 0,
            last_error: None,
            added_at: now,
            next_attempt_at: now,
        }
    }
}

// =============================================================================
// Retry Policy
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, doubling from the base delay.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Rescheduled { attempt: u32, next_attempt_at: i64 },
    /// Attempts exhausted; the item was removed.
    Dropped,
}

// =============================================================================
// Outbox
// =============================================================================

pub struct Outbox {
    db: Database,
    policy: RetryPolicy,
}

impl Outbox {
    /// Open (or create) the outbox at the given path.
    pub fn open(path: &Path, policy: RetryPolicy) -> OutboxResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(OUTBOX_ITEMS)?;
        }
        write_txn.commit()?;

        Ok(Self { db, policy })
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn add(&self, item: &OutboxItem) -> OutboxResult<()> {
        let json = serde_json::to_vec(item)?;
        let key = item.id.to_string();
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(OUTBOX_ITEMS)?;
            table.insert(key.as_str(), json.as_slice())?;
        }
        write_txn.commit()?;
        debug!(item_id = %item.id, recipient = %item.recipient, file = %item.file, "outbox item added");
        Ok(())
    }

    /// Add an item that the caller is about to attempt itself. Sweeps leave
    /// it alone until the lease runs out, so an attempt that never reports
    /// back is still retried.
    pub fn add_leased(&self, item: &OutboxItem, now: i64) -> OutboxResult<()> {
        let mut leased = item.clone();
        leased.next_attempt_at = now.saturating_add(LEASE.as_millis() as i64);
        self.add(&leased)
    }

    /// Make a leased item due at `now`. Returns whether it was present.
    pub fn release(&self, id: Uuid, now: i64) -> OutboxResult<bool> {
        let key = id.to_string();
        let write_txn = self.db.begin_write()?;
        let released = {
            let mut table = write_txn.open_table(OUTBOX_ITEMS)?;
            let item: Option<OutboxItem> = match table.get(key.as_str())? {
                Some(value) => Some(serde_json::from_slice(value.value())?),
                None => None,
            };
            match item {
                Some(mut item) => {
                    item.next_attempt_at = now;
                    let json = serde_json::to_vec(&item)?;
                    table.insert(key.as_str(), json.as_slice())?;
                    true
                }
                None => false,
            }
        };
        write_txn.commit()?;
        Ok(released)
    }

    pub fn get(&self, id: Uuid) -> OutboxResult<Option<OutboxItem>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OUTBOX_ITEMS)?;
        let key = id.to_string();
        match table.get(key.as_str())? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    fn all(&self) -> OutboxResult<Vec<OutboxItem>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OUTBOX_ITEMS)?;
        let mut items = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            match serde_json::from_slice::<OutboxItem>(value.value()) {
                Ok(item) => items.push(item),
                Err(e) => warn!(error = %e, "skipping unreadable outbox item"),
            }
        }
        Ok(items)
    }

    /// Items due at `now`, oldest due first. Returned items are leased so a
    /// concurrent sweep will not pick them up until the lease runs out.
    pub fn due_items(&self, now: i64, limit: usize) -> OutboxResult<Vec<OutboxItem>> {
        let mut due: Vec<OutboxItem> = self.all()?.into_iter().filter(|i| i.next_attempt_at <= now).collect();
        due.sort_by_key(|i| (i.next_attempt_at, i.added_at));
        due.truncate(limit);

        if due.is_empty() {
            return Ok(due);
        }

        let lease_until = now.saturating_add(LEASE.as_millis() as i64);
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(OUTBOX_ITEMS)?;
            for item in &due {
                let mut leased = item.clone();
                leased.next_attempt_at = lease_until;
                let json = serde_json::to_vec(&leased)?;
                let key = item.id.to_string();
                table.insert(key.as_str(), json.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(due)
    }

    pub fn items_for_file(&self, file: &InternalDriveFileId) -> OutboxResult<Vec<OutboxItem>> {
        Ok(self.all()?.into_iter().filter(|i| &i.file == file).collect())
    }

    /// Remove an item. Returns whether it was present.
    pub fn remove(&self, id: Uuid) -> OutboxResult<bool> {
        let key = id.to_string();
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(OUTBOX_ITEMS)?;
            let removed = table.remove(key.as_str())?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    pub fn mark_complete(&self, id: Uuid) -> OutboxResult<()> {
        if !self.remove(id)? {
            return Err(OutboxError::NotFound(id));
        }
        Ok(())
    }

    /// Count a failed attempt and either reschedule with backoff or drop
    /// the item once the attempts are spent.
    pub fn record_failure(&self, id: Uuid, error: &str, now: i64) -> OutboxResult<FailureOutcome> {
        let key = id.to_string();
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut table = write_txn.open_table(OUTBOX_ITEMS)?;
            let mut item: OutboxItem = match table.get(key.as_str())? {
                Some(value) => serde_json::from_slice(value.value())?,
                None => return Err(OutboxError::NotFound(id)),
            };

            item.attempt_count = item.attempt_count.saturating_add(1);
            item.last_error = Some(error.to_string());

            if item.attempt_count >= self.policy.max_attempts {
                table.remove(key.as_str())?;
                FailureOutcome::Dropped
            } else {
                let delay = self.policy.backoff(item.attempt_count);
                item.next_attempt_at = now.saturating_add(delay.as_millis() as i64);
                let json = serde_json::to_vec(&item)?;
                table.insert(key.as_str(), json.as_slice())?;
                FailureOutcome::Rescheduled {
                    attempt: item.attempt_count,
                    next_attempt_at: item.next_attempt_at,
                }
            }
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    pub fn len(&self) -> OutboxResult<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OUTBOX_ITEMS)?;
        Ok(table.len()? as usize)
    }

    pub fn is_empty(&self) -> OutboxResult<bool> {
        Ok(self.len()? == 0)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_outbox(policy: RetryPolicy) -> (Outbox, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let outbox = Outbox::open(&dir.path().join("outbox.redb"), policy).unwrap();
        (outbox, dir)
    }

    fn item(recipient: &str) -> OutboxItem {
        OutboxItem::new(
            InternalDriveFileId::new(Uuid::new_v4(), Uuid::new_v4()),
            recipient.parse().unwrap(),
            OutboxWork::SendFile {
                remote_target_drive: None,
                remote_global_transit_id: None,
                send_contents: SendContents::ALL,
                file_system_type: FileSystemType::Standard,
                app_notification: None,
            },
            false,
        )
    }

    #[test]
    fn add_get_complete() {
        let (outbox, _dir) = temp_outbox(RetryPolicy::default());
        let item = item("sam.dotyou.cloud");
        outbox.add(&item).unwrap();

        assert_eq!(outbox.get(item.id).unwrap().unwrap(), item);
        assert_eq!(outbox.len().unwrap(), 1);

        outbox.mark_complete(item.id).unwrap();
        assert!(outbox.is_empty().unwrap());
        assert!(matches!(outbox.mark_complete(item.id), Err(OutboxError::NotFound(_))));
    }

    #[test]
    fn due_items_are_leased() {
        let (outbox, _dir) = temp_outbox(RetryPolicy::default());
        let first = item("sam.dotyou.cloud");
        outbox.add(&first).unwrap();

        let now = unix_millis_now();
        let due = outbox.due_items(now, 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, first.id);

        assert!(outbox.due_items(now, 10).unwrap().is_empty());
        assert_eq!(outbox.len().unwrap(), 1);
    }

    #[test]
    fn failures_back_off_then_drop() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        let (outbox, _dir) = temp_outbox(policy);
        let item = item("sam.dotyou.cloud");
        outbox.add(&item).unwrap();

        let now = 1_000_000;
        assert_eq!(
            outbox.record_failure(item.id, "timeout", now).unwrap(),
            FailureOutcome::Rescheduled {
                attempt: 1,
                next_attempt_at: now + 5_000
            }
        );
        assert_eq!(
            outbox.record_failure(item.id, "timeout", now).unwrap(),
            FailureOutcome::Rescheduled {
                attempt: 2,
                next_attempt_at: now + 10_000
            }
        );
        let stored = outbox.get(item.id).unwrap().unwrap();
        assert_eq!(stored.last_error.as_deref(), Some("timeout"));

        assert_eq!(outbox.record_failure(item.id, "timeout", now).unwrap(), FailureOutcome::Dropped);
        assert!(outbox.get(item.id).unwrap().is_none());
    }

    #[test]
    fn leased_items_wait_until_released() {
        let (outbox, _dir) = temp_outbox(RetryPolicy::default());
        let first = item("sam.dotyou.cloud");
        let now = unix_millis_now();
        outbox.add_leased(&first, now).unwrap();

        assert_eq!(outbox.len().unwrap(), 1);
        assert!(outbox.due_items(now, 10).unwrap().is_empty());
        let after_lease = now + LEASE.as_millis() as i64;
        assert_eq!(outbox.due_items(after_lease, 10).unwrap().len(), 1);

        let other = item("merry.dotyou.cloud");
        outbox.add_leased(&other, now).unwrap();
        assert!(outbox.release(other.id, now).unwrap());
        let due = outbox.due_items(now, 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, other.id);
        assert!(!outbox.release(Uuid::new_v4(), now).unwrap());
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(5));
        assert_eq!(policy.backoff(3), Duration::from_secs(20));
        assert_eq!(policy.backoff(29), Duration::from_secs(3600));
    }

    #[test]
    fn items_survive_reopen_and_are_found_by_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.redb");
        let first = item("sam.dotyou.cloud");
        {
            let outbox = Outbox::open(&path, RetryPolicy::default()).unwrap();
            outbox.add(&first).unwrap();
            outbox.add(&item("merry.dotyou.cloud")).unwrap();
        }
        let outbox = Outbox::open(&path, RetryPolicy::default()).unwrap();
        let for_file = outbox.items_for_file(&first.file).unwrap();
        assert_eq!(for_file.len(), 1);
        assert_eq!(for_file[0].recipient, first.recipient);
    }
}
