//! # Transaction Log
//!
//! The coordinator's only crash-recovery source, kept behind the
//! [`TransactionLog`] trait so the storage medium can change without the
//! coordinator noticing.
//!
//! Two backends:
//!
//! | Backend       | Storage                       | Survives restart |
//! |---------------|-------------------------------|------------------|
//! | [`MemoryLog`] | `DashMap<key, record>`        | no               |
//! | [`SledLog`]   | sled tree `transactions`, bincode values | yes   |
//!
//! Both enforce the same rules: `insert` is insert-if-absent, so the
//! replay guard is atomic even across identities, and `transition` only
//! ever moves a PENDING record to a terminal status.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sled::{Db, Tree};
use std::path::Path;
use thiserror::Error;

use crate::idempotency::TransactionKey;
use crate::record::{TransactionRecord, TransactionStatus, Transition};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from a transaction log backend.
#[derive(Debug, Error)]
pub enum LogError {
    /// A record with this key already exists.
    #[error("duplicate transaction key {0}")]
    Duplicate(TransactionKey),

    /// No record with this key.
    #[error("unknown transaction key {0}")]
    NotFound(TransactionKey),

    /// The record already reached a terminal status.
    #[error("transaction {key} is already {status}")]
    AlreadyTerminal {
        /// The record's key.
        key: TransactionKey,
        /// Its current status.
        status: TransactionStatus,
    },

    /// Transitions must target a terminal status.
    #[error("cannot transition {key} to non-terminal status {status}")]
    NonTerminalTarget {
        /// The record's key.
        key: TransactionKey,
        /// Requested status.
        status: TransactionStatus,
    },

    /// The durable store failed.
    #[error("sled error: {0}")]
    Storage(#[from] sled::Error),

    /// A stored record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Convenience alias.
pub type LogResult<T> = Result<T, LogError>;

// ---------------------------------------------------------------------------
// TransactionLog
// ---------------------------------------------------------------------------

/// Append/update store for transaction records, safe for concurrent use.
pub trait TransactionLog: Send + Sync {
    /// Stores a new record.
    ///
    /// # Errors
    ///
    /// [`LogError::Duplicate`] if the key is already present.
    fn insert(&self, record: TransactionRecord) -> LogResult<()>;

    /// Looks up a record.
    fn get(&self, key: &TransactionKey) -> LogResult<Option<TransactionRecord>>;

    /// Returns `true` if the key has been used.
    fn contains(&self, key: &TransactionKey) -> LogResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Moves a PENDING record to a terminal status, returning the result.
    ///
    /// # Errors
    ///
    /// [`LogError::AlreadyTerminal`] if the record already left PENDING,
    /// [`LogError::NonTerminalTarget`] for a transition to PENDING.
    fn transition(&self, key: &TransactionKey, transition: Transition) -> LogResult<TransactionRecord>;

    /// Records the escrowed value and a note on a record that stays
    /// PENDING, returning the result.
    ///
    /// # Errors
    ///
    /// [`LogError::AlreadyTerminal`] if the record already left PENDING.
    fn annotate(&self, key: &TransactionKey, escrowed_value: u64, detail: &str) -> LogResult<TransactionRecord>;

    /// Every record still PENDING.
    fn pending(&self) -> LogResult<Vec<TransactionRecord>> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|r| r.status == TransactionStatus::Pending)
            .collect())
    }

    /// Every record, oldest first.
    fn records(&self) -> LogResult<Vec<TransactionRecord>>;

    /// Removes terminal records last updated before `cutoff`. PENDING
    /// records are never evicted.
    fn evict_terminal_before(&self, cutoff: DateTime<Utc>) -> LogResult<usize>;

    /// Number of stored records.
    fn len(&self) -> usize;

    /// Returns `true` if no records are stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn check_transition(record: &TransactionRecord, transition: &Transition) -> LogResult<()> {
    if !transition.status.is_terminal() {
        return Err(LogError::NonTerminalTarget {
            key: record.key.clone(),
            status: transition.status,
        });
    }
    if record.is_terminal() {
        return Err(LogError::AlreadyTerminal {
            key: record.key.clone(),
            status: record.status,
        });
    }
    Ok(())
}

fn annotate_pending(record: &mut TransactionRecord, escrowed_value: u64, detail: &str) -> LogResult<()> {
    if record.is_terminal() {
        return Err(LogError::AlreadyTerminal {
            key: record.key.clone(),
            status: record.status,
        });
    }
    record.escrowed_value = escrowed_value;
    record.detail = Some(detail.to_string());
    record.updated_at = Utc::now();
    Ok(())
}

fn is_evictable(record: &TransactionRecord, cutoff: DateTime<Utc>) -> bool {
    record.is_terminal() && record.updated_at < cutoff
}

// ---------------------------------------------------------------------------
// MemoryLog
// ---------------------------------------------------------------------------

/// Process-local log. Lost on restart.
#[derive(Debug, Default)]
pub struct MemoryLog {
    records: DashMap<TransactionKey, TransactionRecord>,
}

impl MemoryLog {
    /// An empty log.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransactionLog for MemoryLog {
    fn insert(&self, record: TransactionRecord) -> LogResult<()> {
        match self.records.entry(record.key.clone()) {
            Entry::Occupied(_) => Err(LogError::Duplicate(record.key)),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    fn get(&self, key: &TransactionKey) -> LogResult<Option<TransactionRecord>> {
        Ok(self.records.get(key).map(|r| r.clone()))
    }

    fn transition(&self, key: &TransactionKey, transition: Transition) -> LogResult<TransactionRecord> {
        let mut record = self
            .records
            .get_mut(key)
            .ok_or_else(|| LogError::NotFound(key.clone()))?;
        check_transition(&record, &transition)?;
        transition.apply(&mut record);
        Ok(record.clone())
    }

    fn annotate(&self, key: &TransactionKey, escrowed_value: u64, detail: &str) -> LogResult<TransactionRecord> {
        let mut record = self
            .records
            .get_mut(key)
            .ok_or_else(|| LogError::NotFound(key.clone()))?;
        annotate_pending(&mut record, escrowed_value, detail)?;
        Ok(record.clone())
    }

    fn records(&self) -> LogResult<Vec<TransactionRecord>> {
        let mut all: Vec<TransactionRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        all.sort_by_key(|r| r.created_at);
        Ok(all)
    }

    fn evict_terminal_before(&self, cutoff: DateTime<Utc>) -> LogResult<usize> {
        let before = self.records.len();
        self.records.retain(|_, r| !is_evictable(r, cutoff));
        Ok(before.saturating_sub(self.records.len()))
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

// ---------------------------------------------------------------------------
// SledLog
// ---------------------------------------------------------------------------

/// Durable log in a sled tree named `transactions`.
///
/// Keys are the transaction key bytes; values are bincode-encoded records.
/// Every write is followed by a flush so a PENDING record is on disk
/// before the coordinator mutates anything.
#[derive(Debug, Clone)]
pub struct SledLog {
    db: Db,
    tree: Tree,
}

impl SledLog {
    /// Opens or creates a log under `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> LogResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// A log that lives in a temp directory and is removed on drop.
    pub fn open_temporary() -> LogResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> LogResult<Self> {
        let tree = db.open_tree("transactions")?;
        Ok(Self { db, tree })
    }

    /// Forces all pending writes to disk.
    pub fn flush(&self) -> LogResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn encode(record: &TransactionRecord) -> LogResult<Vec<u8>> {
        bincode::serialize(record).map_err(|e| LogError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> LogResult<TransactionRecord> {
        bincode::deserialize(bytes).map_err(|e| LogError::Serialization(e.to_string()))
    }
}

impl TransactionLog for SledLog {
    fn insert(&self, record: TransactionRecord) -> LogResult<()> {
        let bytes = Self::encode(&record)?;
        let swapped = self
            .tree
            .compare_and_swap(record.key.as_bytes(), None as Option<&[u8]>, Some(bytes))?;
        if swapped.is_err() {
            return Err(LogError::Duplicate(record.key));
        }
        self.tree.flush()?;
        Ok(())
    }

    fn get(&self, key: &TransactionKey) -> LogResult<Option<TransactionRecord>> {
        match self.tree.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn contains(&self, key: &TransactionKey) -> LogResult<bool> {
        Ok(self.tree.contains_key(key.as_bytes())?)
    }

    fn transition(&self, key: &TransactionKey, transition: Transition) -> LogResult<TransactionRecord> {
        loop {
            let current = self
                .tree
                .get(key.as_bytes())?
                .ok_or_else(|| LogError::NotFound(key.clone()))?;
            let mut record = Self::decode(&current)?;
            check_transition(&record, &transition)?;
            transition.apply(&mut record);

            let swapped =
                self.tree
                    .compare_and_swap(key.as_bytes(), Some(&current), Some(Self::encode(&record)?))?;
            if swapped.is_ok() {
                self.tree.flush()?;
                return Ok(record);
            }
            // Lost a race with another writer; re-read and re-check.
        }
    }

    fn annotate(&self, key: &TransactionKey, escrowed_value: u64, detail: &str) -> LogResult<TransactionRecord> {
        loop {
            let current = self
                .tree
                .get(key.as_bytes())?
                .ok_or_else(|| LogError::NotFound(key.clone()))?;
            let mut record = Self::decode(&current)?;
            annotate_pending(&mut record, escrowed_value, detail)?;

            let swapped =
                self.tree
                    .compare_and_swap(key.as_bytes(), Some(&current), Some(Self::encode(&record)?))?;
            if swapped.is_ok() {
                self.tree.flush()?;
                return Ok(record);
            }
        }
    }

    fn records(&self) -> LogResult<Vec<TransactionRecord>> {
        let mut all = Vec::with_capacity(self.tree.len());
        for entry in self.tree.iter() {
            let (_key, value) = entry?;
            all.push(Self::decode(&value)?);
        }
        all.sort_by_key(|r| r.created_at);
        Ok(all)
    }

    fn evict_terminal_before(&self, cutoff: DateTime<Utc>) -> LogResult<usize> {
        let mut evicted = 0;
        for entry in self.tree.iter() {
            let (key, value) = entry?;
            if is_evictable(&Self::decode(&value)?, cutoff) {
                self.tree.remove(key)?;
                evicted += 1;
            }
        }
        self.tree.flush()?;
        Ok(evicted)
    }

    fn len(&self) -> usize {
        self.tree.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
