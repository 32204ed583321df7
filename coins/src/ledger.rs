//! # Ledger Client
//!
//! The bank side of the system: a non-negative balance per identity, held
//! by a service outside the core. [`LedgerClient`] is the contract the escrow
//! coordinator relies on. Each call must be atomic for its identity;
//! `withdraw` must fail rather than drive a balance negative.
//!
//! [`InMemoryLedger`] is the implementation shipped for tests and the
//! simulation host, not a production bank. It keeps an audit journal of the
//! most recent successful mutations (memo included), capped at
//! [`LEDGER_JOURNAL_LIMIT`] entries, and can be switched offline to exercise
//! the coordinator's failure paths.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::config::LEDGER_JOURNAL_LIMIT;
use crate::identity::Identity;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by a ledger backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Withdrawal exceeds the current balance.
    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance {
        /// Balance at the time of the call.
        available: u64,
        /// Amount requested.
        requested: u64,
    },

    /// The backend could not be reached or refused the call.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// The deposit would exceed `u64::MAX`.
    #[error("balance overflow: current {current}, credit {credit}")]
    Overflow {
        /// Balance before the failed credit.
        current: u64,
        /// Amount that caused the overflow.
        credit: u64,
    },
}

// ---------------------------------------------------------------------------
// LedgerClient
// ---------------------------------------------------------------------------

/// Balance store keyed by identity.
pub trait LedgerClient: Send + Sync {
    /// Current balance (0 for unknown identities).
    fn balance(&self, identity: Identity) -> Result<u64, LedgerError>;

    /// Credits `amount`, returning the new balance.
    fn deposit(&self, identity: Identity, amount: u64, memo: &str) -> Result<u64, LedgerError>;

    /// Debits `amount`, returning the new balance.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InsufficientBalance`] if the balance is below `amount`.
    fn withdraw(&self, identity: Identity, amount: u64, memo: &str) -> Result<u64, LedgerError>;
}

impl<L: LedgerClient + ?Sized> LedgerClient for Arc<L> {
    fn balance(&self, identity: Identity) -> Result<u64, LedgerError> {
        (**self).balance(identity)
    }

    fn deposit(&self, identity: Identity, amount: u64, memo: &str) -> Result<u64, LedgerError> {
        (**self).deposit(identity, amount, memo)
    }

    fn withdraw(&self, identity: Identity, amount: u64, memo: &str) -> Result<u64, LedgerError> {
        (**self).withdraw(identity, amount, memo)
    }
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

/// Direction of a ledger mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerOp {
    /// Balance increased.
    Deposit,
    /// Balance decreased.
    Withdraw,
}

impl fmt::Display for LedgerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerOp::Deposit => write!(f, "deposit"),
            LedgerOp::Withdraw => write!(f, "withdraw"),
        }
    }
}

/// One successful ledger mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Account mutated.
    pub identity: Identity,
    /// Direction.
    pub op: LedgerOp,
    /// Amount moved.
    pub amount: u64,
    /// Caller-supplied tag, e.g. `TX_ESCROW:<key>`.
    pub memo: String,
    /// Balance after the mutation.
    pub balance_after: u64,
    /// When the mutation happened.
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// InMemoryLedger
// ---------------------------------------------------------------------------

/// Process-local ledger backed by a `DashMap`.
///
/// Per-identity atomicity comes from the map's shard locks. The journal
/// is a ring: once full, each new entry evicts the oldest.
#[derive(Debug)]
pub struct InMemoryLedger {
    balances: DashMap<Identity, u64>,
    journal: Mutex<VecDeque<LedgerEntry>>,
    journal_limit: usize,
    available: AtomicBool,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    /// An empty, online ledger.
    pub fn new() -> Self {
        Self::with_journal_limit(LEDGER_JOURNAL_LIMIT)
    }

    /// An empty ledger that keeps at most `limit` journal entries.
    pub fn with_journal_limit(limit: usize) -> Self {
        Self {
            balances: DashMap::new(),
            journal: Mutex::new(VecDeque::new()),
            journal_limit: limit,
            available: AtomicBool::new(true),
        }
    }

    /// Overwrites a balance without journaling. For seeding.
    pub fn set_balance(&self, identity: Identity, amount: u64) {
        self.balances.insert(identity, amount);
    }

    /// Takes the ledger offline (`false`) or back online (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Copy of the audit journal, oldest first.
    pub fn journal(&self) -> Vec<LedgerEntry> {
        self.journal.lock().iter().cloned().collect()
    }

    /// Journal entries whose memo starts with `prefix`.
    pub fn entries_tagged(&self, prefix: &str) -> Vec<LedgerEntry> {
        self.journal
            .lock()
            .iter()
            .filter(|e| e.memo.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn check_available(&self) -> Result<(), LedgerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LedgerError::Unavailable("ledger is offline".into()))
        }
    }

    fn record(&self, identity: Identity, op: LedgerOp, amount: u64, memo: &str, balance_after: u64) {
        tracing::debug!(%identity, %op, amount, memo, balance_after, "ledger mutation");
        let mut journal = self.journal.lock();
        if self.journal_limit == 0 {
            return;
        }
        while journal.len() >= self.journal_limit {
            journal.pop_front();
        }
        journal.push_back(LedgerEntry {
            identity,
            op,
            amount,
            memo: memo.to_string(),
            balance_after,
            at: Utc::now(),
        });
    }
}

impl LedgerClient for InMemoryLedger {
    fn balance(&self, identity: Identity) -> Result<u64, LedgerError> {
        self.check_available()?;
        Ok(self.balances.get(&identity).map(|b| *b).unwrap_or(0))
    }

    fn deposit(&self, identity: Identity, amount: u64, memo: &str) -> Result<u64, LedgerError> {
        self.check_available()?;
        let mut balance = self.balances.entry(identity).or_insert(0);
        let new_balance = balance.checked_add(amount).ok_or(LedgerError::Overflow {
            current: *balance,
            credit: amount,
        })?;
        *balance = new_balance;
        drop(balance);
        self.record(identity, LedgerOp::Deposit, amount, memo, new_balance);
        Ok(new_balance)
    }

    fn withdraw(&self, identity: Identity, amount: u64, memo: &str) -> Result<u64, LedgerError> {
        self.check_available()?;
        let mut balance = self.balances.entry(identity).or_insert(0);
        let new_balance = balance
            .checked_sub(amount)
            .ok_or(LedgerError::InsufficientBalance {
                available: *balance,
                requested: amount,
            })?;
        *balance = new_balance;
        drop(balance);
        self.record(identity, LedgerOp::Withdraw, amount, memo, new_balance);
        Ok(new_balance)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
