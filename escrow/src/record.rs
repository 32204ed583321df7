//! # Transaction Records
//!
//! One [`TransactionRecord`] per attempt, keyed by its [`TransactionKey`].
//! A record is written PENDING before the first mutation and moves exactly
//! once to a terminal [`TransactionStatus`]. Attempts rejected before any
//! mutation are written directly in the REJECTED state so the key is still
//! burned.

use chrono::{DateTime, Utc};
use coinvault_coins::{DenominationId, Identity};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::idempotency::TransactionKey;

// ---------------------------------------------------------------------------
// Kind & Status
// ---------------------------------------------------------------------------

/// What a transaction moves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Wallet coins into the ledger.
    Deposit,
    /// Ledger balance into wallet coins.
    Withdraw,
    /// One denomination into another, escrowed through the ledger.
    Exchange,
}

impl TransactionKind {
    /// Prefix used in derived keys.
    pub fn key_prefix(&self) -> &'static str {
        match self {
            TransactionKind::Deposit => "D",
            TransactionKind::Withdraw => "W",
            TransactionKind::Exchange => "X",
        }
    }

    /// Lowercase label, used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Deposit => "deposit",
            TransactionKind::Withdraw => "withdraw",
            TransactionKind::Exchange => "exchange",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Intent logged; mutations may be in flight.
    Pending,
    /// Every step succeeded.
    Committed,
    /// Deposit moved less than requested; the measured amount was credited.
    PartialCommit,
    /// Delivery failed after escrow; the value is in the ledger.
    RolledBackToLedger,
    /// Nothing moved.
    Rejected,
    /// Found PENDING at startup and relabeled.
    RecoveredToLedger,
}

impl TransactionStatus {
    /// Every status except `Pending`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }

    /// Uppercase label, used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Committed => "COMMITTED",
            TransactionStatus::PartialCommit => "PARTIAL_COMMIT",
            TransactionStatus::RolledBackToLedger => "ROLLED_BACK_TO_LEDGER",
            TransactionStatus::Rejected => "REJECTED",
            TransactionStatus::RecoveredToLedger => "RECOVERED_TO_LEDGER",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TransactionRecord
// ---------------------------------------------------------------------------

/// Log entry for one transaction attempt.
///
/// No field is skipped during serialization; the durable log encodes
/// records with bincode, which needs every field present.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Idempotency key.
    pub key: TransactionKey,
    /// Owner of the wallet and ledger balance.
    pub identity: Identity,
    /// Deposit, withdraw or exchange.
    pub kind: TransactionKind,
    /// Current state.
    pub status: TransactionStatus,
    /// Source denomination (exchange only).
    pub source: Option<DenominationId>,
    /// Source units for exchange, requested value otherwise.
    pub source_amount: u64,
    /// Destination denomination (exchange only).
    pub destination: Option<DenominationId>,
    /// Destination units for exchange, requested value otherwise.
    pub destination_amount: u64,
    /// Value placed in (or moved through) the ledger.
    pub escrowed_value: u64,
    /// Error or note attached at the terminal transition.
    pub detail: Option<String>,
    /// When the record was first written.
    pub created_at: DateTime<Utc>,
    /// When the status last changed.
    pub updated_at: DateTime<Utc>,
}

impl TransactionRecord {
    /// A fresh PENDING record with no amounts set.
    pub fn pending(key: TransactionKey, identity: Identity, kind: TransactionKind) -> Self {
        let now = Utc::now();
        Self {
            key,
            identity,
            kind,
            status: TransactionStatus::Pending,
            source: None,
            source_amount: 0,
            destination: None,
            destination_amount: 0,
            escrowed_value: 0,
            detail: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the source side.
    pub fn with_source(mut self, denomination: Option<DenominationId>, amount: u64) -> Self {
        self.source = denomination;
        self.source_amount = amount;
        self
    }

    /// Sets the destination side.
    pub fn with_destination(mut self, denomination: Option<DenominationId>, amount: u64) -> Self {
        self.destination = denomination;
        self.destination_amount = amount;
        self
    }

    /// Sets the escrowed value.
    pub fn with_escrow(mut self, value: u64) -> Self {
        self.escrowed_value = value;
        self
    }

    /// Turns the record into a REJECTED one carrying `detail`.
    pub fn into_rejected(mut self, detail: impl Into<String>) -> Self {
        self.status = TransactionStatus::Rejected;
        self.detail = Some(detail.into());
        self
    }

    /// Returns `true` once the record has left PENDING.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Update applied by a terminal transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    /// Target status. Must be terminal.
    pub status: TransactionStatus,
    /// Replaces the record's escrowed value when set.
    pub escrowed_value: Option<u64>,
    /// Replaces the record's detail when set.
    pub detail: Option<String>,
}

impl Transition {
    /// Transition to `status` with no other changes.
    pub fn to(status: TransactionStatus) -> Self {
        Self {
            status,
            escrowed_value: None,
            detail: None,
        }
    }

    /// Also records the escrowed value.
    pub fn escrowed(mut self, value: u64) -> Self {
        self.escrowed_value = Some(value);
        self
    }

    /// Also records a detail message.
    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Applies this transition to `record`.
    pub(crate) fn apply(&self, record: &mut TransactionRecord) {
        record.status = self.status;
        if let Some(value) = self.escrowed_value {
            record.escrowed_value = value;
        }
        if let Some(detail) = &self.detail {
            record.detail = Some(detail.clone());
        }
        record.updated_at = Utc::now();
    }
}
