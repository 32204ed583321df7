//! # Transaction Outcomes
//!
//! What the coordinator hands back to callers. The contract every UI or
//! command layer builds on is the triple `(success, money_safe, message)`
//! plus the idempotency key:
//!
//! | success | money_safe | Meaning                                        |
//! |---------|------------|------------------------------------------------|
//! | true    | true       | committed (fully or partially)                 |
//! | false   | true       | rejected, or rolled back with value in the bank |
//! | false   | false      | compensation failed; operator attention needed |
//!
//! Each terminal status has its own message template. Values in messages
//! are shortened with [`format_value`].

use coinvault_coins::{EngineError, LedgerError};
use thiserror::Error;

use crate::idempotency::TransactionKey;
use crate::journal::LogError;
use crate::record::{TransactionKind, TransactionStatus};

// ---------------------------------------------------------------------------
// TransactionError
// ---------------------------------------------------------------------------

/// Why a transaction did not commit.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransactionError {
    /// Zero or otherwise unusable amount.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Source and destination denomination are the same.
    #[error("cannot exchange {0} for itself")]
    SameDenomination(String),

    /// The denomination is not configured.
    #[error("unknown denomination {0}")]
    UnknownDenomination(String),

    /// The source is worth less than one destination coin.
    #[error("need at least {needed} {source_name} to get one {destination_name}")]
    BelowMinimum {
        /// Minimum source units.
        needed: u64,
        /// Source display name.
        source_name: String,
        /// Destination display name.
        destination_name: String,
    },

    /// Wallet value, source units or ledger balance too low.
    #[error("insufficient funds: have {available}, need {requested}")]
    InsufficientFunds {
        /// What was found.
        available: u64,
        /// What was needed.
        requested: u64,
    },

    /// The destination container lacks room.
    #[error("not enough space: {needed} slot(s) needed, {available} free")]
    InsufficientCapacity {
        /// Slots the delivery needs.
        needed: usize,
        /// Slots currently free.
        available: usize,
    },

    /// The idempotency key was already used.
    #[error("duplicate transaction {0}")]
    DuplicateTransaction(TransactionKey),

    /// Result exceeds the sanity ceiling or overflows.
    #[error("amount too large")]
    OverflowGuard,

    /// Delivery failed after escrow was placed.
    #[error("delivery failed: {0}")]
    DeliveryFailure(String),

    /// A ledger call failed.
    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(String),

    /// The transaction log failed.
    #[error("transaction log error: {0}")]
    Log(String),
}

impl From<LedgerError> for TransactionError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientBalance { available, requested } => {
                TransactionError::InsufficientFunds { available, requested }
            }
            LedgerError::Overflow { .. } => TransactionError::OverflowGuard,
            other => TransactionError::LedgerUnavailable(other.to_string()),
        }
    }
}

impl From<LogError> for TransactionError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::Duplicate(key) => TransactionError::DuplicateTransaction(key),
            other => TransactionError::Log(other.to_string()),
        }
    }
}

impl From<EngineError> for TransactionError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InsufficientFunds { available, requested }
            | EngineError::InsufficientUnits { available, requested, .. } => {
                TransactionError::InsufficientFunds { available, requested }
            }
            EngineError::UnknownDenomination(id) => TransactionError::UnknownDenomination(id.to_string()),
            EngineError::Overflow => TransactionError::OverflowGuard,
            other => TransactionError::DeliveryFailure(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// TransactionResult
// ---------------------------------------------------------------------------

/// Caller-facing result of one transaction attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionResult {
    /// The transaction did what was asked (possibly partially).
    pub success: bool,
    /// No value was lost, whatever happened.
    pub money_safe: bool,
    /// Player-facing message.
    pub message: String,
    /// Key of the attempt, if one was assigned.
    pub key: Option<TransactionKey>,
    /// Deposit, withdraw or exchange.
    pub kind: TransactionKind,
    /// Status the record ended in (`Pending` if compensation failed).
    pub status: TransactionStatus,
    /// Value that moved through the ledger.
    pub escrowed_value: u64,
    /// Error behind a non-committed outcome.
    pub error: Option<TransactionError>,
}

impl TransactionResult {
    /// Committed (or partially committed) transaction.
    pub fn committed(
        key: TransactionKey,
        kind: TransactionKind,
        status: TransactionStatus,
        escrowed_value: u64,
        message: String,
    ) -> Self {
        Self {
            success: true,
            money_safe: true,
            message,
            key: Some(key),
            kind,
            status,
            escrowed_value,
            error: None,
        }
    }

    /// Nothing moved.
    pub fn rejected(key: Option<TransactionKey>, kind: TransactionKind, error: TransactionError) -> Self {
        Self {
            success: false,
            money_safe: true,
            message: rejected_message(&error),
            key,
            kind,
            status: TransactionStatus::Rejected,
            escrowed_value: 0,
            error: Some(error),
        }
    }

    /// Did not complete, but the value is in the ledger.
    pub fn rolled_back(
        key: TransactionKey,
        kind: TransactionKind,
        value_in_ledger: u64,
        error: TransactionError,
    ) -> Self {
        Self {
            success: false,
            money_safe: true,
            message: rolled_back_message(kind, value_in_ledger, &error),
            key: Some(key),
            kind,
            status: TransactionStatus::RolledBackToLedger,
            escrowed_value: value_in_ledger,
            error: Some(error),
        }
    }

    /// Compensation failed; `at_risk` value is unaccounted for.
    pub fn unsafe_failure(key: TransactionKey, kind: TransactionKind, at_risk: u64, error: TransactionError) -> Self {
        Self {
            success: false,
            money_safe: false,
            message: format!(
                "The {kind} failed and {} could not be returned automatically. Contact an operator with reference {key}.",
                format_value(at_risk)
            ),
            key: Some(key),
            kind,
            status: TransactionStatus::Pending,
            escrowed_value: at_risk,
            error: Some(error),
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Shortens large values: `999`, `1.2K`, `3.45M`.
///
/// Rounds half up in integer arithmetic and picks the unit after rounding,
/// so `999_999` reads `1.00M` rather than `1000.0K`.
pub fn format_value(value: u64) -> String {
    if value < 1_000 {
        return value.to_string();
    }
    // (v / (d/2) + 1) / 2 rounds v / d half up without overflowing.
    let tenths_of_k = (value / 50 + 1) / 2;
    if tenths_of_k < 10_000 {
        return format!("{}.{}K", tenths_of_k / 10, tenths_of_k % 10);
    }
    let hundredths_of_m = (value / 5_000 + 1) / 2;
    format!("{}.{:02}M", hundredths_of_m / 100, hundredths_of_m % 100)
}

/// Message for a committed deposit.
pub fn deposit_message(moved: u64, requested: u64) -> String {
    if moved < requested {
        format!(
            "Deposited {} to your bank (partial, {} requested).",
            format_value(moved),
            format_value(requested)
        )
    } else {
        format!("Deposited {} to your bank.", format_value(moved))
    }
}

/// Message for a committed withdrawal.
pub fn withdraw_message(amount: u64) -> String {
    format!("Withdrew {} from your bank.", format_value(amount))
}

/// Message for a committed exchange. `left_over` source units were not
/// needed and stay in the wallet.
pub fn exchange_message(used: u64, source: &str, produced: u64, destination: &str, left_over: u64) -> String {
    let mut message = format!("Exchanged {used} {source} for {produced} {destination}.");
    if left_over > 0 {
        message.push_str(&format!(" {left_over} {source} were not needed and stay in your wallet."));
    }
    message
}

fn rejected_message(error: &TransactionError) -> String {
    match error {
        TransactionError::DuplicateTransaction(key) => {
            format!("Transaction {key} was already processed.")
        }
        TransactionError::InsufficientCapacity { needed, available } => format!(
            "Not enough inventory space: {needed} slot(s) needed, {available} free."
        ),
        TransactionError::BelowMinimum { .. } => {
            let text = error.to_string();
            let mut chars = text.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>() + ".",
                None => text,
            }
        }
        other => format!("Transaction rejected: {other}."),
    }
}

fn rolled_back_message(kind: TransactionKind, value: u64, error: &TransactionError) -> String {
    match error {
        TransactionError::InsufficientCapacity { .. } => format!(
            "No inventory space. Your {} was deposited to your bank instead.",
            format_value(value)
        ),
        _ => format!(
            "The {kind} could not be delivered. Your {} is safe in your bank.",
            format_value(value)
        ),
    }
}
