// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # CoinVault Escrow: Transaction Coordinator
//!
//! Moves value between a player's coin wallet and the external ledger
//! without ever losing it. Every transaction is a short protocol over three
//! systems that cannot be updated atomically together: the wallet's
//! containers, the ledger, and the transaction log. The coordinator orders
//! the steps so that at every instant the value is accounted for in at least
//! one of them.
//!
//! ## Architecture
//!
//! ```text
//! coordinator.rs: deposit / withdraw / exchange protocols
//! record.rs     : transaction kinds, statuses and log records
//! idempotency.rs: transaction keys
//! journal.rs    : transaction log trait, in-memory and sled backends
//! locks.rs      : per-identity locks and the idle-lock sweeper
//! outcome.rs    : error taxonomy, caller-facing results and messages
//! recovery.rs   : startup relabeling of interrupted transactions
//! ```
//!
//! ## Design Principles
//!
//! 1. **Escrow before delivery.** Value leaves the wallet only into the
//!    ledger; it leaves the ledger only after capacity was re-checked.
//! 2. **One transaction per identity at a time.** Different identities run
//!    in parallel.
//! 3. **Every attempt is recorded**, rejections included, under a key that
//!    cannot be replayed.
//! 4. **Failures are statuses, not panics.** Callers get a
//!    [`TransactionResult`] that says whether the money is safe.

pub mod coordinator;
pub mod idempotency;
pub mod journal;
pub mod locks;
pub mod outcome;
pub mod record;
pub mod recovery;

pub use coordinator::{EscrowConfig, EscrowCoordinator};
pub use idempotency::TransactionKey;
pub use journal::{LogError, LogResult, MemoryLog, SledLog, TransactionLog};
pub use locks::{IdentityGuard, IdentityLocks, LockSweeper};
pub use outcome::{format_value, TransactionError, TransactionResult};
pub use record::{TransactionKind, TransactionRecord, TransactionStatus, Transition};
pub use recovery::{recover_pending, RecoveryReport};
