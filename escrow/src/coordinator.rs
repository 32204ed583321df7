//! # Escrow Transaction Coordinator
//!
//! Moves value between wallet coins and the ledger as multi-step protocols
//! in which every step that could strand value is preceded by a step that
//! parks it in the ledger.
//!
//! ```text
//! PENDING ──all steps ok──────────────────────────▶ COMMITTED
//! PENDING ──fails before anything moved───────────▶ REJECTED
//! PENDING ──delivery fails after escrow───────────▶ ROLLED_BACK_TO_LEDGER
//! PENDING ──removal yields less than asked (dep.)─▶ PARTIAL_COMMIT
//! PENDING ──process died, found at startup────────▶ RECOVERED_TO_LEDGER
//! ```
//!
//! ## Rules every protocol follows
//!
//! 1. The identity lock is taken before the first read that a decision
//!    depends on and released by guard drop on every exit path.
//! 2. The PENDING record is written before the first mutation.
//! 3. Capacity is checked before any mutation and re-checked right before
//!    delivery.
//! 4. Amounts moved into the ledger are measured, never assumed: after a
//!    partial delivery only the undelivered remainder is returned.
//! 5. A failure after escrow never surfaces as a plain error. It resolves to
//!    ROLLED_BACK_TO_LEDGER, or, if even that compensation fails, leaves the
//!    record PENDING and reports `money_safe = false`.
//!
//! ## Ledger memos
//!
//! | Memo                  | Written when                                      |
//! |-----------------------|---------------------------------------------------|
//! | `TX_DEPOSIT:<key>`    | deposit credits the measured wallet decrease      |
//! | `TX_WITHDRAW:<key>`   | withdraw debits the requested amount              |
//! | `TX_ESCROW:<key>`     | exchange parks the consumed source value          |
//! | `TX_COMPLETE:<key>`   | exchange releases the escrow for delivery         |
//! | `TX_FALLBACK:<key>`   | exchange returns undelivered destination value    |
//! | `TX_ROLLBACK:<key>`   | any other compensation credit                     |

use chrono::Utc;
use coinvault_coins::config::{EXCHANGE_RESULT_CEILING, RECORD_RETENTION};
use coinvault_coins::{
    CapacityCalculator, CoinEngine, Denomination, DenominationId, DenominationTable, EngineError, Identity,
    LedgerClient, LedgerError, SpaceReport, Wallet,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::idempotency::TransactionKey;
use crate::journal::{LogResult, TransactionLog};
use crate::locks::{IdentityLocks, LockSweeper};
use crate::outcome::{
    deposit_message, exchange_message, withdraw_message, TransactionError, TransactionResult,
};
use crate::record::{TransactionKind, TransactionRecord, TransactionStatus, Transition};
use crate::recovery::{recover_pending, RecoveryReport};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Tunables of the coordinator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EscrowConfig {
    /// Most destination coins a single exchange may produce.
    pub exchange_ceiling: u64,
    /// How long terminal records are kept by [`EscrowCoordinator::evict_expired`].
    pub retention: Duration,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            exchange_ceiling: EXCHANGE_RESULT_CEILING,
            retention: RECORD_RETENTION,
        }
    }
}

// ---------------------------------------------------------------------------
// EscrowCoordinator
// ---------------------------------------------------------------------------

/// Runs deposit, withdraw and exchange transactions.
///
/// Cheap to share: wrap it in an `Arc` and call it from any thread.
pub struct EscrowCoordinator {
    engine: CoinEngine,
    capacity: CapacityCalculator,
    ledger: Arc<dyn LedgerClient>,
    log: Arc<dyn TransactionLog>,
    locks: Arc<IdentityLocks>,
    config: EscrowConfig,
}

impl fmt::Debug for EscrowCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EscrowCoordinator")
            .field("tiers", &self.engine.table().len())
            .field("records", &self.log.len())
            .field("tracked_locks", &self.locks.len())
            .field("config", &self.config)
            .finish()
    }
}

impl EscrowCoordinator {
    /// Creates a coordinator with the default config.
    pub fn new(
        table: Arc<DenominationTable>,
        ledger: Arc<dyn LedgerClient>,
        log: Arc<dyn TransactionLog>,
    ) -> Self {
        Self {
            engine: CoinEngine::new(Arc::clone(&table)),
            capacity: CapacityCalculator::new(table),
            ledger,
            log,
            locks: Arc::new(IdentityLocks::new()),
            config: EscrowConfig::default(),
        }
    }

    /// Replaces the config.
    pub fn with_config(mut self, config: EscrowConfig) -> Self {
        self.config = config;
        self
    }

    /// The denomination engine.
    pub fn engine(&self) -> &CoinEngine {
        &self.engine
    }

    /// The capacity calculator.
    pub fn capacity(&self) -> &CapacityCalculator {
        &self.capacity
    }

    /// The ledger client.
    pub fn ledger(&self) -> &dyn LedgerClient {
        self.ledger.as_ref()
    }

    /// The transaction log.
    pub fn log(&self) -> &dyn TransactionLog {
        self.log.as_ref()
    }

    /// The identity lock registry.
    pub fn locks(&self) -> &Arc<IdentityLocks> {
        &self.locks
    }

    // -----------------------------------------------------------------------
    // Deposit
    // -----------------------------------------------------------------------

    /// Moves `amount` of wallet coins into the ledger.
    ///
    /// The credited amount is the measured decrease of the wallet's value,
    /// not the requested amount. Less than requested commits as
    /// PARTIAL_COMMIT; more (overshoot change that could not be returned)
    /// is credited in full.
    pub fn deposit(
        &self,
        identity: Identity,
        wallet: &Wallet,
        amount: u64,
        key: Option<TransactionKey>,
    ) -> TransactionResult {
        let kind = TransactionKind::Deposit;
        let key = key.unwrap_or_else(|| TransactionKey::derive(identity, kind, &[&amount.to_string()]));
        if let Some(replay) = self.check_replay(&key, kind) {
            return replay;
        }
        let record = TransactionRecord::pending(key.clone(), identity, kind).with_source(None, amount);
        if amount == 0 {
            return self.reject(record, TransactionError::InvalidAmount("deposit amount must be positive".into()));
        }

        let _guard = self.locks.lock(identity);

        let before = self.engine.total_value(wallet);
        if before < amount {
            return self.reject(
                record,
                TransactionError::InsufficientFunds {
                    available: before,
                    requested: amount,
                },
            );
        }
        if let Err(result) = self.begin(record) {
            return result;
        }

        let taken = self.engine.take(wallet, amount);
        let moved = before.saturating_sub(self.engine.total_value(wallet));
        if moved == 0 {
            let error = match taken {
                Err(e) => TransactionError::from(e),
                Ok(()) => TransactionError::InsufficientFunds {
                    available: 0,
                    requested: amount,
                },
            };
            return self.fail(&key, kind, error);
        }
        if let Err(e) = &taken {
            tracing::warn!(%identity, %key, error = %e, moved, "take reported an error, crediting measured amount");
        }

        if let Err(err) = self.ledger.deposit(identity, moved, &memo("TX_DEPOSIT", &key)) {
            // Nothing reached the ledger: put the coins back.
            let error = TransactionError::from(err);
            return match self.engine.give(wallet, moved) {
                Ok(()) => self.fail(&key, kind, error),
                Err(give_err) => {
                    let at_risk = before.saturating_sub(self.engine.total_value(wallet));
                    self.compensation_failed(&key, kind, identity, at_risk, error, &give_err.to_string())
                }
            };
        }

        let (status, detail) = if moved < amount {
            (
                TransactionStatus::PartialCommit,
                Some(format!("only {moved} of {amount} could be taken from the wallet")),
            )
        } else if moved > amount {
            (
                TransactionStatus::Committed,
                Some(format!("{} change could not be returned and was credited", moved - amount)),
            )
        } else {
            (TransactionStatus::Committed, None)
        };
        let mut transition = Transition::to(status).escrowed(moved);
        if let Some(detail) = detail {
            transition = transition.detail(detail);
        }
        self.finish(&key, transition);

        if status == TransactionStatus::PartialCommit {
            tracing::warn!(%identity, %key, moved, requested = amount, "deposit partially committed");
        } else {
            tracing::info!(%identity, %key, moved, "deposit committed");
        }
        TransactionResult::committed(key, kind, status, moved, deposit_message(moved, amount))
    }

    // -----------------------------------------------------------------------
    // Withdraw
    // -----------------------------------------------------------------------

    /// Moves `amount` from the ledger into wallet coins.
    pub fn withdraw(
        &self,
        identity: Identity,
        wallet: &Wallet,
        amount: u64,
        key: Option<TransactionKey>,
    ) -> TransactionResult {
        let kind = TransactionKind::Withdraw;
        let key = key.unwrap_or_else(|| TransactionKey::derive(identity, kind, &[&amount.to_string()]));
        if let Some(replay) = self.check_replay(&key, kind) {
            return replay;
        }
        let record = TransactionRecord::pending(key.clone(), identity, kind).with_destination(None, amount);
        if amount == 0 {
            return self.reject(record, TransactionError::InvalidAmount("withdraw amount must be positive".into()));
        }

        let _guard = self.locks.lock(identity);

        let balance = match self.ledger.balance(identity) {
            Ok(balance) => balance,
            Err(err) => return self.reject(record, err.into()),
        };
        if balance < amount {
            return self.reject(
                record,
                TransactionError::InsufficientFunds {
                    available: balance,
                    requested: amount,
                },
            );
        }
        let space = self.capacity.can_fit(wallet, amount);
        if !space.fits {
            return self.reject(record, capacity_error(&space));
        }
        if let Err(result) = self.begin(record) {
            return result;
        }

        // Second capacity check. Nothing has moved yet, so failing here is a
        // plain rejection.
        let space = self.capacity.can_fit(wallet, amount);
        if !space.fits {
            return self.fail(&key, kind, capacity_error(&space));
        }

        if let Err(err) = self.ledger.withdraw(identity, amount, &memo("TX_WITHDRAW", &key)) {
            return self.fail(&key, kind, err.into());
        }

        let before = self.engine.total_value(wallet);
        match self.engine.give(wallet, amount) {
            Ok(()) => {
                self.finish(&key, Transition::to(TransactionStatus::Committed).escrowed(amount));
                tracing::info!(%identity, %key, amount, "withdraw committed");
                TransactionResult::committed(key, kind, TransactionStatus::Committed, amount, withdraw_message(amount))
            }
            Err(give_err) => {
                let delivered = self.engine.total_value(wallet).saturating_sub(before).min(amount);
                let undelivered = amount - delivered;
                tracing::error!(
                    %identity, %key, amount, delivered, error = %give_err,
                    "invariant violation: delivery failed after capacity re-check"
                );
                let error = TransactionError::DeliveryFailure(give_err.to_string());
                self.refund(identity, &key, kind, "TX_ROLLBACK", undelivered, error)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Exchange
    // -----------------------------------------------------------------------

    /// Converts `count` coins of `source` into coins of `destination`,
    /// escrowing the consumed value in the ledger while delivery runs.
    ///
    /// Only whole destination coins are produced. Source units that would
    /// only buy a fraction of a destination coin are not taken.
    pub fn exchange(
        &self,
        identity: Identity,
        wallet: &Wallet,
        source: &DenominationId,
        count: u64,
        destination: &DenominationId,
        key: Option<TransactionKey>,
    ) -> TransactionResult {
        let kind = TransactionKind::Exchange;
        let key = key.unwrap_or_else(|| {
            TransactionKey::derive(
                identity,
                kind,
                &[source.as_str(), &count.to_string(), destination.as_str()],
            )
        });
        if let Some(replay) = self.check_replay(&key, kind) {
            return replay;
        }
        let record = TransactionRecord::pending(key.clone(), identity, kind)
            .with_source(Some(source.clone()), count)
            .with_destination(Some(destination.clone()), 0);

        let table = self.engine.table();
        let Some(src) = table.get(source) else {
            return self.reject(record, TransactionError::UnknownDenomination(source.to_string()));
        };
        let Some(dst) = table.get(destination) else {
            return self.reject(record, TransactionError::UnknownDenomination(destination.to_string()));
        };
        if src.id == dst.id {
            return self.reject(record, TransactionError::SameDenomination(src.display_name.clone()));
        }
        if count == 0 {
            return self.reject(record, TransactionError::InvalidAmount("exchange count must be positive".into()));
        }
        let Some(source_value) = src.value_of(count) else {
            return self.reject(record, TransactionError::OverflowGuard);
        };
        if source_value < dst.value {
            return self.reject(
                record,
                TransactionError::BelowMinimum {
                    needed: table.min_units_for(src, dst),
                    source_name: src.display_name.clone(),
                    destination_name: dst.display_name.clone(),
                },
            );
        }
        let produced = source_value / dst.value;
        if produced > self.config.exchange_ceiling {
            return self.reject(record, TransactionError::OverflowGuard);
        }
        // Exact: one tier's value divides the other's.
        let escrow_value = produced * dst.value;
        let used = escrow_value / src.value;
        let left_over = count - used;
        let record = record
            .with_source(Some(src.id.clone()), used)
            .with_destination(Some(dst.id.clone()), produced)
            .with_escrow(escrow_value);

        let _guard = self.locks.lock(identity);

        let held = self.engine.holdings(wallet).count_of(&src.id);
        if held < used {
            return self.reject(
                record,
                TransactionError::InsufficientFunds {
                    available: held,
                    requested: used,
                },
            );
        }
        let space = self.capacity.can_fit_exact(wallet, &dst.id, produced);
        if !space.fits {
            return self.reject(record, capacity_error(&space));
        }
        if let Err(result) = self.begin(record) {
            return result;
        }

        // Remove the source units.
        if let Err(err) = self.engine.take_exact(wallet, &src.id, used) {
            return self.restore_source(identity, wallet, &key, src, held, err.into());
        }

        // Park their value in the ledger. From here on the value is safe.
        if let Err(err) = self.ledger.deposit(identity, escrow_value, &memo("TX_ESCROW", &key)) {
            return self.restore_source(identity, wallet, &key, src, held, err.into());
        }
        tracing::debug!(%identity, %key, escrow_value, "exchange value escrowed");

        let space = self.capacity.can_fit_exact(wallet, &dst.id, produced);
        if !space.fits {
            tracing::warn!(
                %identity, %key, needed = space.new_slots_needed, free = space.free_slots,
                "container changed before delivery, leaving value in ledger"
            );
            return self.roll_back(&key, kind, escrow_value, capacity_error(&space));
        }

        if let Err(err) = self.ledger.withdraw(identity, escrow_value, &memo("TX_COMPLETE", &key)) {
            return self.roll_back(&key, kind, escrow_value, err.into());
        }

        let before = self.engine.holdings(wallet).count_of(&dst.id);
        if let Err(give_err) = self.engine.give_exact(wallet, &dst.id, produced) {
            let delivered = self
                .engine
                .holdings(wallet)
                .count_of(&dst.id)
                .saturating_sub(before)
                .min(produced);
            let undelivered_value = (produced - delivered) * dst.value;
            tracing::error!(
                %identity, %key, produced, delivered, error = %give_err,
                "invariant violation: exact delivery failed after capacity re-check"
            );
            let error = TransactionError::DeliveryFailure(give_err.to_string());
            return self.refund(identity, &key, kind, "TX_FALLBACK", undelivered_value, error);
        }

        let mut transition = Transition::to(TransactionStatus::Committed).escrowed(escrow_value);
        if left_over > 0 {
            transition = transition.detail(format!("{left_over} {} not needed", src.id));
        }
        self.finish(&key, transition);
        tracing::info!(
            %identity, %key, source = %src.id, used, destination = %dst.id, produced,
            "exchange committed"
        );
        let message = exchange_message(used, &src.display_name, produced, &dst.display_name, left_over);
        TransactionResult::committed(key, kind, TransactionStatus::Committed, escrow_value, message)
    }

    // -----------------------------------------------------------------------
    // Wallet Housekeeping & Queries
    // -----------------------------------------------------------------------

    /// Consolidates the wallet under the identity's lock.
    pub fn consolidate(&self, identity: Identity, wallet: &Wallet) -> Result<u64, EngineError> {
        let _guard = self.locks.lock(identity);
        self.engine.consolidate(wallet)
    }

    /// Wallet value plus ledger balance, read under the identity's lock so
    /// no in-flight escrow is counted twice or missed.
    pub fn total_wealth(&self, identity: Identity, wallet: &Wallet) -> Result<u64, LedgerError> {
        let _guard = self.locks.lock(identity);
        let balance = self.ledger.balance(identity)?;
        Ok(self.engine.total_value(wallet).saturating_add(balance))
    }

    /// Relabels records left PENDING by a previous run.
    pub fn recover_pending(&self) -> LogResult<RecoveryReport> {
        recover_pending(self.log.as_ref())
    }

    /// Drops terminal records older than the retention window.
    pub fn evict_expired(&self) -> LogResult<usize> {
        let Ok(retention) = chrono::Duration::from_std(self.config.retention) else {
            return Ok(0);
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            return Ok(0);
        };
        let evicted = self.log.evict_terminal_before(cutoff)?;
        if evicted > 0 {
            tracing::debug!(evicted, "evicted expired transaction records");
        }
        Ok(evicted)
    }

    /// Removes idle identity locks.
    pub fn sweep_locks(&self) -> usize {
        self.locks.sweep()
    }

    /// Starts a background sweeper over this coordinator's locks.
    pub fn start_lock_sweeper(&self, interval: Duration) -> std::io::Result<LockSweeper> {
        LockSweeper::start(Arc::clone(&self.locks), interval)
    }

    // -----------------------------------------------------------------------
    // Internal Helpers
    // -----------------------------------------------------------------------

    fn check_replay(&self, key: &TransactionKey, kind: TransactionKind) -> Option<TransactionResult> {
        match self.log.contains(key) {
            Ok(false) => None,
            Ok(true) => {
                tracing::warn!(%key, %kind, "replayed transaction key");
                Some(TransactionResult::rejected(
                    Some(key.clone()),
                    kind,
                    TransactionError::DuplicateTransaction(key.clone()),
                ))
            }
            Err(e) => Some(TransactionResult::rejected(Some(key.clone()), kind, e.into())),
        }
    }

    /// Records an attempt that was turned down before anything moved.
    fn reject(&self, record: TransactionRecord, error: TransactionError) -> TransactionResult {
        let key = record.key.clone();
        let kind = record.kind;
        if let Err(e) = self.log.insert(record.into_rejected(error.to_string())) {
            return TransactionResult::rejected(Some(key), kind, e.into());
        }
        tracing::debug!(%key, %kind, status = %TransactionStatus::Rejected, reason = %error, "transaction rejected");
        TransactionResult::rejected(Some(key), kind, error)
    }

    fn begin(&self, record: TransactionRecord) -> Result<(), TransactionResult> {
        let key = record.key.clone();
        let kind = record.kind;
        let identity = record.identity;
        self.log
            .insert(record)
            .map_err(|e| TransactionResult::rejected(Some(key.clone()), kind, e.into()))?;
        tracing::debug!(%identity, %key, %kind, status = %TransactionStatus::Pending, "transaction started");
        Ok(())
    }

    fn finish(&self, key: &TransactionKey, transition: Transition) {
        let status = transition.status;
        match self.log.transition(key, transition) {
            Ok(_) => tracing::debug!(%key, %status, "transaction finished"),
            Err(e) => tracing::error!(
                %key, %status, error = %e,
                "could not record terminal status; recovery will relabel the record"
            ),
        }
    }

    /// Post-PENDING failure with nothing moved.
    fn fail(&self, key: &TransactionKey, kind: TransactionKind, error: TransactionError) -> TransactionResult {
        self.finish(key, Transition::to(TransactionStatus::Rejected).detail(error.to_string()));
        tracing::debug!(%key, %kind, reason = %error, "transaction rejected after start");
        TransactionResult::rejected(Some(key.clone()), kind, error)
    }

    /// Value is in the ledger; the transaction did not happen.
    fn roll_back(
        &self,
        key: &TransactionKey,
        kind: TransactionKind,
        value: u64,
        error: TransactionError,
    ) -> TransactionResult {
        self.finish(
            key,
            Transition::to(TransactionStatus::RolledBackToLedger)
                .escrowed(value)
                .detail(error.to_string()),
        );
        tracing::warn!(%key, %kind, value, reason = %error, "transaction rolled back to ledger");
        TransactionResult::rolled_back(key.clone(), kind, value, error)
    }

    /// Credits undelivered value back to the ledger after a failed delivery.
    fn refund(
        &self,
        identity: Identity,
        key: &TransactionKey,
        kind: TransactionKind,
        tag: &str,
        value: u64,
        error: TransactionError,
    ) -> TransactionResult {
        match self.ledger.deposit(identity, value, &memo(tag, key)) {
            Ok(_) => self.roll_back(key, kind, value, error),
            Err(ledger_err) => self.compensation_failed(key, kind, identity, value, error, &ledger_err.to_string()),
        }
    }

    /// Puts removed exchange source units back after a failure before the
    /// value was escrowed. `held_before` is the source count before removal.
    fn restore_source(
        &self,
        identity: Identity,
        wallet: &Wallet,
        key: &TransactionKey,
        source: &Denomination,
        held_before: u64,
        error: TransactionError,
    ) -> TransactionResult {
        let kind = TransactionKind::Exchange;
        let missing = |engine: &CoinEngine| held_before.saturating_sub(engine.holdings(wallet).count_of(&source.id));

        let removed = missing(&self.engine);
        if removed == 0 {
            return self.fail(key, kind, error);
        }
        if self.engine.give_exact(wallet, &source.id, removed).is_ok() {
            tracing::debug!(%key, restored = removed, "source coins restored");
            return self.fail(key, kind, error);
        }

        // No room to put them back: park what is still missing in the ledger.
        let value = missing(&self.engine).saturating_mul(source.value);
        tracing::warn!(%identity, %key, value, "could not restore source coins, crediting ledger");
        self.refund(identity, key, kind, "TX_ROLLBACK", value, error)
    }

    fn compensation_failed(
        &self,
        key: &TransactionKey,
        kind: TransactionKind,
        identity: Identity,
        at_risk: u64,
        error: TransactionError,
        cause: &str,
    ) -> TransactionResult {
        tracing::error!(
            %identity, %key, %kind, at_risk, reason = %error, cause,
            "compensation failed; record left pending for operator review"
        );
        let detail = format!("compensation failed with {at_risk} at risk: {error}; {cause}");
        if let Err(log_err) = self.log.annotate(key, at_risk, &detail) {
            tracing::error!(%key, at_risk, error = %log_err, "could not record failed compensation");
        }
        TransactionResult::unsafe_failure(key.clone(), kind, at_risk, error)
    }
}

fn memo(tag: &str, key: &TransactionKey) -> String {
    format!("{tag}:{key}")
}

fn capacity_error(space: &SpaceReport) -> TransactionError {
    TransactionError::InsufficientCapacity {
        needed: space.new_slots_needed,
        available: space.free_slots,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MemoryLog;
    use coinvault_coins::{InMemoryLedger, ItemContainer, ItemStack, SlotContainer};

    struct Fixture {
        coordinator: EscrowCoordinator,
        ledger: Arc<InMemoryLedger>,
        log: Arc<MemoryLog>,
        identity: Identity,
        storage: Arc<SlotContainer>,
        wallet: Wallet,
    }

    fn fixture(slots: usize) -> Fixture {
        let ledger = Arc::new(InMemoryLedger::new());
        let log = Arc::new(MemoryLog::new());
        let coordinator = EscrowCoordinator::new(
            Arc::new(DenominationTable::standard()),
            ledger.clone(),
            log.clone(),
        );
        let storage = SlotContainer::shared(slots);
        Fixture {
            coordinator,
            ledger,
            log,
            identity: Identity::random(),
            wallet: Wallet::new(storage.clone()),
            storage,
        }
    }

    fn id(s: &str) -> DenominationId {
        DenominationId::new(s)
    }

    #[test]
    fn deposit_moves_exact_value() {
        let f = fixture(9);
        f.storage.set_slot(0, ItemStack::new("Coin_Gold", 2)).unwrap();

        let result = f.coordinator.deposit(f.identity, &f.wallet, 1_500, None);

        assert!(result.success);
        assert_eq!(result.status, TransactionStatus::Committed);
        assert_eq!(f.ledger.balance(f.identity).unwrap(), 1_500);
        assert_eq!(f.coordinator.engine().total_value(&f.wallet), 500);
        assert_eq!(f.ledger.entries_tagged("TX_DEPOSIT:").len(), 1);
    }

    #[test]
    fn deposit_more_than_held_is_rejected_and_logged() {
        let f = fixture(4);
        f.storage.set_slot(0, ItemStack::new("Coin_Iron", 1)).unwrap();

        let result = f.coordinator.deposit(f.identity, &f.wallet, 11, None);

        assert!(!result.success);
        assert!(result.money_safe);
        assert!(matches!(result.error, Some(TransactionError::InsufficientFunds { available: 10, requested: 11 })));
        let record = f.log.get(result.key.as_ref().unwrap()).unwrap().unwrap();
        assert_eq!(record.status, TransactionStatus::Rejected);
    }

    #[test]
    fn deposit_with_ledger_down_returns_coins() {
        let f = fixture(4);
        f.storage.set_slot(0, ItemStack::new("Coin_Cobalt", 3)).unwrap();
        f.ledger.set_available(false);

        let result = f.coordinator.deposit(f.identity, &f.wallet, 300, None);

        assert!(!result.success);
        assert!(result.money_safe);
        assert_eq!(f.coordinator.engine().total_value(&f.wallet), 300);
        assert!(matches!(result.error, Some(TransactionError::LedgerUnavailable(_))));
    }

    #[test]
    fn withdraw_zero_is_invalid() {
        let f = fixture(4);
        let result = f.coordinator.withdraw(f.identity, &f.wallet, 0, None);
        assert!(matches!(result.error, Some(TransactionError::InvalidAmount(_))));
    }

    #[test]
    fn withdraw_more_than_balance() {
        let f = fixture(4);
        f.ledger.set_balance(f.identity, 99);
        let result = f.coordinator.withdraw(f.identity, &f.wallet, 100, None);
        assert!(matches!(result.error, Some(TransactionError::InsufficientFunds { available: 99, .. })));
        assert_eq!(f.ledger.balance(f.identity).unwrap(), 99);
    }

    #[test]
    fn exchange_same_denomination_rejected() {
        let f = fixture(4);
        let result = f
            .coordinator
            .exchange(f.identity, &f.wallet, &id("Coin_Gold"), 1, &id("Coin_Gold"), None);
        assert!(matches!(result.error, Some(TransactionError::SameDenomination(_))));
    }

    #[test]
    fn exchange_unknown_denomination_rejected() {
        let f = fixture(4);
        let result = f
            .coordinator
            .exchange(f.identity, &f.wallet, &id("Coin_Platinum"), 1, &id("Coin_Gold"), None);
        assert!(matches!(result.error, Some(TransactionError::UnknownDenomination(_))));
    }

    #[test]
    fn exchange_over_ceiling_rejected() {
        let f = fixture(4);
        let coordinator = f.coordinator.with_config(EscrowConfig {
            exchange_ceiling: 10,
            ..EscrowConfig::default()
        });
        let result = coordinator.exchange(f.identity, &f.wallet, &id("Coin_Iron"), 11, &id("Coin_Copper"), None);
        assert_eq!(result.error, Some(TransactionError::OverflowGuard));
    }

    #[test]
    fn exchange_down_the_chain_produces_smaller_coins() {
        let f = fixture(4);
        f.storage.set_slot(0, ItemStack::new("Coin_Gold", 3)).unwrap();

        let result = f
            .coordinator
            .exchange(f.identity, &f.wallet, &id("Coin_Gold"), 2, &id("Coin_Cobalt"), None);

        assert!(result.success, "{}", result.message);
        let holdings = f.coordinator.engine().holdings(&f.wallet);
        assert_eq!(holdings.count_of(&id("Coin_Gold")), 1);
        assert_eq!(holdings.count_of(&id("Coin_Cobalt")), 20);
        assert_eq!(f.ledger.balance(f.identity).unwrap(), 0);
    }

    #[test]
    fn exchange_leaves_unneeded_source_units() {
        let f = fixture(4);
        f.storage.set_slot(0, ItemStack::new("Coin_Iron", 15)).unwrap();

        let result = f
            .coordinator
            .exchange(f.identity, &f.wallet, &id("Coin_Iron"), 15, &id("Coin_Cobalt"), None);

        assert!(result.success);
        assert_eq!(result.escrowed_value, 100);
        let holdings = f.coordinator.engine().holdings(&f.wallet);
        assert_eq!(holdings.count_of(&id("Coin_Iron")), 5);
        assert_eq!(holdings.count_of(&id("Coin_Cobalt")), 1);
        assert!(result.message.contains("5 Iron were not needed"));
    }

    #[test]
    fn exchange_with_ledger_down_restores_source() {
        let f = fixture(4);
        f.storage.set_slot(0, ItemStack::new("Coin_Copper", 1_000 - 1)).unwrap();
        f.storage.set_slot(1, ItemStack::new("Coin_Copper", 1)).unwrap();
        f.ledger.set_available(false);

        let result = f
            .coordinator
            .exchange(f.identity, &f.wallet, &id("Coin_Copper"), 1_000, &id("Coin_Gold"), None);

        assert!(!result.success);
        assert!(result.money_safe);
        assert_eq!(result.status, TransactionStatus::Rejected);
        assert_eq!(f.coordinator.engine().holdings(&f.wallet).count_of(&id("Coin_Copper")), 1_000);
        let record = f.log.get(result.key.as_ref().unwrap()).unwrap().unwrap();
        assert_eq!(record.status, TransactionStatus::Rejected);
    }

    #[test]
    fn total_wealth_sums_both_sides() {
        let f = fixture(4);
        f.storage.set_slot(0, ItemStack::new("Coin_Gold", 1)).unwrap();
        f.ledger.set_balance(f.identity, 234);
        assert_eq!(f.coordinator.total_wealth(f.identity, &f.wallet).unwrap(), 1_234);
    }

    #[test]
    fn evict_expired_keeps_recent_records() {
        let f = fixture(4);
        f.coordinator.withdraw(f.identity, &f.wallet, 0, None);
        assert_eq!(f.log.len(), 1);
        assert_eq!(f.coordinator.evict_expired().unwrap(), 0);

        let coordinator = f.coordinator.with_config(EscrowConfig {
            retention: Duration::ZERO,
            ..EscrowConfig::default()
        });
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(coordinator.evict_expired().unwrap(), 1);
    }

    #[test]
    fn consolidate_runs_under_lock() {
        let f = fixture(4);
        f.storage.set_slot(0, ItemStack::new("Coin_Copper", 500)).unwrap();
        f.storage.set_slot(1, ItemStack::new("Coin_Copper", 500)).unwrap();
        assert_eq!(f.coordinator.consolidate(f.identity, &f.wallet).unwrap(), 1_000);
        assert_eq!(f.storage.slot(0).unwrap(), ItemStack::new("Coin_Gold", 1));
        assert_eq!(f.coordinator.sweep_locks(), 1);
    }
}
