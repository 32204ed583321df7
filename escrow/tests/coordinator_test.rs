//! Integration tests for the escrow coordinator.
//!
//! These drive full transactions against real containers, the in-memory
//! ledger and both log backends, including the failure paths where a
//! container changes underneath a transaction or the ledger drops out.

use coinvault_coins::{
    ContainerError, DenominationId, DenominationTable, Identity, InMemoryLedger, ItemContainer, ItemStack,
    LedgerClient, LedgerError, SlotContainer, Wallet,
};
use coinvault_escrow::{
    EscrowCoordinator, MemoryLog, SledLog, TransactionError, TransactionKey, TransactionLog, TransactionStatus,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

type Hook = Box<dyn Fn(&str) -> Result<(), LedgerError> + Send + Sync>;

/// Ledger that runs a hook before every deposit and withdrawal, to simulate
/// other systems acting while a transaction is in flight.
struct HookedLedger {
    inner: InMemoryLedger,
    on_deposit: Hook,
    on_withdraw: Hook,
}

impl HookedLedger {
    fn on_deposit(hook: impl Fn(&str) -> Result<(), LedgerError> + Send + Sync + 'static) -> Self {
        Self {
            inner: InMemoryLedger::new(),
            on_deposit: Box::new(hook),
            on_withdraw: Box::new(|_| Ok(())),
        }
    }

    fn on_withdraw(hook: impl Fn(&str) -> Result<(), LedgerError> + Send + Sync + 'static) -> Self {
        Self {
            inner: InMemoryLedger::new(),
            on_deposit: Box::new(|_| Ok(())),
            on_withdraw: Box::new(hook),
        }
    }
}

impl LedgerClient for HookedLedger {
    fn balance(&self, identity: Identity) -> Result<u64, LedgerError> {
        self.inner.balance(identity)
    }

    fn deposit(&self, identity: Identity, amount: u64, memo: &str) -> Result<u64, LedgerError> {
        (self.on_deposit)(memo)?;
        self.inner.deposit(identity, amount, memo)
    }

    fn withdraw(&self, identity: Identity, amount: u64, memo: &str) -> Result<u64, LedgerError> {
        (self.on_withdraw)(memo)?;
        self.inner.withdraw(identity, amount, memo)
    }
}

/// Container that refuses to clear slots after a fixed number of clears.
struct FlakyContainer {
    inner: SlotContainer,
    clears_left: AtomicUsize,
}

impl ItemContainer for FlakyContainer {
    fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    fn slot(&self, index: usize) -> Option<ItemStack> {
        self.inner.slot(index)
    }

    fn set_slot(&self, index: usize, stack: ItemStack) -> Result<(), ContainerError> {
        self.inner.set_slot(index, stack)
    }

    fn clear_slot(&self, index: usize) -> Result<Option<ItemStack>, ContainerError> {
        let left = self.clears_left.load(Ordering::SeqCst);
        if left == 0 {
            return Err(ContainerError::SlotOutOfRange {
                index,
                capacity: self.inner.capacity(),
            });
        }
        self.clears_left.store(left - 1, Ordering::SeqCst);
        self.inner.clear_slot(index)
    }

    fn add_stack(&self, stack: &ItemStack) -> Result<(), ContainerError> {
        self.inner.add_stack(stack)
    }
}

fn table() -> Arc<DenominationTable> {
    Arc::new(DenominationTable::standard())
}

fn coordinator(ledger: Arc<dyn LedgerClient>) -> EscrowCoordinator {
    EscrowCoordinator::new(table(), ledger, Arc::new(MemoryLog::new()))
}

fn id(s: &str) -> DenominationId {
    DenominationId::new(s)
}

// ---------------------------------------------------------------------------
// Withdraw
// ---------------------------------------------------------------------------

#[test]
fn withdraw_commits_and_moves_value() {
    let ledger = Arc::new(InMemoryLedger::new());
    let coordinator = coordinator(ledger.clone());
    let player = Identity::random();
    let storage = SlotContainer::shared(36);
    let wallet = Wallet::new(storage.clone());
    ledger.set_balance(player, 1_000);

    let result = coordinator.withdraw(player, &wallet, 500, None);

    assert!(result.success);
    assert!(result.money_safe);
    assert_eq!(result.status, TransactionStatus::Committed);
    assert_eq!(result.message, "Withdrew 500 from your bank.");
    assert_eq!(ledger.balance(player).unwrap(), 500);
    assert_eq!(coordinator.engine().total_value(&wallet), 500);
    assert_eq!(storage.slot(0), Some(ItemStack::new("Coin_Cobalt", 5)));
    assert_eq!(ledger.entries_tagged("TX_WITHDRAW:").len(), 1);
}

#[test]
fn withdraw_into_full_wallet_is_rejected() {
    let ledger = Arc::new(InMemoryLedger::new());
    let coordinator = coordinator(ledger.clone());
    let player = Identity::random();
    let storage = SlotContainer::shared(9);
    storage.fill_free_slots("Dirt", 64);
    let wallet = Wallet::new(storage.clone());
    ledger.set_balance(player, 1_000);

    let result = coordinator.withdraw(player, &wallet, 100, None);

    assert!(!result.success);
    assert!(result.money_safe);
    assert_eq!(result.status, TransactionStatus::Rejected);
    assert_eq!(
        result.error,
        Some(TransactionError::InsufficientCapacity { needed: 1, available: 0 })
    );
    assert_eq!(ledger.balance(player).unwrap(), 1_000);
    assert!(ledger.journal().is_empty());
    let record = coordinator.log().get(result.key.as_ref().unwrap()).unwrap().unwrap();
    assert_eq!(record.status, TransactionStatus::Rejected);
}

#[test]
fn withdraw_with_ledger_offline_moves_nothing() {
    let ledger = Arc::new(InMemoryLedger::new());
    let coordinator = coordinator(ledger.clone());
    let player = Identity::random();
    let wallet = Wallet::new(SlotContainer::shared(9));
    ledger.set_balance(player, 1_000);
    ledger.set_available(false);

    let result = coordinator.withdraw(player, &wallet, 100, None);

    assert!(!result.success);
    assert!(result.money_safe);
    assert!(matches!(result.error, Some(TransactionError::LedgerUnavailable(_))));
    assert_eq!(coordinator.engine().total_value(&wallet), 0);
    ledger.set_available(true);
    assert_eq!(ledger.balance(player).unwrap(), 1_000);
}

// ---------------------------------------------------------------------------
// Deposit
// ---------------------------------------------------------------------------

#[test]
fn deposit_credits_measured_decrease_when_change_cannot_return() {
    let ledger = Arc::new(InMemoryLedger::new());
    let coordinator = coordinator(ledger.clone());
    let player = Identity::random();
    let storage = SlotContainer::shared(9);
    storage.set_slot(0, ItemStack::new("Coin_Gold", 1)).unwrap();
    storage.fill_free_slots("Dirt", 64);
    let wallet = Wallet::new(storage.clone());

    // Taking 1 breaks the gold coin; only the cobalt part of the 999 change
    // finds a slot.
    let result = coordinator.deposit(player, &wallet, 1, None);

    assert!(result.success);
    assert_eq!(result.status, TransactionStatus::Committed);
    assert_eq!(coordinator.engine().total_value(&wallet), 900);
    assert_eq!(ledger.balance(player).unwrap(), 100);
    assert_eq!(coordinator.total_wealth(player, &wallet).unwrap(), 1_000);
}

#[test]
fn deposit_partially_commits_when_removal_stalls() {
    let ledger = Arc::new(InMemoryLedger::new());
    let coordinator = coordinator(ledger.clone());
    let player = Identity::random();
    let inner = SlotContainer::new(4);
    for slot in 0..3 {
        inner.set_slot(slot, ItemStack::new("Coin_Gold", 1)).unwrap();
    }
    let wallet = Wallet::new(Arc::new(FlakyContainer {
        inner,
        clears_left: AtomicUsize::new(1),
    }));

    let result = coordinator.deposit(player, &wallet, 3_000, None);

    assert!(result.success);
    assert_eq!(result.status, TransactionStatus::PartialCommit);
    assert_eq!(result.escrowed_value, 1_000);
    assert!(result.message.contains("partial"));
    assert_eq!(ledger.balance(player).unwrap(), 1_000);
    assert_eq!(coordinator.engine().total_value(&wallet), 2_000);
}

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

#[test]
fn exchange_copper_for_gold() {
    let ledger = Arc::new(InMemoryLedger::new());
    let coordinator = coordinator(ledger.clone());
    let player = Identity::random();
    let storage = SlotContainer::shared(9);
    storage.set_slot(0, ItemStack::new("Coin_Copper", 999)).unwrap();
    storage.set_slot(1, ItemStack::new("Coin_Copper", 1)).unwrap();
    let wallet = Wallet::new(storage.clone());

    let result = coordinator.exchange(player, &wallet, &id("Coin_Copper"), 1_000, &id("Coin_Gold"), None);

    assert!(result.success, "{}", result.message);
    assert_eq!(result.message, "Exchanged 1000 Copper for 1 Gold.");
    let holdings = coordinator.engine().holdings(&wallet);
    assert_eq!(holdings.count_of(&id("Coin_Copper")), 0);
    assert_eq!(holdings.count_of(&id("Coin_Gold")), 1);
    assert_eq!(ledger.balance(player).unwrap(), 0);
    assert_eq!(ledger.entries_tagged("TX_ESCROW:").len(), 1);
    assert_eq!(ledger.entries_tagged("TX_COMPLETE:").len(), 1);
}

#[test]
fn exchange_below_minimum_names_the_threshold() {
    let ledger = Arc::new(InMemoryLedger::new());
    let coordinator = coordinator(ledger.clone());
    let player = Identity::random();
    let storage = SlotContainer::shared(9);
    storage.set_slot(0, ItemStack::new("Coin_Copper", 5)).unwrap();
    let wallet = Wallet::new(storage);

    let result = coordinator.exchange(player, &wallet, &id("Coin_Copper"), 5, &id("Coin_Gold"), None);

    assert!(!result.success);
    assert!(result.message.to_lowercase().contains("need at least 1000"));
    assert_eq!(coordinator.engine().holdings(&wallet).count_of(&id("Coin_Copper")), 5);
    assert!(ledger.journal().is_empty());
}

#[test]
fn exchange_rolls_back_when_space_vanishes_mid_transaction() {
    let storage = SlotContainer::shared(3);
    storage.set_slot(0, ItemStack::new("Coin_Copper", 999)).unwrap();
    storage.set_slot(1, ItemStack::new("Coin_Copper", 1)).unwrap();
    let wallet = Wallet::new(storage.clone());

    let filler = storage.clone();
    let ledger = Arc::new(HookedLedger::on_deposit(move |memo| {
        if memo.starts_with("TX_ESCROW:") {
            filler.fill_free_slots("Dirt", 64);
        }
        Ok(())
    }));
    let coordinator = coordinator(ledger.clone());
    let player = Identity::random();

    let result = coordinator.exchange(player, &wallet, &id("Coin_Copper"), 1_000, &id("Coin_Gold"), None);

    assert!(!result.success);
    assert!(result.money_safe);
    assert_eq!(result.status, TransactionStatus::RolledBackToLedger);
    assert!(matches!(result.error, Some(TransactionError::InsufficientCapacity { .. })));
    assert!(result.message.contains("deposited to your bank"));
    let holdings = coordinator.engine().holdings(&wallet);
    assert_eq!(holdings.count_of(&id("Coin_Copper")), 0);
    assert_eq!(holdings.count_of(&id("Coin_Gold")), 0);
    assert_eq!(ledger.balance(player).unwrap(), 1_000);
    let record = coordinator.log().get(result.key.as_ref().unwrap()).unwrap().unwrap();
    assert_eq!(record.status, TransactionStatus::RolledBackToLedger);
    assert_eq!(record.escrowed_value, 1_000);
}

#[test]
fn failed_compensation_is_flagged_and_recovered() {
    let storage = SlotContainer::shared(3);
    storage.set_slot(0, ItemStack::new("Coin_Cobalt", 10)).unwrap();
    let wallet = Wallet::new(storage.clone());

    // Every deposit fails, and the first one also fills the wallet so the
    // source coins cannot be put back.
    let filler = storage.clone();
    let ledger = Arc::new(HookedLedger::on_deposit(move |_| {
        filler.fill_free_slots("Dirt", 64);
        Err(LedgerError::Unavailable("connection reset".into()))
    }));
    let coordinator = coordinator(ledger);
    let player = Identity::random();

    let result = coordinator.exchange(player, &wallet, &id("Coin_Cobalt"), 10, &id("Coin_Gold"), None);

    assert!(!result.success);
    assert!(!result.money_safe);
    assert_eq!(result.status, TransactionStatus::Pending);
    assert_eq!(result.escrowed_value, 1_000);
    let key = result.key.clone().unwrap();
    assert!(result.message.contains(key.as_str()));

    let flagged = coordinator.log().get(&key).unwrap().unwrap();
    assert_eq!(flagged.status, TransactionStatus::Pending);
    assert_eq!(flagged.escrowed_value, 1_000);
    let note = flagged.detail.clone().unwrap();
    assert!(note.contains("1000 at risk"), "{note}");
    assert!(note.contains("connection reset"), "{note}");

    let report = coordinator.recover_pending().unwrap();
    assert_eq!(report.len(), 1);
    let record = coordinator.log().get(&key).unwrap().unwrap();
    assert_eq!(record.status, TransactionStatus::RecoveredToLedger);
    assert_eq!(record.escrowed_value, 1_000);
    assert_eq!(record.detail.as_deref(), Some(note.as_str()));
}

#[test]
fn exchange_credits_fallback_when_delivery_fails_after_escrow() {
    let storage = SlotContainer::shared(3);
    storage.set_slot(0, ItemStack::new("Coin_Copper", 999)).unwrap();
    storage.set_slot(1, ItemStack::new("Coin_Copper", 1)).unwrap();
    let wallet = Wallet::new(storage.clone());

    // The escrow comes back out of the ledger, then the wallet fills before
    // the gold coin lands.
    let filler = storage.clone();
    let ledger = Arc::new(HookedLedger::on_withdraw(move |memo| {
        if memo.starts_with("TX_COMPLETE:") {
            filler.fill_free_slots("Dirt", 64);
        }
        Ok(())
    }));
    let coordinator = coordinator(ledger.clone());
    let player = Identity::random();

    let result = coordinator.exchange(player, &wallet, &id("Coin_Copper"), 1_000, &id("Coin_Gold"), None);

    assert!(!result.success);
    assert!(result.money_safe);
    assert_eq!(result.status, TransactionStatus::RolledBackToLedger);
    assert!(matches!(result.error, Some(TransactionError::DeliveryFailure(_))));
    assert_eq!(coordinator.engine().total_value(&wallet), 0);
    assert_eq!(ledger.balance(player).unwrap(), 1_000);
    let key = result.key.as_ref().unwrap();
    assert_eq!(ledger.inner.entries_tagged("TX_FALLBACK:").len(), 1);
    assert_eq!(ledger.inner.entries_tagged(&format!("TX_FALLBACK:{key}")).len(), 1);
    assert_eq!(ledger.inner.entries_tagged("TX_COMPLETE:").len(), 1);
    let record = coordinator.log().get(key).unwrap().unwrap();
    assert_eq!(record.status, TransactionStatus::RolledBackToLedger);
    assert_eq!(record.escrowed_value, 1_000);
}

#[test]
fn withdraw_refunds_rollback_when_delivery_fails_after_debit() {
    let storage = SlotContainer::shared(3);
    let wallet = Wallet::new(storage.clone());

    let filler = storage.clone();
    let ledger = Arc::new(HookedLedger::on_withdraw(move |memo| {
        if memo.starts_with("TX_WITHDRAW:") {
            filler.fill_free_slots("Dirt", 64);
        }
        Ok(())
    }));
    let coordinator = coordinator(ledger.clone());
    let player = Identity::random();
    ledger.inner.set_balance(player, 500);

    let result = coordinator.withdraw(player, &wallet, 500, None);

    assert!(!result.success);
    assert!(result.money_safe);
    assert_eq!(result.status, TransactionStatus::RolledBackToLedger);
    assert!(matches!(result.error, Some(TransactionError::DeliveryFailure(_))));
    assert_eq!(coordinator.engine().total_value(&wallet), 0);
    assert_eq!(ledger.balance(player).unwrap(), 500);
    let key = result.key.as_ref().unwrap();
    assert_eq!(ledger.inner.entries_tagged("TX_WITHDRAW:").len(), 1);
    assert_eq!(ledger.inner.entries_tagged(&format!("TX_ROLLBACK:{key}")).len(), 1);
    let record = coordinator.log().get(key).unwrap().unwrap();
    assert_eq!(record.status, TransactionStatus::RolledBackToLedger);
    assert_eq!(record.escrowed_value, 500);
}

// ---------------------------------------------------------------------------
// Idempotency & Concurrency
// ---------------------------------------------------------------------------

#[test]
fn replayed_key_is_rejected_without_effect() {
    let ledger = Arc::new(InMemoryLedger::new());
    let coordinator = coordinator(ledger.clone());
    let player = Identity::random();
    let wallet = Wallet::new(SlotContainer::shared(9));
    ledger.set_balance(player, 1_000);
    let key = TransactionKey::new("W-replay");

    let first = coordinator.withdraw(player, &wallet, 300, Some(key.clone()));
    let second = coordinator.withdraw(player, &wallet, 300, Some(key.clone()));

    assert!(first.success);
    assert!(!second.success);
    assert!(second.money_safe);
    assert_eq!(second.error, Some(TransactionError::DuplicateTransaction(key)));
    assert_eq!(ledger.balance(player).unwrap(), 700);
    assert_eq!(coordinator.engine().total_value(&wallet), 300);
}

#[test]
fn concurrent_withdrawals_never_overdraw() {
    let ledger = Arc::new(InMemoryLedger::new());
    let coordinator = Arc::new(coordinator(ledger.clone()));
    let player = Identity::random();
    let wallet = Wallet::new(SlotContainer::shared(36));
    ledger.set_balance(player, 500);

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let coordinator = Arc::clone(&coordinator);
            let wallet = wallet.clone();
            std::thread::spawn(move || coordinator.withdraw(player, &wallet, 100, None).success)
        })
        .collect();
    let committed = threads
        .into_iter()
        .map(|t| t.join().unwrap())
        .filter(|ok| *ok)
        .count();

    assert_eq!(committed, 5);
    assert_eq!(ledger.balance(player).unwrap(), 0);
    assert_eq!(coordinator.engine().total_value(&wallet), 500);
}

#[test]
fn concurrent_exchanges_never_double_spend() {
    let ledger = Arc::new(InMemoryLedger::new());
    let coordinator = Arc::new(coordinator(ledger.clone()));
    let player = Identity::random();
    let storage = SlotContainer::shared(9);
    storage.set_slot(0, ItemStack::new("Coin_Copper", 999)).unwrap();
    storage.set_slot(1, ItemStack::new("Coin_Copper", 1)).unwrap();
    let wallet = Wallet::new(storage);

    let threads: Vec<_> = (0..2)
        .map(|_| {
            let coordinator = Arc::clone(&coordinator);
            let wallet = wallet.clone();
            std::thread::spawn(move || {
                coordinator
                    .exchange(player, &wallet, &id("Coin_Copper"), 1_000, &id("Coin_Gold"), None)
                    .success
            })
        })
        .collect();
    let committed = threads
        .into_iter()
        .map(|t| t.join().unwrap())
        .filter(|ok| *ok)
        .count();

    assert_eq!(committed, 1);
    let holdings = coordinator.engine().holdings(&wallet);
    assert_eq!(holdings.count_of(&id("Coin_Copper")), 0);
    assert_eq!(holdings.count_of(&id("Coin_Gold")), 1);
    assert_eq!(ledger.balance(player).unwrap(), 0);
}

#[test]
fn concurrent_mixed_transactions_conserve_value() {
    let ledger = Arc::new(InMemoryLedger::new());
    let coordinator = Arc::new(coordinator(ledger.clone()));
    let player = Identity::random();
    let storage = SlotContainer::shared(36);
    storage.set_slot(0, ItemStack::new("Coin_Gold", 5)).unwrap();
    let wallet = Wallet::new(storage);
    ledger.set_balance(player, 5_000);

    let threads: Vec<_> = (0..6)
        .map(|i| {
            let coordinator = Arc::clone(&coordinator);
            let wallet = wallet.clone();
            std::thread::spawn(move || {
                for _ in 0..10 {
                    if i % 2 == 0 {
                        coordinator.deposit(player, &wallet, 250, None);
                    } else {
                        coordinator.withdraw(player, &wallet, 250, None);
                    }
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(coordinator.total_wealth(player, &wallet).unwrap(), 10_000);
}

#[test]
fn different_identities_do_not_block() {
    let ledger = Arc::new(InMemoryLedger::new());
    let coordinator = Arc::new(coordinator(ledger.clone()));
    let busy = Identity::random();
    let free = Identity::random();
    ledger.set_balance(free, 100);

    let _held = coordinator.locks().lock(busy);
    let (tx, rx) = mpsc::channel();
    let worker = {
        let coordinator = Arc::clone(&coordinator);
        std::thread::spawn(move || {
            let wallet = Wallet::new(SlotContainer::shared(9));
            let result = coordinator.withdraw(free, &wallet, 100, None);
            let _ = tx.send(result.success);
        })
    };

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(true));
    worker.join().unwrap();
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[test]
fn sled_log_recovers_interrupted_transactions_after_restart() {
    use coinvault_escrow::{TransactionKind, TransactionRecord};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("transactions");
    let player = Identity::random();

    {
        let log = SledLog::open(&path).unwrap();
        log.insert(
            TransactionRecord::pending(TransactionKey::new("X-crashed"), player, TransactionKind::Exchange)
                .with_escrow(1_000),
        )
        .unwrap();
        log.flush().unwrap();
    }

    let log = Arc::new(SledLog::open(&path).unwrap());
    let coordinator = EscrowCoordinator::new(table(), Arc::new(InMemoryLedger::new()), log.clone());
    let report = coordinator.recover_pending().unwrap();

    assert_eq!(report.len(), 1);
    assert_eq!(report.recovered[0].status, TransactionStatus::RecoveredToLedger);
    assert!(log.pending().unwrap().is_empty());

    // The key stays burned after recovery.
    let wallet = Wallet::new(SlotContainer::shared(9));
    let replay = coordinator.deposit(player, &wallet, 1, Some(TransactionKey::new("X-crashed")));
    assert!(matches!(replay.error, Some(TransactionError::DuplicateTransaction(_))));
}
