//! Scripted in-process host.
//!
//! Builds one wallet and one in-memory ledger, then feeds operations to the
//! escrow coordinator the way a game server would: one call per player
//! command, each timed and counted in the metrics.

use anyhow::{bail, Context, Result};
use coinvault_coins::{
    DenominationId, DenominationTable, Identity, InMemoryLedger, ItemStack, LedgerClient, SlotContainer, Wallet,
};
use coinvault_escrow::{EscrowCoordinator, LockSweeper, TransactionLog, TransactionResult};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::metrics::HostMetrics;

/// Item used to occupy slots with something that is not a coin.
pub const FILLER_ITEM: &str = "Cobblestone";

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// One scripted player command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Coins to bank.
    Deposit(u64),
    /// Bank to coins.
    Withdraw(u64),
    /// Source query, unit count, destination query.
    Exchange(String, u64, String),
    /// Collapse the wallet into the canonical breakdown.
    Consolidate,
}

impl FromStr for Operation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').map(str::trim).collect();
        let amount = |text: &str| -> Result<u64> {
            text.parse::<u64>()
                .with_context(|| format!("invalid amount {text:?} in operation {s:?}"))
        };
        match parts.as_slice() {
            ["deposit", n] => Ok(Operation::Deposit(amount(n)?)),
            ["withdraw", n] => Ok(Operation::Withdraw(amount(n)?)),
            ["exchange", src, n, dst] => Ok(Operation::Exchange(src.to_string(), amount(n)?, dst.to_string())),
            ["consolidate"] => Ok(Operation::Consolidate),
            _ => bail!(
                "unknown operation {s:?}; expected deposit:<n>, withdraw:<n>, exchange:<src>:<n>:<dst> or consolidate"
            ),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Deposit(n) => write!(f, "deposit:{n}"),
            Operation::Withdraw(n) => write!(f, "withdraw:{n}"),
            Operation::Exchange(src, n, dst) => write!(f, "exchange:{src}:{n}:{dst}"),
            Operation::Consolidate => write!(f, "consolidate"),
        }
    }
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

/// Container sizes and starting balances of a run.
#[derive(Clone, Debug)]
pub struct WalletLayout {
    /// Storage slots.
    pub storage_slots: usize,
    /// Hotbar slots, 0 for none.
    pub hotbar_slots: usize,
    /// Backpack slots, 0 for none.
    pub backpack_slots: usize,
    /// Storage slots to occupy with [`FILLER_ITEM`].
    pub filler: usize,
    /// Value given to the wallet as coins up front.
    pub coins: u64,
    /// Starting ledger balance.
    pub bank: u64,
}

/// A wallet, a ledger and a coordinator wired together for one identity,
/// with a background thread reclaiming idle identity locks.
pub struct Simulation {
    identity: Identity,
    wallet: Wallet,
    ledger: Arc<InMemoryLedger>,
    coordinator: EscrowCoordinator,
    metrics: HostMetrics,
    _sweeper: LockSweeper,
}

impl Simulation {
    /// Builds the wallet from `layout`, seeds both sides and starts sweeping
    /// idle locks every `lock_sweep`.
    pub fn new(
        table: Arc<DenominationTable>,
        log: Arc<dyn TransactionLog>,
        identity: Identity,
        layout: &WalletLayout,
        metrics: HostMetrics,
        lock_sweep: Duration,
    ) -> Result<Self> {
        if layout.storage_slots == 0 {
            bail!("storage needs at least one slot");
        }
        let storage = SlotContainer::shared(layout.storage_slots);
        for _ in 0..layout.filler.min(layout.storage_slots) {
            storage.put_in_free_slot(ItemStack::new(FILLER_ITEM, 64));
        }
        let mut wallet = Wallet::new(storage);
        if layout.hotbar_slots > 0 {
            wallet = wallet.with_hotbar(SlotContainer::shared(layout.hotbar_slots));
        }
        if layout.backpack_slots > 0 {
            wallet = wallet.with_backpack(SlotContainer::shared(layout.backpack_slots));
        }

        let ledger = Arc::new(InMemoryLedger::new());
        ledger.set_balance(identity, layout.bank);
        let coordinator = EscrowCoordinator::new(table, ledger.clone(), log);
        coordinator
            .engine()
            .give(&wallet, layout.coins)
            .with_context(|| format!("starting wallet cannot hold {} in coins", layout.coins))?;
        let sweeper = coordinator
            .start_lock_sweeper(lock_sweep)
            .context("failed to start lock sweeper")?;

        tracing::info!(
            %identity,
            storage = layout.storage_slots,
            hotbar = layout.hotbar_slots,
            backpack = layout.backpack_slots,
            coins = layout.coins,
            bank = layout.bank,
            "simulation wallet ready"
        );
        Ok(Self {
            identity,
            wallet,
            ledger,
            coordinator,
            metrics,
            _sweeper: sweeper,
        })
    }

    /// Runs one operation. Transactions yield their result; consolidate
    /// yields `None` and only fails on an engine error.
    pub fn run(&self, op: &Operation) -> Result<Option<TransactionResult>> {
        let started = Instant::now();
        let result = match op {
            Operation::Deposit(amount) => self.coordinator.deposit(self.identity, &self.wallet, *amount, None),
            Operation::Withdraw(amount) => self.coordinator.withdraw(self.identity, &self.wallet, *amount, None),
            Operation::Exchange(src, count, dst) => {
                let source = self.resolve(src);
                let destination = self.resolve(dst);
                self.coordinator
                    .exchange(self.identity, &self.wallet, &source, *count, &destination, None)
            }
            Operation::Consolidate => {
                let value = self
                    .coordinator
                    .consolidate(self.identity, &self.wallet)
                    .context("consolidation failed")?;
                tracing::info!(identity = %self.identity, value, "wallet consolidated");
                return Ok(None);
            }
        };
        self.metrics.observe(&result, started.elapsed());
        self.metrics
            .tracked_identity_locks
            .set(i64::try_from(self.coordinator.locks().len()).unwrap_or(i64::MAX));
        Ok(Some(result))
    }

    /// Per-denomination holdings, one line each, followed by the bank
    /// balance and the capacity summary.
    pub fn report(&self) -> Result<String> {
        let engine = self.coordinator.engine();
        let mut out = String::new();
        for (id, count) in engine.holdings(&self.wallet).iter() {
            let name = engine.table().get(id).map_or(id.as_str(), |d| d.display_name.as_str());
            out.push_str(&format!("  {name:<12} {count}\n"));
        }
        let bank = self.ledger.balance(self.identity).context("reading bank balance")?;
        out.push_str(&format!("  wallet value {}\n", engine.total_value(&self.wallet)));
        out.push_str(&format!("  bank         {bank}\n"));
        for line in self.coordinator.capacity().summary(&self.wallet).lines() {
            out.push_str(&format!("  {line}\n"));
        }
        Ok(out)
    }

    /// Wallet plus bank.
    pub fn total_wealth(&self) -> Result<u64> {
        Ok(self.coordinator.total_wealth(self.identity, &self.wallet)?)
    }

    /// The coordinator.
    pub fn coordinator(&self) -> &EscrowCoordinator {
        &self.coordinator
    }

    /// The metrics handles.
    pub fn metrics(&self) -> &HostMetrics {
        &self.metrics
    }

    /// Accepts item ids, config names and display names; unknown input is
    /// passed through so the coordinator rejects it with its own message.
    fn resolve(&self, query: &str) -> DenominationId {
        self.coordinator
            .engine()
            .table()
            .resolve(query)
            .map(|d| d.id.clone())
            .unwrap_or_else(|| DenominationId::new(query))
    }
}
