//! # Denomination Engine
//!
//! Converts between a scalar value and physical coin stacks, and performs
//! the wallet mutations: [`give`](CoinEngine::give), [`take`](CoinEngine::take),
//! their single-denomination variants and [`consolidate`](CoinEngine::consolidate).
//!
//! The engine only ever touches container slots. It never talks to the
//! ledger and it does not compensate for partial failures of `give`; that
//! is the escrow coordinator's job, which measures the wallet before and
//! after each step.
//!
//! None of these operations are atomic across slots. Per-identity
//! serialization comes from the coordinator's lock; unrelated game events
//! may still interleave between slot writes.

use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::config::MAX_STACK;
use crate::container::{ContainerError, ContainerRole, ItemContainer, ItemStack, Wallet};
use crate::denomination::{Breakdown, Denomination, DenominationId, DenominationTable};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from wallet mutations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The wallet's total value is below the requested amount.
    #[error("insufficient coins: wallet holds {available}, requested {requested}")]
    InsufficientFunds {
        /// Wallet value at the time of the check.
        available: u64,
        /// Requested value.
        requested: u64,
    },

    /// Not enough units of one denomination.
    #[error("insufficient {denomination}: have {available}, requested {requested}")]
    InsufficientUnits {
        /// Denomination being removed.
        denomination: DenominationId,
        /// Units found.
        available: u64,
        /// Units requested.
        requested: u64,
    },

    /// A stack could not be placed in any delivery container.
    #[error("no room for {remaining} x {denomination}")]
    NoSpace {
        /// Denomination being placed.
        denomination: DenominationId,
        /// Units of that denomination still undelivered.
        remaining: u64,
    },

    /// The denomination is not in the table.
    #[error("unknown denomination {0}")]
    UnknownDenomination(DenominationId),

    /// `take` removed more than requested and could not give the excess back.
    #[error("took {requested} but could not return {change} in change")]
    ChangeUndelivered {
        /// Value the caller asked for.
        requested: u64,
        /// Excess value still owed to the wallet.
        change: u64,
    },

    /// Value arithmetic overflowed.
    #[error("value overflow")]
    Overflow,

    /// Coin removal stopped partway; `removed` value already left the wallet.
    #[error("removal stopped after {removed}: {source}")]
    RemovalStalled {
        /// Value cleared before the failing slot.
        removed: u64,
        /// The slot error that stopped the removal.
        source: ContainerError,
    },

    /// The container store rejected a slot operation.
    #[error("container error: {0}")]
    Container(#[from] ContainerError),
}

// ---------------------------------------------------------------------------
// Holdings
// ---------------------------------------------------------------------------

/// Coin units held per denomination across a whole wallet.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Holdings {
    counts: BTreeMap<DenominationId, u64>,
}

impl Holdings {
    /// Units of one denomination (0 if none).
    pub fn count_of(&self, id: &DenominationId) -> u64 {
        self.counts.get(id).copied().unwrap_or(0)
    }

    /// Non-zero `(denomination, units)` pairs, ordered by item id.
    pub fn iter(&self) -> impl Iterator<Item = (&DenominationId, u64)> {
        self.counts.iter().map(|(id, c)| (id, *c))
    }

    /// Returns `true` when the wallet holds no coins.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

// ---------------------------------------------------------------------------
// CoinEngine
// ---------------------------------------------------------------------------

/// Stateless coin logic bound to one denomination table.
#[derive(Clone, Debug)]
pub struct CoinEngine {
    table: Arc<DenominationTable>,
}

impl CoinEngine {
    /// Creates an engine over `table`.
    pub fn new(table: Arc<DenominationTable>) -> Self {
        Self { table }
    }

    /// The denomination table in use.
    pub fn table(&self) -> &DenominationTable {
        &self.table
    }

    /// Canonical minimal-count representation of `amount`.
    pub fn breakdown(&self, amount: u64) -> Breakdown {
        self.table.breakdown(amount)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Total coin value across every container of the wallet.
    pub fn total_value(&self, wallet: &Wallet) -> u64 {
        wallet
            .containers()
            .map(|(_, c)| self.container_value(c))
            .fold(0u64, u64::saturating_add)
    }

    /// Coin value held in a single container.
    pub fn container_value(&self, container: &dyn ItemContainer) -> u64 {
        container
            .snapshot()
            .iter()
            .flatten()
            .filter_map(|stack| {
                self.table
                    .by_item_id(&stack.item_id)
                    .map(|d| d.value.saturating_mul(u64::from(stack.quantity)))
            })
            .fold(0u64, u64::saturating_add)
    }

    /// Units per denomination across the wallet.
    pub fn holdings(&self, wallet: &Wallet) -> Holdings {
        let mut counts = BTreeMap::new();
        for (_, container) in wallet.containers() {
            for stack in container.snapshot().into_iter().flatten() {
                if let Some(d) = self.table.by_item_id(&stack.item_id) {
                    *counts.entry(d.id.clone()).or_insert(0u64) += u64::from(stack.quantity);
                }
            }
        }
        Holdings { counts }
    }

    /// Returns `true` if the wallet holds at least `amount` in value.
    pub fn can_afford(&self, wallet: &Wallet, amount: u64) -> bool {
        self.total_value(wallet) >= amount
    }

    // -----------------------------------------------------------------------
    // Give
    // -----------------------------------------------------------------------

    /// Adds `amount` to the wallet using the canonical breakdown.
    ///
    /// Stacks of at most [`MAX_STACK`] go to Storage first, then Hotbar.
    /// Callers are expected to have run a capacity check; if a stack still
    /// does not fit the operation stops with [`EngineError::NoSpace`] and
    /// whatever was already placed stays placed.
    pub fn give(&self, wallet: &Wallet, amount: u64) -> Result<(), EngineError> {
        for (denomination, count) in self.breakdown(amount).iter() {
            let mut remaining = count;
            while remaining > 0 {
                let size = chunk(remaining);
                let stack = ItemStack::new(denomination.id.as_str(), size);
                let placed = wallet
                    .delivery_targets()
                    .any(|container| container.add_stack(&stack).is_ok());
                if !placed {
                    tracing::debug!(
                        denomination = %denomination.id,
                        remaining,
                        "could not place coins, wallet full"
                    );
                    return Err(EngineError::NoSpace {
                        denomination: denomination.id.clone(),
                        remaining,
                    });
                }
                remaining -= u64::from(size);
            }
        }
        Ok(())
    }

    /// Adds `count` coins of one denomination to Storage.
    ///
    /// Must be preceded by an exact capacity check against Storage; a
    /// failure after that check is an invariant violation for the caller.
    pub fn give_exact(
        &self,
        wallet: &Wallet,
        id: &DenominationId,
        count: u64,
    ) -> Result<(), EngineError> {
        let denomination = self.denomination(id)?;
        let storage = wallet.storage();
        let mut remaining = count;
        while remaining > 0 {
            let size = chunk(remaining);
            if storage
                .add_stack(&ItemStack::new(denomination.id.as_str(), size))
                .is_err()
            {
                return Err(EngineError::NoSpace {
                    denomination: denomination.id.clone(),
                    remaining,
                });
            }
            remaining -= u64::from(size);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Take
    // -----------------------------------------------------------------------

    /// Removes at least `amount` in value, highest denominations first.
    ///
    /// A stack worth more than what is still owed is shrunk by
    /// `ceil(remaining / value)` coins, which can overshoot. The overshoot is
    /// given back as change. If the change cannot be placed the call returns
    /// [`EngineError::ChangeUndelivered`]: the wallet is then short by more
    /// than `amount`, which callers that measure the wallet will see.
    pub fn take(&self, wallet: &Wallet, amount: u64) -> Result<(), EngineError> {
        if amount == 0 {
            return Ok(());
        }
        let available = self.total_value(wallet);
        if available < amount {
            return Err(EngineError::InsufficientFunds {
                available,
                requested: amount,
            });
        }

        let mut remaining = i128::from(amount);
        for denomination in self.table.descending() {
            for (_, container) in wallet.containers() {
                if remaining <= 0 {
                    break;
                }
                remaining = remove_value(container, denomination, remaining)?;
            }
        }

        if remaining > 0 {
            // Coins vanished between the balance check and the removal.
            let removed = u64::try_from(i128::from(amount) - remaining).map_err(|_| EngineError::Overflow)?;
            return Err(EngineError::InsufficientFunds {
                available: removed,
                requested: amount,
            });
        }
        if remaining < 0 {
            let change = u64::try_from(-remaining).map_err(|_| EngineError::Overflow)?;
            tracing::debug!(amount, change, "returning change after overshoot");
            self.give(wallet, change)
                .map_err(|_| EngineError::ChangeUndelivered {
                    requested: amount,
                    change,
                })?;
        }
        Ok(())
    }

    /// Removes exactly `count` coins of one denomination, Storage first.
    ///
    /// Fails without touching the wallet when fewer than `count` units are
    /// held. If units disappear mid-removal the error reports how many were
    /// actually found; those are gone from the wallet.
    pub fn take_exact(
        &self,
        wallet: &Wallet,
        id: &DenominationId,
        count: u64,
    ) -> Result<(), EngineError> {
        let denomination = self.denomination(id)?;
        if count == 0 {
            return Ok(());
        }
        let held = self.holdings(wallet).count_of(id);
        if held < count {
            return Err(EngineError::InsufficientUnits {
                denomination: denomination.id.clone(),
                available: held,
                requested: count,
            });
        }

        let mut remaining = count;
        for (_, container) in wallet.containers() {
            if remaining == 0 {
                break;
            }
            remaining = remove_units(container, denomination, remaining)?;
        }
        if remaining > 0 {
            return Err(EngineError::InsufficientUnits {
                denomination: denomination.id.clone(),
                available: count - remaining,
                requested: count,
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Consolidate
    // -----------------------------------------------------------------------

    /// Removes every coin stack from the wallet and returns the value removed.
    ///
    /// A slot failure stops the sweep with [`EngineError::RemovalStalled`],
    /// which carries the value already cleared.
    pub fn remove_all(&self, wallet: &Wallet) -> Result<u64, EngineError> {
        let mut removed = 0u64;
        for (_, container) in wallet.containers() {
            for index in 0..container.capacity() {
                let Some(stack) = container.slot(index) else {
                    continue;
                };
                if let Some(d) = self.table.by_item_id(&stack.item_id) {
                    if let Err(source) = container.clear_slot(index) {
                        return Err(EngineError::RemovalStalled { removed, source });
                    }
                    removed = removed.saturating_add(d.value.saturating_mul(u64::from(stack.quantity)));
                }
            }
        }
        Ok(removed)
    }

    /// Collapses fragmented stacks into the canonical breakdown.
    ///
    /// Empties the wallet of coins and gives the total back. If the removal
    /// stalls or the re-give does not fit, the original coin stacks are put
    /// back and the error is returned; total value is unchanged either way.
    pub fn consolidate(&self, wallet: &Wallet) -> Result<u64, EngineError> {
        let before = self.total_value(wallet);
        if before == 0 {
            return Ok(0);
        }
        let saved = self.coin_slots(wallet);

        let removed = match self.remove_all(wallet) {
            Ok(removed) => removed,
            Err(err) => {
                self.restore(wallet, saved, before);
                tracing::warn!(value = before, error = %err, "consolidation removal stalled, stacks restored");
                return Err(err);
            }
        };
        match self.give(wallet, removed) {
            Ok(()) => {
                tracing::debug!(value = removed, "wallet consolidated");
                Ok(removed)
            }
            Err(err) => {
                match self.remove_all(wallet) {
                    Ok(_) => self.restore(wallet, saved, before),
                    Err(clear_err) => {
                        // Part of the re-give is stuck in place; top up to the old total instead.
                        let owed = before.saturating_sub(self.total_value(wallet));
                        if let Err(give_err) = self.give(wallet, owed) {
                            tracing::error!(
                                owed,
                                error = %clear_err,
                                give_error = %give_err,
                                "could not return coins after failed consolidation"
                            );
                        }
                    }
                }
                tracing::warn!(value = before, error = %err, "consolidation did not fit, stacks restored");
                Err(err)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internal Helpers
    // -----------------------------------------------------------------------

    fn denomination(&self, id: &DenominationId) -> Result<&Denomination, EngineError> {
        self.table
            .get(id)
            .ok_or_else(|| EngineError::UnknownDenomination(id.clone()))
    }

    fn coin_slots(&self, wallet: &Wallet) -> Vec<(ContainerRole, usize, ItemStack)> {
        let mut saved = Vec::new();
        for (role, container) in wallet.containers() {
            for (index, slot) in container.snapshot().into_iter().enumerate() {
                if let Some(stack) = slot.filter(|s| self.table.is_coin(&s.item_id)) {
                    saved.push((role, index, stack));
                }
            }
        }
        saved
    }

    /// Puts saved stacks back. Slots that still hold their stack are left
    /// alone, so only what was actually cleared is returned.
    fn restore(&self, wallet: &Wallet, saved: Vec<(ContainerRole, usize, ItemStack)>, expected: u64) {
        for (role, index, stack) in saved {
            let Some(container) = wallet.container(role) else {
                continue;
            };
            let restored = match container.slot(index) {
                Some(current) if current == stack => true,
                Some(_) => false,
                None => container.set_slot(index, stack.clone()).is_ok(),
            };
            if !restored && !wallet.delivery_targets().any(|c| c.add_stack(&stack).is_ok()) {
                tracing::error!(
                    item = %stack.item_id,
                    quantity = stack.quantity,
                    "could not restore coin stack after failed consolidation"
                );
            }
        }
        let total = self.total_value(wallet);
        if total != expected {
            tracing::error!(expected, total, "wallet value differs after restoring coin stacks");
        }
    }
}

/// Size of the next stack when splitting `remaining` units.
fn chunk(remaining: u64) -> u32 {
    u32::try_from(remaining.min(u64::from(MAX_STACK))).unwrap_or(MAX_STACK)
}

/// Removes up to `remaining` value of one denomination from a container.
/// Returns what is still owed; negative means the last partial removal
/// overshot.
fn remove_value(
    container: &dyn ItemContainer,
    denomination: &Denomination,
    mut remaining: i128,
) -> Result<i128, ContainerError> {
    let tier_value = i128::from(denomination.value);
    for index in 0..container.capacity() {
        if remaining <= 0 {
            break;
        }
        let Some(stack) = container.slot(index) else {
            continue;
        };
        if stack.item_id != denomination.id.as_str() {
            continue;
        }
        let quantity = i128::from(stack.quantity);
        let stack_value = tier_value * quantity;
        if stack_value <= remaining {
            container.clear_slot(index)?;
            remaining -= stack_value;
        } else {
            // Round up so at least the owed value leaves the wallet.
            let coins = (remaining + tier_value - 1) / tier_value;
            let left = quantity - coins;
            if left > 0 {
                container.set_slot(index, stack.with_quantity(left as u32))?;
            } else {
                container.clear_slot(index)?;
            }
            remaining -= coins * tier_value;
        }
    }
    Ok(remaining)
}

/// Removes up to `remaining` units of one denomination from a container.
fn remove_units(
    container: &dyn ItemContainer,
    denomination: &Denomination,
    mut remaining: u64,
) -> Result<u64, ContainerError> {
    for index in 0..container.capacity() {
        if remaining == 0 {
            break;
        }
        let Some(stack) = container.slot(index) else {
            continue;
        };
        if stack.item_id != denomination.id.as_str() {
            continue;
        }
        let quantity = u64::from(stack.quantity);
        if quantity <= remaining {
            container.clear_slot(index)?;
            remaining -= quantity;
        } else {
            container.set_slot(index, stack.with_quantity((quantity - remaining) as u32))?;
            remaining = 0;
        }
    }
    Ok(remaining)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
