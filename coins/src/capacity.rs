//! # Capacity Calculator
//!
//! Read-only feasibility analysis over a wallet's Storage container.
//!
//! The coordinator runs these checks twice per transaction: once before any
//! mutation, so it can reject the whole operation cleanly, and again right
//! before the final delivery, because game events may have changed the
//! container in between.
//!
//! Only Storage is analyzed. Exact deliveries go to Storage alone, and for
//! `give` the Hotbar fallback only adds room, so a passing check is always
//! sufficient.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::config::MAX_STACK;
use crate::container::{ItemStack, Wallet};
use crate::denomination::{DenominationId, DenominationTable};

/// Per-denomination stack state of one container.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StackInfo {
    /// Units across all stacks.
    pub total_quantity: u64,
    /// Number of slots holding this denomination.
    pub stack_count: usize,
    /// Units that could still be merged into those stacks.
    pub spare_in_existing: u64,
}

/// Outcome of a fit check.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpaceReport {
    /// Whether the candidate coins fit.
    pub fits: bool,
    /// Empty slots the placement would consume.
    pub new_slots_needed: usize,
    /// Empty slots currently available.
    pub free_slots: usize,
    /// Units absorbed by existing stacks.
    pub filled_in_existing: u64,
    /// Units that need fresh slots.
    pub filled_in_new_slots: u64,
}

/// Capacity analysis bound to one denomination table.
#[derive(Clone, Debug)]
pub struct CapacityCalculator {
    table: Arc<DenominationTable>,
}

impl CapacityCalculator {
    /// Creates a calculator over `table`.
    pub fn new(table: Arc<DenominationTable>) -> Self {
        Self { table }
    }

    /// Classifies every coin stack in Storage by denomination.
    pub fn analyze(&self, wallet: &Wallet) -> BTreeMap<DenominationId, StackInfo> {
        let mut info: BTreeMap<DenominationId, StackInfo> = BTreeMap::new();
        for stack in wallet.storage().snapshot().into_iter().flatten() {
            let Some(d) = self.table.by_item_id(&stack.item_id) else {
                continue;
            };
            let entry = info.entry(d.id.clone()).or_default();
            entry.total_quantity += u64::from(stack.quantity);
            entry.stack_count += 1;
            entry.spare_in_existing += u64::from(MAX_STACK.saturating_sub(stack.quantity));
        }
        info
    }

    /// Whether the canonical breakdown of `amount` fits into Storage.
    pub fn can_fit(&self, wallet: &Wallet, amount: u64) -> SpaceReport {
        let breakdown = self.table.breakdown(amount);
        let items = breakdown.iter().map(|(d, count)| (d.id.as_str(), count));
        plan(&wallet.storage().snapshot(), items)
    }

    /// Whether `count` units of one denomination fit into Storage.
    pub fn can_fit_exact(&self, wallet: &Wallet, denomination: &DenominationId, count: u64) -> SpaceReport {
        plan(
            &wallet.storage().snapshot(),
            std::iter::once((denomination.as_str(), count)),
        )
    }

    /// Upper bound on units of `denomination` Storage could absorb.
    pub fn total_capacity_for(&self, wallet: &Wallet, denomination: &DenominationId) -> u64 {
        let slots = wallet.storage().snapshot();
        let free = slots.iter().filter(|s| s.is_none()).count() as u64;
        free.saturating_mul(u64::from(MAX_STACK))
            .saturating_add(spare_for(&slots, denomination.as_str()))
    }

    /// Empty slots in Storage.
    pub fn free_slots(&self, wallet: &Wallet) -> usize {
        wallet.storage().free_slots()
    }

    /// One line per denomination held, then the free slot count.
    pub fn summary(&self, wallet: &Wallet) -> String {
        let mut out = String::new();
        for (id, info) in self.analyze(wallet) {
            let _ = writeln!(
                out,
                "{id}: {} in {} stack(s), {} spare",
                info.total_quantity, info.stack_count, info.spare_in_existing
            );
        }
        let _ = write!(out, "free slots: {}", self.free_slots(wallet));
        out
    }
}

fn spare_for(slots: &[Option<ItemStack>], item_id: &str) -> u64 {
    slots
        .iter()
        .flatten()
        .filter(|s| s.item_id == item_id)
        .map(|s| u64::from(MAX_STACK.saturating_sub(s.quantity)))
        .sum()
}

/// Merge into spare room first, then `ceil(overflow / MAX_STACK)` new slots
/// per item. Mirrors how `ItemContainer::add_stack` places stacks.
fn plan<'a>(slots: &[Option<ItemStack>], items: impl Iterator<Item = (&'a str, u64)>) -> SpaceReport {
    let free_slots = slots.iter().filter(|s| s.is_none()).count();
    let mut report = SpaceReport {
        free_slots,
        ..SpaceReport::default()
    };
    let mut slots_needed: u64 = 0;
    for (item_id, count) in items {
        let absorbed = count.min(spare_for(slots, item_id));
        let overflow = count - absorbed;
        report.filled_in_existing += absorbed;
        report.filled_in_new_slots += overflow;
        slots_needed = slots_needed.saturating_add(overflow.div_ceil(u64::from(MAX_STACK)));
    }
    report.new_slots_needed = usize::try_from(slots_needed).unwrap_or(usize::MAX);
    report.fits = slots_needed <= free_slots as u64;
    report
}
