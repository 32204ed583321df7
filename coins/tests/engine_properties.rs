//! Property-style integration tests for the denomination engine.
//!
//! These exercise the public surface only: a table, an engine, a capacity
//! calculator and in-memory containers. Amounts come from a seeded RNG so
//! failures are reproducible.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use coinvault_coins::{
    CapacityCalculator, CoinEngine, Denomination, DenominationTable, ItemContainer, ItemStack,
    SlotContainer, Wallet,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn standard() -> Arc<DenominationTable> {
    Arc::new(DenominationTable::standard())
}

/// Minimum coin count for `amount` by exhaustive change-making.
fn min_coins_dp(values: &[u64], amount: usize) -> u64 {
    let mut best = vec![u64::MAX; amount + 1];
    best[0] = 0;
    for a in 1..=amount {
        for &v in values {
            let v = v as usize;
            if v <= a && best[a - v] != u64::MAX {
                best[a] = best[a].min(best[a - v] + 1);
            }
        }
    }
    best[amount]
}

// ---------------------------------------------------------------------------
// Breakdown
// ---------------------------------------------------------------------------

#[test]
fn breakdown_sums_to_amount() {
    let table = standard();
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..2_000 {
        let amount = rng.gen_range(0..u64::MAX / 2);
        assert_eq!(table.breakdown(amount).total_value(), amount);
    }
}

#[test]
fn breakdown_is_minimal_for_standard_chain() {
    let table = standard();
    let values: Vec<u64> = table.ascending().iter().map(|d| d.value).collect();
    for amount in (0..25_000usize).step_by(7) {
        assert_eq!(
            table.breakdown(amount as u64).coin_count(),
            min_coins_dp(&values, amount),
            "amount {amount}"
        );
    }
}

#[test]
fn breakdown_is_minimal_for_custom_dividing_chain() {
    // 1, 2, 6, 30: each divides the next but the ratios vary.
    let table = DenominationTable::new(vec![
        Denomination::new("T1", "t1", 1, "T1"),
        Denomination::new("T2", "t2", 2, "T2"),
        Denomination::new("T6", "t6", 6, "T6"),
        Denomination::new("T30", "t30", 30, "T30"),
    ])
    .unwrap();
    let values = [1, 2, 6, 30];
    for amount in 0..500usize {
        assert_eq!(table.breakdown(amount as u64).coin_count(), min_coins_dp(&values, amount));
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[test]
fn give_then_take_restores_value() {
    let engine = CoinEngine::new(standard());
    let mut rng = StdRng::seed_from_u64(11);

    for _ in 0..200 {
        let wallet = Wallet::new(SlotContainer::shared(36));
        let base = rng.gen_range(0..5_000_000);
        engine.give(&wallet, base).unwrap();
        let before = engine.total_value(&wallet);

        let amount = rng.gen_range(0..5_000_000);
        engine.give(&wallet, amount).unwrap();
        engine.take(&wallet, amount).unwrap();

        assert_eq!(engine.total_value(&wallet), before);
    }
}

#[test]
fn consolidate_preserves_value() {
    let table = standard();
    let engine = CoinEngine::new(table.clone());
    let mut rng = StdRng::seed_from_u64(13);

    for _ in 0..100 {
        let storage = SlotContainer::shared(36);
        // Fragment: several small stacks of random tiers.
        for slot in 0..rng.gen_range(1..20) {
            let tier = &table.ascending()[rng.gen_range(0..table.len())];
            storage
                .set_slot(slot, ItemStack::new(tier.id.as_str(), rng.gen_range(1..=999)))
                .unwrap();
        }
        let wallet = Wallet::new(storage);
        let before = engine.total_value(&wallet);

        for _ in 0..3 {
            engine.consolidate(&wallet).unwrap();
            assert_eq!(engine.total_value(&wallet), before);
        }
    }
}

#[test]
fn capacity_check_predicts_give() {
    let table = standard();
    let engine = CoinEngine::new(table.clone());
    let calc = CapacityCalculator::new(table);
    let mut rng = StdRng::seed_from_u64(17);

    for _ in 0..300 {
        let storage = SlotContainer::shared(6);
        for slot in 0..rng.gen_range(0..6) {
            storage.set_slot(slot, ItemStack::new("Dirt", 1)).unwrap();
        }
        let wallet = Wallet::new(storage);
        let amount = rng.gen_range(0..10_000_000);

        let report = calc.can_fit(&wallet, amount);
        let outcome = engine.give(&wallet, amount);
        if report.fits {
            assert!(outcome.is_ok(), "amount {amount} predicted to fit");
            assert_eq!(engine.total_value(&wallet), amount);
        }
    }
}
