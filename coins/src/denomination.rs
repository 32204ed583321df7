//! # Denomination Table
//!
//! A [`DenominationTable`] is the ordered chain of coin tiers a deployment
//! uses. It is loaded at startup (see [`crate::config`]) instead of being a
//! closed enum, so servers can retune tiers without a rebuild.
//!
//! The table enforces one structural rule on load: every tier's value is an
//! integer multiple of the tier below it, and the lowest tier is worth 1.
//! Under that rule the greedy breakdown in [`DenominationTable::breakdown`]
//! is the minimum-coin representation of any amount. A chain that breaks
//! the rule would need dynamic-programming change-making instead, so the
//! table rejects it outright.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Reasons a tier list cannot become a [`DenominationTable`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    /// No enabled tiers at all.
    #[error("denomination table is empty")]
    Empty,

    /// A tier declared a value of zero.
    #[error("denomination {0} has value 0")]
    ZeroValue(DenominationId),

    /// The lowest tier must be worth exactly one base unit.
    #[error("lowest denomination {id} is worth {value}, expected 1")]
    BaseNotUnit {
        /// The lowest tier.
        id: DenominationId,
        /// Its configured value.
        value: u64,
    },

    /// Two tiers share the same value.
    #[error("denominations {lower} and {upper} both have value {value}")]
    DuplicateValue {
        /// First tier with the value.
        lower: DenominationId,
        /// Second tier with the value.
        upper: DenominationId,
        /// The shared value.
        value: u64,
    },

    /// A tier's value is not an integer multiple of the tier below it.
    #[error("denomination {upper} ({upper_value}) is not a multiple of {lower} ({lower_value})")]
    RatioViolation {
        /// The lower tier.
        lower: DenominationId,
        /// Value of the lower tier.
        lower_value: u64,
        /// The higher tier.
        upper: DenominationId,
        /// Value of the higher tier.
        upper_value: u64,
    },

    /// Two tiers share an item id.
    #[error("duplicate denomination item id {0}")]
    DuplicateId(DenominationId),

    /// Two tiers share a config name.
    #[error("duplicate denomination name {0}")]
    DuplicateName(String),
}

// ---------------------------------------------------------------------------
// DenominationId
// ---------------------------------------------------------------------------

/// The item id of a coin kind, e.g. `Coin_Gold`.
///
/// This is the same string the container store uses for the items in its
/// slots, so a slot holds a coin exactly when its item id is in the table.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DenominationId(String);

impl DenominationId {
    /// Creates an id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw item id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DenominationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DenominationId({})", self.0)
    }
}

impl fmt::Display for DenominationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DenominationId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ---------------------------------------------------------------------------
// Denomination
// ---------------------------------------------------------------------------

/// One tier of the chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denomination {
    /// Item id used in container slots.
    pub id: DenominationId,
    /// Config key, lowercase (`"gold"`).
    pub name: String,
    /// Worth of one coin in base units.
    pub value: u64,
    /// Name shown to players (`"Gold"`).
    pub display_name: String,
}

impl Denomination {
    /// Builds a tier from its parts.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        value: u64,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            id: DenominationId::new(id),
            name: name.into(),
            value,
            display_name: display_name.into(),
        }
    }

    /// Value of `count` coins of this tier, or `None` on overflow.
    pub fn value_of(&self, count: u64) -> Option<u64> {
        self.value.checked_mul(count)
    }
}

// ---------------------------------------------------------------------------
// DenominationTable
// ---------------------------------------------------------------------------

/// Validated, ascending chain of denominations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DenominationTable {
    tiers: Vec<Denomination>,
}

impl DenominationTable {
    /// Sorts `tiers` by value and validates the chain.
    ///
    /// # Errors
    ///
    /// Any [`TableError`] describing the first rule the chain breaks.
    pub fn new(mut tiers: Vec<Denomination>) -> Result<Self, TableError> {
        if tiers.is_empty() {
            return Err(TableError::Empty);
        }
        tiers.sort_by_key(|d| d.value);

        if let Some(zero) = tiers.iter().find(|d| d.value == 0) {
            return Err(TableError::ZeroValue(zero.id.clone()));
        }

        let base = &tiers[0];
        if base.value != 1 {
            return Err(TableError::BaseNotUnit {
                id: base.id.clone(),
                value: base.value,
            });
        }

        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for tier in &tiers {
            if !ids.insert(tier.id.clone()) {
                return Err(TableError::DuplicateId(tier.id.clone()));
            }
            if !names.insert(tier.name.to_lowercase()) {
                return Err(TableError::DuplicateName(tier.name.clone()));
            }
        }

        for pair in tiers.windows(2) {
            let (lower, upper) = (&pair[0], &pair[1]);
            if lower.value == upper.value {
                return Err(TableError::DuplicateValue {
                    lower: lower.id.clone(),
                    upper: upper.id.clone(),
                    value: lower.value,
                });
            }
            if upper.value % lower.value != 0 {
                return Err(TableError::RatioViolation {
                    lower: lower.id.clone(),
                    lower_value: lower.value,
                    upper: upper.id.clone(),
                    upper_value: upper.value,
                });
            }
        }

        Ok(Self { tiers })
    }

    /// The six-tier ore chain: Copper 1 up to Adamantite 100 000.
    pub fn standard() -> Self {
        Self {
            tiers: vec![
                Denomination::new("Coin_Copper", "copper", 1, "Copper"),
                Denomination::new("Coin_Iron", "iron", 10, "Iron"),
                Denomination::new("Coin_Cobalt", "cobalt", 100, "Cobalt"),
                Denomination::new("Coin_Gold", "gold", 1_000, "Gold"),
                Denomination::new("Coin_Mithril", "mithril", 10_000, "Mithril"),
                Denomination::new("Coin_Adamantite", "adamantite", 100_000, "Adamantite"),
            ],
        }
    }

    /// Tiers from lowest to highest value.
    pub fn ascending(&self) -> &[Denomination] {
        &self.tiers
    }

    /// Tiers from highest to lowest value.
    pub fn descending(&self) -> impl Iterator<Item = &Denomination> {
        self.tiers.iter().rev()
    }

    /// The unit tier (value 1).
    pub fn base(&self) -> &Denomination {
        &self.tiers[0]
    }

    /// Number of tiers.
    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    /// Always `false`; a validated table has at least one tier.
    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Looks up a tier by item id.
    pub fn get(&self, id: &DenominationId) -> Option<&Denomination> {
        self.tiers.iter().find(|d| &d.id == id)
    }

    /// Looks up a tier by an item id string.
    pub fn by_item_id(&self, item_id: &str) -> Option<&Denomination> {
        self.tiers.iter().find(|d| d.id.as_str() == item_id)
    }

    /// Returns `true` if `item_id` is a coin of this table.
    pub fn is_coin(&self, item_id: &str) -> bool {
        self.by_item_id(item_id).is_some()
    }

    /// Resolves user input: exact item id, or config name / display name
    /// compared case-insensitively.
    pub fn resolve(&self, query: &str) -> Option<&Denomination> {
        self.by_item_id(query).or_else(|| {
            self.tiers.iter().find(|d| {
                d.name.eq_ignore_ascii_case(query) || d.display_name.eq_ignore_ascii_case(query)
            })
        })
    }

    /// Canonical minimal-count representation of `amount`.
    ///
    /// Walks tiers from highest to lowest, taking as many of each as fit.
    /// Terminates with nothing left over because the base tier is worth 1.
    pub fn breakdown(&self, amount: u64) -> Breakdown {
        let mut remaining = amount;
        let mut entries = Vec::new();
        for tier in self.descending() {
            if remaining == 0 {
                break;
            }
            let count = remaining / tier.value;
            if count > 0 {
                entries.push((tier.clone(), count));
                remaining %= tier.value;
            }
        }
        debug_assert_eq!(remaining, 0);
        Breakdown { entries }
    }

    /// Fewest `source` coins whose value reaches one `destination` coin.
    pub fn min_units_for(&self, source: &Denomination, destination: &Denomination) -> u64 {
        destination.value.div_ceil(source.value)
    }
}

// ---------------------------------------------------------------------------
// Breakdown
// ---------------------------------------------------------------------------

/// Coin counts per tier, highest tier first, zero counts omitted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Breakdown {
    entries: Vec<(Denomination, u64)>,
}

impl Breakdown {
    /// `(tier, count)` pairs, highest tier first.
    pub fn iter(&self) -> impl Iterator<Item = (&Denomination, u64)> {
        self.entries.iter().map(|(d, c)| (d, *c))
    }

    /// Count for one tier (0 if absent).
    pub fn count_of(&self, id: &DenominationId) -> u64 {
        self.entries
            .iter()
            .find(|(d, _)| &d.id == id)
            .map(|(_, c)| *c)
            .unwrap_or(0)
    }

    /// Weighted sum of the counts.
    pub fn total_value(&self) -> u64 {
        self.entries
            .iter()
            .map(|(d, c)| d.value.saturating_mul(*c))
            .fold(0u64, u64::saturating_add)
    }

    /// Total number of coins.
    pub fn coin_count(&self) -> u64 {
        self.entries.iter().map(|(_, c)| *c).sum()
    }

    /// Returns `true` for the breakdown of zero.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
