// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # CoinVault Coins: Denomination Engine
//!
//! Value in CoinVault lives in two places at once: as physical coin stacks
//! sitting in a player's containers, and as a plain number in an external
//! ledger (the "bank"). This crate owns the physical side and the contract
//! with the ledger. The transaction coordinator that moves value between the
//! two lives in `coinvault-escrow`.
//!
//! ## Architecture
//!
//! ```text
//! config.rs      : constants and the JSON denomination config
//! denomination.rs: the validated tier table and canonical breakdown
//! identity.rs    : the identity key shared by wallets, ledger and locks
//! container.rs   : slot containers and the multi-container wallet
//! engine.rs      : give / take / exact variants / consolidate
//! capacity.rs    : read-only feasibility analysis
//! ledger.rs      : ledger client contract and an in-memory ledger
//! ```
//!
//! ## Design Principles
//!
//! 1. **All amounts are `u64` base units.** The lowest tier is always worth
//!    exactly 1, so every amount has an exact coin representation.
//! 2. **Tiers divide each other.** The table refuses to load otherwise,
//!    because greedy breakdown is only optimal under that property.
//! 3. **Capacity is checked, never assumed.** Mutations that add coins are
//!    preceded by a capacity analysis; the engine reports failures instead
//!    of silently dropping stacks.
//! 4. **The engine never touches the ledger.** Moving value across the
//!    wallet/ledger boundary is the escrow coordinator's job.

pub mod capacity;
pub mod config;
pub mod container;
pub mod denomination;
pub mod engine;
pub mod identity;
pub mod ledger;

pub use capacity::{CapacityCalculator, SpaceReport, StackInfo};
pub use config::{CoinConfig, ConfigError};
pub use container::{ContainerError, ContainerRole, ItemContainer, ItemStack, SlotContainer, Wallet};
pub use denomination::{Breakdown, Denomination, DenominationId, DenominationTable, TableError};
pub use engine::{CoinEngine, EngineError, Holdings};
pub use identity::Identity;
pub use ledger::{InMemoryLedger, LedgerClient, LedgerEntry, LedgerError, LedgerOp};
