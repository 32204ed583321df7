//! # Containers & Wallets
//!
//! The container store is owned by the host (the game's inventory system).
//! The core sees it through [`ItemContainer`]: a fixed number of slots, each
//! empty or holding one [`ItemStack`]. Slots may hold anything; a stack is a
//! coin only when its item id is in the denomination table.
//!
//! A [`Wallet`] is the union of up to three containers with fixed roles.
//! Iteration order is always Storage, Hotbar, Backpack. Containers are
//! shared (`Arc`) because game events may mutate them while a transaction
//! is running; implementations use interior mutability and must be
//! `Send + Sync`.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::config::MAX_STACK;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors reported by a container store.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContainerError {
    /// The slot index is past the container's capacity.
    #[error("slot {index} out of range (capacity {capacity})")]
    SlotOutOfRange {
        /// Requested slot.
        index: usize,
        /// Container capacity.
        capacity: usize,
    },

    /// Not enough free slots or stack room for the whole stack.
    #[error("no room for {quantity} x {item_id}")]
    NoRoom {
        /// Item being placed.
        item_id: String,
        /// Quantity that did not fit.
        quantity: u32,
    },

    /// A slot write exceeded the maximum stack size.
    #[error("stack of {quantity} exceeds max stack {max}")]
    Oversized {
        /// Requested quantity.
        quantity: u32,
        /// Maximum allowed.
        max: u32,
    },
}

// ---------------------------------------------------------------------------
// ItemStack
// ---------------------------------------------------------------------------

/// A quantity of one item occupying one slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStack {
    /// Item id (a denomination id for coins).
    pub item_id: String,
    /// Units in the stack.
    pub quantity: u32,
}

impl ItemStack {
    /// Creates a stack.
    pub fn new(item_id: impl Into<String>, quantity: u32) -> Self {
        Self {
            item_id: item_id.into(),
            quantity,
        }
    }

    /// Same item, different quantity.
    pub fn with_quantity(&self, quantity: u32) -> Self {
        Self {
            item_id: self.item_id.clone(),
            quantity,
        }
    }

    /// A zero-quantity stack is treated as an empty slot.
    pub fn is_empty(&self) -> bool {
        self.quantity == 0
    }
}

// ---------------------------------------------------------------------------
// ItemContainer
// ---------------------------------------------------------------------------

/// A fixed-capacity sequence of slots.
///
/// All methods take `&self`; implementations serialize their own mutations.
/// Only [`add_stack`](Self::add_stack) is required to be atomic as a whole.
pub trait ItemContainer: Send + Sync {
    /// Number of slots.
    fn capacity(&self) -> usize;

    /// Contents of a slot, `None` when empty or out of range.
    fn slot(&self, index: usize) -> Option<ItemStack>;

    /// Overwrites a slot. A zero-quantity stack clears the slot.
    fn set_slot(&self, index: usize, stack: ItemStack) -> Result<(), ContainerError>;

    /// Empties a slot, returning what was there.
    fn clear_slot(&self, index: usize) -> Result<Option<ItemStack>, ContainerError>;

    /// Places a whole stack: first merging into existing stacks of the same
    /// item that have room, then into empty slots. Either all of it lands or
    /// nothing changes.
    fn add_stack(&self, stack: &ItemStack) -> Result<(), ContainerError>;

    /// Copy of every slot, in order.
    fn snapshot(&self) -> Vec<Option<ItemStack>> {
        (0..self.capacity()).map(|i| self.slot(i)).collect()
    }

    /// Number of empty slots.
    fn free_slots(&self) -> usize {
        self.snapshot().iter().filter(|s| s.is_none()).count()
    }
}

// ---------------------------------------------------------------------------
// SlotContainer
// ---------------------------------------------------------------------------

/// In-memory container backed by a `Vec` behind a `parking_lot::RwLock`.
pub struct SlotContainer {
    slots: RwLock<Vec<Option<ItemStack>>>,
}

impl SlotContainer {
    /// An empty container with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: RwLock::new(vec![None; capacity]),
        }
    }

    /// Convenience for building shared containers.
    pub fn shared(capacity: usize) -> Arc<Self> {
        Arc::new(Self::new(capacity))
    }

    /// Puts a stack into the first empty slot, ignoring merge rules.
    /// Returns the slot index, or `None` if the container is full.
    pub fn put_in_free_slot(&self, stack: ItemStack) -> Option<usize> {
        let mut slots = self.slots.write();
        let index = slots.iter().position(|s| s.is_none())?;
        slots[index] = Some(stack);
        Some(index)
    }

    /// Fills every empty slot with `quantity` of `item_id`.
    pub fn fill_free_slots(&self, item_id: &str, quantity: u32) -> usize {
        let mut slots = self.slots.write();
        let mut filled = 0;
        for slot in slots.iter_mut().filter(|s| s.is_none()) {
            *slot = Some(ItemStack::new(item_id, quantity));
            filled += 1;
        }
        filled
    }

    fn check_index(index: usize, capacity: usize) -> Result<(), ContainerError> {
        if index >= capacity {
            return Err(ContainerError::SlotOutOfRange { index, capacity });
        }
        Ok(())
    }
}

impl fmt::Debug for SlotContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.read();
        f.debug_struct("SlotContainer")
            .field("capacity", &slots.len())
            .field("occupied", &slots.iter().filter(|s| s.is_some()).count())
            .finish()
    }
}

impl ItemContainer for SlotContainer {
    fn capacity(&self) -> usize {
        self.slots.read().len()
    }

    fn slot(&self, index: usize) -> Option<ItemStack> {
        self.slots.read().get(index).cloned().flatten()
    }

    fn set_slot(&self, index: usize, stack: ItemStack) -> Result<(), ContainerError> {
        let mut slots = self.slots.write();
        Self::check_index(index, slots.len())?;
        if stack.quantity > MAX_STACK {
            return Err(ContainerError::Oversized {
                quantity: stack.quantity,
                max: MAX_STACK,
            });
        }
        slots[index] = if stack.is_empty() { None } else { Some(stack) };
        Ok(())
    }

    fn clear_slot(&self, index: usize) -> Result<Option<ItemStack>, ContainerError> {
        let mut slots = self.slots.write();
        Self::check_index(index, slots.len())?;
        Ok(slots[index].take())
    }

    fn add_stack(&self, stack: &ItemStack) -> Result<(), ContainerError> {
        if stack.is_empty() {
            return Ok(());
        }
        let mut slots = self.slots.write();

        let room: u64 = slots
            .iter()
            .map(|slot| match slot {
                None => u64::from(MAX_STACK),
                Some(s) if s.item_id == stack.item_id => u64::from(MAX_STACK.saturating_sub(s.quantity)),
                Some(_) => 0,
            })
            .sum();
        if room < u64::from(stack.quantity) {
            return Err(ContainerError::NoRoom {
                item_id: stack.item_id.clone(),
                quantity: stack.quantity,
            });
        }

        let mut remaining = stack.quantity;
        for existing in slots.iter_mut().flatten() {
            if remaining == 0 {
                break;
            }
            if existing.item_id == stack.item_id && existing.quantity < MAX_STACK {
                let moved = remaining.min(MAX_STACK - existing.quantity);
                existing.quantity += moved;
                remaining -= moved;
            }
        }
        for slot in slots.iter_mut().filter(|s| s.is_none()) {
            if remaining == 0 {
                break;
            }
            let moved = remaining.min(MAX_STACK);
            *slot = Some(stack.with_quantity(moved));
            remaining -= moved;
        }
        debug_assert_eq!(remaining, 0);
        Ok(())
    }

    fn free_slots(&self) -> usize {
        self.slots.read().iter().filter(|s| s.is_none()).count()
    }
}

// ---------------------------------------------------------------------------
// Wallet
// ---------------------------------------------------------------------------

/// Which part of a wallet a container plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerRole {
    /// Main storage. Primary target for every delivery.
    Storage,
    /// Quick-access bar. Fallback target for `give`.
    Hotbar,
    /// Overflow pack. Counted and drained, never delivered to.
    Backpack,
}

impl fmt::Display for ContainerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerRole::Storage => write!(f, "storage"),
            ContainerRole::Hotbar => write!(f, "hotbar"),
            ContainerRole::Backpack => write!(f, "backpack"),
        }
    }
}

/// The containers that together hold one identity's coins.
#[derive(Clone)]
pub struct Wallet {
    storage: Arc<dyn ItemContainer>,
    hotbar: Option<Arc<dyn ItemContainer>>,
    backpack: Option<Arc<dyn ItemContainer>>,
}

impl Wallet {
    /// A wallet with only main storage.
    pub fn new(storage: Arc<dyn ItemContainer>) -> Self {
        Self {
            storage,
            hotbar: None,
            backpack: None,
        }
    }

    /// Adds a quick-access bar.
    pub fn with_hotbar(mut self, hotbar: Arc<dyn ItemContainer>) -> Self {
        self.hotbar = Some(hotbar);
        self
    }

    /// Adds an overflow pack.
    pub fn with_backpack(mut self, backpack: Arc<dyn ItemContainer>) -> Self {
        self.backpack = Some(backpack);
        self
    }

    /// Main storage.
    pub fn storage(&self) -> &dyn ItemContainer {
        self.storage.as_ref()
    }

    /// The container playing `role`, if the wallet has one.
    pub fn container(&self, role: ContainerRole) -> Option<&dyn ItemContainer> {
        match role {
            ContainerRole::Storage => Some(self.storage.as_ref()),
            ContainerRole::Hotbar => self.hotbar.as_deref(),
            ContainerRole::Backpack => self.backpack.as_deref(),
        }
    }

    /// Every container, Storage then Hotbar then Backpack.
    pub fn containers(&self) -> impl Iterator<Item = (ContainerRole, &dyn ItemContainer)> {
        [ContainerRole::Storage, ContainerRole::Hotbar, ContainerRole::Backpack]
            .into_iter()
            .filter_map(move |role| self.container(role).map(|c| (role, c)))
    }

    /// Containers `give` may place into, in preference order.
    pub fn delivery_targets(&self) -> impl Iterator<Item = &dyn ItemContainer> {
        std::iter::once(self.storage()).chain(self.container(ContainerRole::Hotbar))
    }
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Wallet");
        for (role, container) in self.containers() {
            d.field(&role.to_string(), &container.capacity());
        }
        d.finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
