//! Desired-subscription bookkeeping.
//!
//! Each key carries a holder count so several views can watch the same trip
//! through one room membership. Only the 0→1 and 1→0 transitions produce
//! wire traffic; everything in between is local.

use std::collections::BTreeMap;

use tripsync_protocol::EntityKey;

/// What a subscribe/unsubscribe call changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomChange {
    /// First holder: the room must be joined.
    Joined,
    /// Last holder gone: the room must be left.
    Left,
    /// Holder count moved but membership did not.
    Unchanged,
    /// Unsubscribe for a key nobody holds.
    Unknown,
}

#[derive(Debug, Default, Clone)]
pub struct RoomSet {
    holders: BTreeMap<EntityKey, usize>,
}

impl RoomSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self, key: &EntityKey) -> RoomChange {
        let count = self.holders.entry(key.clone()).or_insert(0);
        *count += 1;
        if *count == 1 { RoomChange::Joined } else { RoomChange::Unchanged }
    }

    pub fn release(&mut self, key: &EntityKey) -> RoomChange {
        let Some(count) = self.holders.get_mut(key) else {
            return RoomChange::Unknown;
        };
        *count -= 1;
        if *count == 0 {
            self.holders.remove(key);
            RoomChange::Left
        } else {
            RoomChange::Unchanged
        }
    }

    #[must_use]
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.holders.contains_key(key)
    }

    #[must_use]
    pub fn holders(&self, key: &EntityKey) -> usize {
        self.holders.get(key).copied().unwrap_or(0)
    }

    /// Keys with at least one holder, in stable order.
    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.holders.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.holders.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }

    pub fn clear(&mut self) {
        self.holders.clear();
    }
}

#[cfg(test)]
#[path = "rooms_test.rs"]
mod tests;
