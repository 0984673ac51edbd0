//! Update listener registry.
//!
//! DESIGN
//! ======
//! Two scopes share one id space: broadcast listeners see every update,
//! entity listeners sit in a table keyed by entity id and only see updates
//! for that key. Dispatch snapshots the matching callbacks and returns them
//! so the caller can invoke them after releasing its lock.

use std::collections::HashMap;
use std::sync::Arc;

use tripsync_protocol::{EntityKey, EntityUpdate};

/// Callback invoked for each delivered update.
pub type UpdateCallback = Arc<dyn Fn(&EntityUpdate) + Send + Sync>;

/// Handle returned on registration; pass to `off_update` to remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerScope {
    Broadcast,
    Entity(EntityKey),
}

#[derive(Default)]
pub struct ListenerRegistry {
    next_id: u64,
    broadcast: Vec<(ListenerId, UpdateCallback)>,
    by_entity: HashMap<EntityKey, Vec<(ListenerId, UpdateCallback)>>,
    scopes: HashMap<ListenerId, ListenerScope>,
}

impl ListenerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scope: ListenerScope, callback: UpdateCallback) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        match &scope {
            ListenerScope::Broadcast => self.broadcast.push((id, callback)),
            ListenerScope::Entity(key) => self.by_entity.entry(key.clone()).or_default().push((id, callback)),
        }
        self.scopes.insert(id, scope);
        id
    }

    /// Remove a listener. Returns `false` if the id was not registered.
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let Some(scope) = self.scopes.remove(&id) else {
            return false;
        };
        match scope {
            ListenerScope::Broadcast => self.broadcast.retain(|(lid, _)| *lid != id),
            ListenerScope::Entity(key) => {
                if let Some(list) = self.by_entity.get_mut(&key) {
                    list.retain(|(lid, _)| *lid != id);
                    if list.is_empty() {
                        self.by_entity.remove(&key);
                    }
                }
            }
        }
        true
    }

    /// Callbacks interested in an update for `key`: entity listeners first,
    /// then broadcast listeners, each in registration order.
    #[must_use]
    pub fn matching(&self, key: &EntityKey) -> Vec<UpdateCallback> {
        let entity = self.by_entity.get(key).into_iter().flatten();
        entity.chain(self.broadcast.iter()).map(|(_, cb)| Arc::clone(cb)).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn clear(&mut self) {
        self.broadcast.clear();
        self.by_entity.clear();
        self.scopes.clear();
    }
}

#[cfg(test)]
#[path = "listeners_test.rs"]
mod tests;
