//! Insertion-ordered participant registry.
//!
//! An index-tracked arena: the identity sequence keeps insertion order
//! for deterministic iteration, and a side index gives O(1) membership
//! checks and O(1) removal via swap-with-last-and-truncate.

use std::collections::HashMap;
use tranche_types::Identity;

#[derive(Clone, Debug, Default)]
pub struct Registry {
    order: Vec<Identity>,
    index: HashMap<Identity, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.index.contains_key(identity)
    }

    /// Append an identity. Returns `false` if it was already present.
    pub fn insert(&mut self, identity: Identity) -> bool {
        if self.index.contains_key(&identity) {
            return false;
        }
        self.index.insert(identity.clone(), self.order.len());
        self.order.push(identity);
        true
    }

    /// Remove an identity by swapping the last entry into its slot and
    /// truncating. Iteration order is not preserved. Returns `false` if
    /// the identity was not present.
    pub fn remove(&mut self, identity: &Identity) -> bool {
        let Some(slot) = self.index.remove(identity) else {
            return false;
        };
        self.order.swap_remove(slot);
        if let Some(moved) = self.order.get(slot) {
            self.index.insert(moved.clone(), slot);
        }
        true
    }

    /// Iterate identities in insertion order (modulo swap-removal).
    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.order.iter()
    }
}
