//! The two ordered region maps.
//!
//! The current-address map owns the region entries and answers "which
//! region owns this current-run RIP" for the fetch and write paths. The
//! original-address map holds weak references keyed by each region's
//! original base and answers the inverse question for install-time
//! relocation. At rest both maps contain the same region set; updates hold
//! the locks in a fixed order, current map before original map.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::region::Region;

pub(crate) struct AddressMaps {
    /// F: current base → owning region.
    pub current: RwLock<BTreeMap<u64, Arc<Region>>>,
    /// G: original base → region.
    pub original: RwLock<BTreeMap<u64, Weak<Region>>>,
}

impl AddressMaps {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(BTreeMap::new()),
            original: RwLock::new(BTreeMap::new()),
        }
    }

    /// Find the region whose current span contains `rip`.
    pub fn find_current(&self, rip: u64) -> Option<Arc<Region>> {
        let map = self.current.read();
        let (_, region) = map.range(..=rip).next_back()?;
        region.contains_current(rip).then(|| Arc::clone(region))
    }

    /// Find a region by its exact current base.
    pub fn get_exact(&self, base: u64) -> Option<Arc<Region>> {
        self.current.read().get(&base).cloned()
    }

    /// Register a loaded region in the original-address map.
    pub fn insert_original(&self, region: &Arc<Region>) {
        self.original
            .write()
            .insert(region.original_span().base, Arc::downgrade(region));
    }

    /// Remove a region from both maps, current map first.
    pub fn remove_pair(&self, region: &Region) {
        let mut current = self.current.write();
        current.remove(&region.current_base);
        let mut original = self.original.write();
        original.remove(&region.original_span().base);
    }

    /// Translate a current-run address into the original address space of
    /// the region it belongs to, counting the inbound relocation so closure
    /// keeps the destination's file alive.
    pub fn relocate_current_to_original(&self, rip: u64) -> Option<u64> {
        let region = self.find_current(rip)?;
        let original = region.original_span();
        region.state.lock().header.num_relocations_to += 1;
        Some(rip - region.current_base + original.base)
    }

    /// Translate an original-space address (as stored in a cache file) into
    /// the current run's address space. Fails for unregistered destinations
    /// — `.bss`-like targets commonly have no named region.
    pub fn resolve_original_to_current(&self, rip: u64) -> Option<u64> {
        let map = self.original.read();
        let (_, weak) = map.range(..=rip).next_back()?;
        let region = weak.upgrade()?;
        let original = region.original_span();
        (rip >= original.base && rip - original.base < region.current_len)
            .then(|| rip - original.base + region.current_base)
    }

    /// Every region currently registered.
    pub fn snapshot_current(&self) -> Vec<Arc<Region>> {
        self.current.read().values().cloned().collect()
    }

    pub fn clear(&self) {
        let mut current = self.current.write();
        current.clear();
        let mut original = self.original.write();
        original.clear();
    }
}
