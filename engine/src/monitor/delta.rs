use common::Traffic;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// Turns cumulative readings into per-tick deltas.
///
/// An entity seen for the first time starts from zero. A reading lower than
/// the previous one (counter reset) yields a zero delta.
#[derive(Debug)]
pub struct DeltaTracker<K> {
    previous: HashMap<K, Traffic>,
    seen: HashSet<K>,
}

impl<K> Default for DeltaTracker<K> {
    fn default() -> Self {
        Self {
            previous: HashMap::new(),
            seen: HashSet::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> DeltaTracker<K> {
    pub fn observe(&mut self, key: &K, current: Traffic) -> Traffic {
        let previous = self.previous.insert(key.clone(), current).unwrap_or_default();
        self.seen.insert(key.clone());
        current.saturating_delta(previous)
    }

    /// Forgets entities not observed since the last sweep.
    pub fn sweep(&mut self) {
        let seen = std::mem::take(&mut self.seen);
        self.previous.retain(|key, _| seen.contains(key));
    }

    pub fn len(&self) -> usize {
        self.previous.len()
    }

    pub fn is_empty(&self) -> bool {
        self.previous.is_empty()
    }
}
