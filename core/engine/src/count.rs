//! Per-operation counters.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CountKey {
    CollisionSkip,
    CollisionReplace,
    NewItemCreated,
    ItemsRead,
    BytesRead,
    TombstonesEmitted,
    DeletedInFlight,
}

/// Thread-safe counters. Clones share the same totals.
#[derive(Debug, Clone, Default)]
pub struct Counter {
    totals: Arc<Mutex<BTreeMap<CountKey, i64>>>,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, key: CountKey) {
        self.add(key, 1);
    }

    pub fn add(&self, key: CountKey, n: i64) {
        *self.totals.lock().entry(key).or_insert(0) += n;
    }

    /// Current value; zero if never touched.
    pub fn get(&self, key: CountKey) -> i64 {
        self.totals.lock().get(&key).copied().unwrap_or(0)
    }

    /// Snapshot of every counter touched so far.
    pub fn totals(&self) -> BTreeMap<CountKey, i64> {
        self.totals.lock().clone()
    }
}
