//! Collection completion summaries.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Backup,
    Restore,
    Export,
}

/// Counts for one collection, or a merge of several.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMetrics {
    /// Items attempted (added plus removed).
    pub objects: usize,
    pub successes: usize,
    pub bytes: i64,
}

impl CollectionMetrics {
    pub fn combine(self, other: CollectionMetrics) -> CollectionMetrics {
        CollectionMetrics {
            objects: self.objects + other.objects,
            successes: self.successes + other.successes,
            bytes: self.bytes + other.bytes,
        }
    }
}

/// Status handed to the status updater when a collection finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStatus {
    pub operation: Operation,
    /// Location of the collection.
    pub folder: String,
    pub metrics: CollectionMetrics,
}

impl fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {}: {} of {} items, {} bytes",
            self.operation,
            self.folder,
            self.metrics.successes,
            self.metrics.objects,
            self.metrics.bytes
        )
    }
}

/// Fire-and-forget sink for collection summaries.
pub trait StatusUpdater: Send + Sync {
    fn update(&self, status: CollectionStatus);
}

impl<F> StatusUpdater for F
where
    F: Fn(CollectionStatus) + Send + Sync,
{
    fn update(&self, status: CollectionStatus) {
        self(status)
    }
}

/// Merged view over every status reported for an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub folders: usize,
    pub metrics: CollectionMetrics,
}

/// A status updater that merges everything it receives.
#[derive(Debug, Clone, Default)]
pub struct StatusAggregator {
    summary: Arc<Mutex<StatusSummary>>,
}

impl StatusAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summary(&self) -> StatusSummary {
        self.summary.lock().clone()
    }
}

impl StatusUpdater for StatusAggregator {
    fn update(&self, status: CollectionStatus) {
        let mut summary = self.summary.lock();
        summary.folders += 1;
        summary.metrics = summary.metrics.combine(status.metrics);
    }
}
