//! Fault bus: aggregates recoverable errors, deliberate skips and a single failure.
//!
//! A bus is created once per operation and cloned into every worker. In
//! fail-fast mode the first recoverable error is promoted to the failure,
//! which callers treat as the signal to stop launching new work.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::Error;

/// Errors carrying this label keep a backup from being finalised as a clean success.
pub const LABEL_FORCE_NO_BACKUP_CREATION: &str = "force_no_backup_creation";

/// What kind of thing a fault is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemKind {
    File,
    Container,
    Resource,
}

/// An item that a fault or skip is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultItem {
    /// Scope the id is unique within (usually the container or drive id).
    pub namespace: String,
    pub id: String,
    pub name: String,
    pub kind: ItemKind,
}

impl FaultItem {
    /// Create a file-kind item.
    pub fn file(
        namespace: impl Into<String>,
        id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
            name: name.into(),
            kind: ItemKind::File,
        }
    }

    /// Create a container-kind item.
    pub fn container(
        namespace: impl Into<String>,
        id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: ItemKind::Container,
            ..Self::file(namespace, id, name)
        }
    }

    fn dedupe_key(&self) -> String {
        format!("{}:{}", self.namespace, self.id)
    }
}

/// A recorded error. Cloneable so the bus can hand out copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct FaultError {
    pub message: String,
    pub item: Option<FaultItem>,
    pub labels: BTreeSet<String>,
}

impl FaultError {
    /// Create an error with no item attribution.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            item: None,
            labels: BTreeSet::new(),
        }
    }

    /// Attribute the error to an item.
    pub fn with_item(mut self, item: FaultItem) -> Self {
        self.item = Some(item);
        self
    }

    /// Attach a label.
    pub fn with_label(mut self, label: &str) -> Self {
        self.labels.insert(label.to_string());
        self
    }

    /// Prefix the message with what was being attempted.
    pub fn context(mut self, what: &str) -> Self {
        self.message = format!("{}: {}", what, self.message);
        self
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }
}

impl From<Error> for FaultError {
    fn from(err: Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<&str> for FaultError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Why an item was deliberately not processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipCause {
    /// The remote flagged the item as malware.
    Malware,
    /// The item exceeds what the remote will serve.
    TooLarge,
    /// Event instances the remote only exposes asynchronously.
    KnownEventInstanceAsync,
    /// A configured policy (e.g. collision skip) chose not to act.
    Policy,
}

/// A deliberate, non-error skip of one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skipped {
    pub item: FaultItem,
    pub cause: SkipCause,
}

impl Skipped {
    pub fn new(item: FaultItem, cause: SkipCause) -> Self {
        Self { item, cause }
    }
}

#[derive(Debug, Default)]
struct BusState {
    failure: Option<FaultError>,
    recoverable: Vec<FaultError>,
    skipped: Vec<Skipped>,
}

impl BusState {
    fn set_failure(&mut self, err: FaultError) {
        if self.failure.is_none() {
            self.failure = Some(err);
            return;
        }
        // Overflow into recoverable so no failure is lost.
        self.recoverable.push(err);
    }
}

/// Thread-safe fault aggregator. Clones share the same storage.
#[derive(Debug, Clone)]
pub struct Bus {
    fail_fast: bool,
    state: Arc<Mutex<BusState>>,
}

impl Bus {
    /// Create a new bus.
    pub fn new(fail_fast: bool) -> Self {
        Self {
            fail_fast,
            state: Arc::new(Mutex::new(BusState::default())),
        }
    }

    /// Whether the first recoverable error becomes the failure.
    pub fn fail_fast(&self) -> bool {
        self.fail_fast
    }

    /// The current failure, if any.
    pub fn failure(&self) -> Option<FaultError> {
        self.state.lock().failure.clone()
    }

    /// Copies of every recoverable error recorded so far.
    pub fn recovered(&self) -> Vec<FaultError> {
        self.state.lock().recoverable.clone()
    }

    /// Copies of every skip recorded so far.
    pub fn skipped(&self) -> Vec<Skipped> {
        self.state.lock().skipped.clone()
    }

    /// Set the failure. An existing failure is kept and the new error is
    /// appended to the recoverable list instead.
    pub fn fail(&self, err: impl Into<FaultError>) {
        let err = err.into();
        error!("Operation failure: {}", err);
        self.state.lock().set_failure(err);
    }

    /// Record a recoverable error, promoting it to the failure in fail-fast mode.
    pub fn add_recoverable(&self, err: impl Into<FaultError>) {
        let err = err.into();
        warn!(labels = ?err.labels, "Recoverable error: {}", err);
        self.add_recoverable_quiet(err);
    }

    fn add_recoverable_quiet(&self, err: FaultError) {
        let mut state = self.state.lock();
        if state.failure.is_none() && self.fail_fast {
            state.set_failure(err.clone());
        }
        state.recoverable.push(err);
    }

    /// Record a skip. Skips are never promoted.
    pub fn add_skip(&self, skipped: Skipped) {
        info!(
            item_id = %skipped.item.id,
            cause = ?skipped.cause,
            "Skipping item {}",
            skipped.item.name
        );
        self.state.lock().skipped.push(skipped);
    }

    /// A scoped view that shares this bus's storage but tracks its own failure.
    pub fn local(&self) -> LocalBus {
        LocalBus {
            bus: self.clone(),
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Snapshot of everything recorded, shaped for reporting.
    pub fn errors(&self) -> Errors {
        let state = self.state.lock();
        let mut items = BTreeMap::new();
        let mut recovered = Vec::new();

        for err in &state.recoverable {
            match &err.item {
                Some(item) => {
                    items.insert(item.dedupe_key(), err.clone());
                }
                None => recovered.push(err.clone()),
            }
        }
        if let Some(failure) = &state.failure {
            if let Some(item) = &failure.item {
                items.insert(item.dedupe_key(), failure.clone());
            }
        }

        Errors {
            failure: state.failure.clone(),
            recovered,
            items: items.into_values().collect(),
            skipped: state.skipped.clone(),
            fail_fast: self.fail_fast,
        }
    }
}

/// A scoped sub-bus.
///
/// Errors recorded here land in the parent bus. `failure()` only reports
/// errors promoted within this scope.
#[derive(Debug, Clone)]
pub struct LocalBus {
    bus: Bus,
    current: Arc<Mutex<Option<FaultError>>>,
}

impl LocalBus {
    pub fn add_recoverable(&self, err: impl Into<FaultError>) {
        let err = err.into();
        {
            let mut current = self.current.lock();
            if current.is_none() && self.bus.fail_fast {
                *current = Some(err.clone());
            }
        }
        self.bus.add_recoverable(err);
    }

    pub fn add_skip(&self, skipped: Skipped) {
        self.bus.add_skip(skipped);
    }

    /// The failure promoted within this scope, if any.
    pub fn failure(&self) -> Option<FaultError> {
        self.current.lock().clone()
    }

    /// The bus this scope reports into.
    pub fn parent(&self) -> &Bus {
        &self.bus
    }
}

/// Serializable report of a bus's contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Errors {
    pub failure: Option<FaultError>,
    /// Recoverable errors not attributed to an item.
    pub recovered: Vec<FaultError>,
    /// Item-attributed errors, one per namespace and id.
    pub items: Vec<FaultError>,
    pub skipped: Vec<Skipped>,
    pub fail_fast: bool,
}

impl Errors {
    /// Item errors followed by the unattributed ones.
    pub fn items_and_recovered(&self) -> Vec<FaultError> {
        self.items
            .iter()
            .chain(self.recovered.iter())
            .cloned()
            .collect()
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}
