//! Keepsake collection and restore engine
//!
//! This crate provides the parts of a backup run that sit between the remote
//! service and the snapshot store:
//! - Item collections that stream fetched items with bounded parallelism
//! - A download URL cache with single-flight refresh per drive
//! - Restore caches that map backed-up containers to live ones
//! - Collision handling and permission inheritance for restored items
//! - Export naming for backed-up drive files

pub mod collection;
pub mod collision;
pub mod config;
pub mod count;
pub mod export;
pub mod item;
pub mod permissions;
pub mod restore;
pub mod restore_caches;
pub mod restore_paths;
pub mod retry;
pub mod status;
pub mod store;
pub mod url_cache;

// Re-export main types
pub use collection::{Collection, ProgressTick};
pub use collision::{create_folder, CollisionResolver, RestoreOutcome};
pub use config::{Options, Parallelism, RestoreConfig, RetrySettings};
pub use count::{CountKey, Counter};
pub use export::{export_items, export_name, ExportItem};
pub use item::{DriveSource, FetchedItem, Item, ItemSource};
pub use permissions::{compute_previous_metadata, diff_permissions, permissions_to_grant};
pub use restore::{DriveRestorer, RestoreTarget};
pub use restore_caches::{CollisionEntry, CollisionKeys, ContainerInfo, RestoreCaches};
pub use restore_paths::{augment_restore_paths, RestorePath};
pub use retry::{RetryConfig, RetryExecutor};
pub use status::{
    CollectionMetrics, CollectionStatus, Operation, StatusAggregator, StatusSummary, StatusUpdater,
};
pub use store::{MemoryStore, StoredKind, StoredReader};
pub use url_cache::{ItemProps, UrlCache};
