//! Common utilities and types shared across keepsake crates.
//!
//! This crate provides the error type, item paths and the fault bus used by
//! every collection and restore operation.

pub mod error;
pub mod fault;
pub mod types;

pub use error::{Error, Result};
pub use fault::{
    Bus, Errors, FaultError, FaultItem, ItemKind, LocalBus, SkipCause, Skipped,
    LABEL_FORCE_NO_BACKUP_CREATION,
};
pub use types::{DrivePath, ItemPath, DRIVE_ROOT_DEPTH};
