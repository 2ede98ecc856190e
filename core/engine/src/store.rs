//! Layout of backed-up drive items.
//!
//! Each drive file is stored as two entries next to each other:
//! `<item-id>.data` holds the content and `<item-id>.meta` holds its
//! `Metadata` (display name and permissions). Every folder carries a
//! `.dirmeta` entry with the folder's own metadata.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use keepsake_common::{Error, ItemPath, Result};
use keepsake_remote::Metadata;

pub const DATA_SUFFIX: &str = ".data";
pub const META_SUFFIX: &str = ".meta";
pub const DIRMETA_NAME: &str = ".dirmeta";

/// Role of a stored entry, derived from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredKind {
    Data,
    Meta,
    DirMeta,
    Other,
}

impl StoredKind {
    pub fn of(name: &str) -> Self {
        if name == DIRMETA_NAME || name.ends_with(DIRMETA_NAME) {
            Self::DirMeta
        } else if name.ends_with(DATA_SUFFIX) {
            Self::Data
        } else if name.ends_with(META_SUFFIX) {
            Self::Meta
        } else {
            Self::Other
        }
    }

    pub fn of_path(path: &ItemPath) -> Self {
        path.name().map(Self::of).unwrap_or(Self::Other)
    }
}

/// Path of the `.meta` entry next to a `.data` entry.
/// Item id of a `.data` entry name. Only one suffix is removed.
pub fn data_item_id(name: &str) -> &str {
    name.strip_suffix(DATA_SUFFIX).unwrap_or(name)
}

pub fn meta_path_for(data_path: &ItemPath) -> Result<ItemPath> {
    let name = data_path
        .name()
        .and_then(|n| n.strip_suffix(DATA_SUFFIX))
        .ok_or_else(|| Error::InvalidInput(format!("not a data entry: {}", data_path)))?;
    let parent = data_path.parent().unwrap_or_else(ItemPath::root);
    parent.join(&format!("{}{}", name, META_SUFFIX))
}

/// Read access to backed-up entries.
#[async_trait]
pub trait StoredReader: Send + Sync {
    /// # Errors
    /// - `Error::NotFound` if nothing is stored at `path`
    async fn read(&self, path: &ItemPath) -> Result<Vec<u8>>;

    /// Read and parse a `.meta` or `.dirmeta` entry.
    async fn read_metadata(&self, path: &ItemPath) -> Result<Metadata> {
        let data = self.read(path).await?;
        Metadata::from_json(&data)
    }
}

/// Backed-up entries kept in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<BTreeMap<ItemPath, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: ItemPath, data: Vec<u8>) {
        self.entries.write().insert(path, data);
    }

    /// Store a drive file as its `.data` and `.meta` pair under `folder`.
    pub fn put_drive_file(
        &self,
        folder: &ItemPath,
        item_id: &str,
        data: Vec<u8>,
        meta: &Metadata,
    ) -> Result<ItemPath> {
        let data_path = folder.join(&format!("{}{}", item_id, DATA_SUFFIX))?;
        let meta_path = folder.join(&format!("{}{}", item_id, META_SUFFIX))?;
        self.put(meta_path, meta.to_json()?);
        self.put(data_path.clone(), data);
        Ok(data_path)
    }

    /// Store a folder's own metadata.
    pub fn put_dir_meta(&self, folder: &ItemPath, meta: &Metadata) -> Result<()> {
        self.put(folder.join(DIRMETA_NAME)?, meta.to_json()?);
        Ok(())
    }

    /// Every stored path, in order.
    pub fn paths(&self) -> Vec<ItemPath> {
        self.entries.read().keys().cloned().collect()
    }

    /// Stored paths of the given kind.
    pub fn paths_of(&self, kind: StoredKind) -> Vec<ItemPath> {
        self.entries
            .read()
            .keys()
            .filter(|p| StoredKind::of_path(p) == kind)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl StoredReader for MemoryStore {
    async fn read(&self, path: &ItemPath) -> Result<Vec<u8>> {
        self.entries
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("nothing stored at {}", path)))
    }
}
