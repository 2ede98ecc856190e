//! Destination state cached for the length of one restore.
//!
//! Containers are indexed by id and by display name so that items restored
//! into the same container resolve it once, and so that a container that was
//! recreated under a new id since the backup is found by its old name.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use keepsake_common::{Error, ItemPath, Result};
use keepsake_remote::{
    collect_all, ContainerLister, ContainerPoster, DestinationWriter, Metadata, NewItem,
    Permission, RemoteContainer, RootFolderGetter,
};

use crate::collision::create_folder;

/// Upper bound on `name`, `name 1`, `name 2`, ... when creating a container.
pub const MAX_CONTAINER_NAME_ATTEMPTS: usize = 256;

/// A live destination container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub root_folder_id: String,
}

/// An existing destination item that a restored item may collide with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollisionEntry {
    pub item_id: String,
    pub is_folder: bool,
}

/// Destination item names of one folder, mapped to what holds each name.
pub type CollisionKeys = HashMap<String, CollisionEntry>;

/// Caches shared by every worker of a restore.
#[derive(Debug, Default)]
pub struct RestoreCaches {
    by_id: RwLock<HashMap<String, ContainerInfo>>,
    by_name: RwLock<HashMap<String, ContainerInfo>>,
    /// Container names as recorded by the backup, keyed by the backup's container id.
    backup_container_names: RwLock<HashMap<String, String>>,
    collision_keys: RwLock<HashMap<(String, String), Arc<CollisionKeys>>>,
    parent_dir_to_meta: RwLock<HashMap<ItemPath, Metadata>>,
    /// (container id, folder path) to folder id.
    created_folders: RwLock<HashMap<(String, String), String>>,
    creating: Mutex<()>,
}

impl RestoreCaches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the names the backup recorded for its containers.
    pub fn with_backup_container_names<I>(self, names: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.backup_container_names.write().extend(names);
        self
    }

    pub fn container_by_id(&self, id: &str) -> Option<ContainerInfo> {
        self.by_id.read().get(id).cloned()
    }

    pub fn container_by_name(&self, name: &str) -> Option<ContainerInfo> {
        self.by_name.read().get(name).cloned()
    }

    pub fn backup_container_name(&self, old_id: &str) -> Option<String> {
        self.backup_container_names.read().get(old_id).cloned()
    }

    pub fn container_count(&self) -> usize {
        self.by_id.read().len()
    }

    /// Register a container in both indices, resolving its root folder.
    ///
    /// Re-adding a known id replaces its entry, including its name.
    ///
    /// # Errors
    /// - The root folder lookup failed; neither index is touched
    pub async fn add_container<R>(
        &self,
        container: RemoteContainer,
        root_getter: &R,
    ) -> Result<ContainerInfo>
    where
        R: RootFolderGetter + ?Sized,
    {
        let root = root_getter.get_root_folder(&container.id).await?;
        let info = ContainerInfo {
            id: container.id,
            name: container.name,
            root_folder_id: root.id,
        };

        let previous = self.by_id.write().insert(info.id.clone(), info.clone());
        let mut by_name = self.by_name.write();
        if let Some(previous) = previous {
            if previous.name != info.name
                && by_name.get(&previous.name).map(|c| c.id.as_str()) == Some(info.id.as_str())
            {
                by_name.remove(&previous.name);
            }
        }
        by_name.insert(info.name.clone(), info.clone());

        debug!(container_id = %info.id, name = %info.name, "Registered container");
        Ok(info)
    }

    /// Register every container owned by a protected resource.
    ///
    /// # Errors
    /// - A page could not be fetched; nothing is registered
    /// - A root folder lookup failed
    #[instrument(skip(self, lister))]
    pub async fn populate<L>(&self, lister: &L, protected_resource_id: &str) -> Result<()>
    where
        L: ContainerLister + ?Sized,
    {
        let pager = lister.container_pager(protected_resource_id);
        let containers = collect_all(pager.as_ref()).await?;
        let total = containers.len();

        for container in containers {
            self.add_container(container, lister).await?;
        }

        info!("Cached {} containers", total);
        Ok(())
    }

    /// Map a container recorded by the backup to a live destination container.
    ///
    /// In order:
    /// 1. a container with the old id is known
    /// 2. a container is known under the name the backup recorded for the old id
    /// 3. a new container is created, named after the recorded name or else
    ///    `fallback_name`; taken names are retried as `name 1`, `name 2`, ...
    ///
    /// # Errors
    /// - `Error::InvalidInput` if no name is available
    /// - `Error::Fatal` after `MAX_CONTAINER_NAME_ATTEMPTS` taken names
    /// - Any creation error other than a taken name
    #[instrument(skip(self, poster))]
    pub async fn ensure_container_exists<P>(
        &self,
        poster: &P,
        old_container_id: &str,
        protected_resource_id: &str,
        fallback_name: &str,
    ) -> Result<ContainerInfo>
    where
        P: ContainerPoster + ?Sized,
    {
        if let Some(found) = self.lookup(old_container_id) {
            return Ok(found);
        }

        let _guard = self.creating.lock().await;
        // Another worker may have resolved it while we waited.
        if let Some(found) = self.lookup(old_container_id) {
            return Ok(found);
        }

        let base = self
            .backup_container_name(old_container_id)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| fallback_name.to_string());
        if base.is_empty() {
            return Err(Error::InvalidInput(format!(
                "no name known for container {}",
                old_container_id
            )));
        }

        for attempt in 0..MAX_CONTAINER_NAME_ATTEMPTS {
            let name = if attempt == 0 {
                base.clone()
            } else {
                format!("{} {}", base, attempt)
            };

            match poster.post_container(protected_resource_id, &name).await {
                Ok(created) => {
                    let info = self.add_container(created, poster).await?;
                    self.backup_container_names
                        .write()
                        .insert(old_container_id.to_string(), info.name.clone());
                    info!(container_id = %info.id, name = %info.name, "Created container");
                    return Ok(info);
                }
                Err(e) if e.is_already_exists() => {
                    debug!("Container name {} taken, trying next", name);
                }
                Err(e) => return Err(e),
            }
        }

        warn!("Gave up creating container {}", base);
        Err(Error::Fatal(format!(
            "no free container name for {} after {} attempts",
            base, MAX_CONTAINER_NAME_ATTEMPTS
        )))
    }

    fn lookup(&self, old_container_id: &str) -> Option<ContainerInfo> {
        if let Some(found) = self.container_by_id(old_container_id) {
            return Some(found);
        }
        let name = self.backup_container_name(old_container_id)?;
        self.container_by_name(&name)
    }

    /// Names already present in a destination folder, listed once per restore.
    pub async fn collision_keys(
        &self,
        writer: &dyn DestinationWriter,
        container_id: &str,
        folder_id: &str,
    ) -> Result<Arc<CollisionKeys>> {
        let key = (container_id.to_string(), folder_id.to_string());
        if let Some(keys) = self.collision_keys.read().get(&key) {
            return Ok(keys.clone());
        }

        let listed = writer.list_container(container_id, folder_id).await?;
        let keys: CollisionKeys = listed
            .into_iter()
            .map(|item| {
                (
                    item.name,
                    CollisionEntry {
                        item_id: item.id,
                        is_folder: item.is_folder,
                    },
                )
            })
            .collect();

        let keys = Arc::new(keys);
        self.collision_keys.write().insert(key, keys.clone());
        Ok(keys)
    }

    /// Record the metadata restored for a folder.
    pub fn set_parent_metadata(&self, folder: ItemPath, meta: Metadata) {
        self.parent_dir_to_meta.write().insert(folder, meta);
    }

    pub fn parent_metadata(&self, folder: &ItemPath) -> Option<Metadata> {
        self.parent_dir_to_meta.read().get(folder).cloned()
    }

    /// Make sure `folders` exists below the container root, creating what is
    /// missing. Returns the id of the deepest folder.
    ///
    /// `permissions` are granted on the deepest folder when this call is the
    /// one that resolves it.
    pub async fn ensure_folder_path(
        &self,
        writer: &dyn DestinationWriter,
        container: &ContainerInfo,
        folders: &[String],
        permissions: Vec<Permission>,
    ) -> Result<String> {
        let mut parent_id = container.root_folder_id.clone();
        let mut path = String::new();
        let mut leaf_permissions = Some(permissions);

        for (depth, folder) in folders.iter().enumerate() {
            path.push('/');
            path.push_str(folder);
            let key = (container.id.clone(), path.clone());

            let cached = self.created_folders.read().get(&key).cloned();
            parent_id = match cached {
                Some(id) => id,
                None => {
                    let mut item = NewItem::folder(folder.as_str());
                    if depth + 1 == folders.len() {
                        item.permissions = leaf_permissions.take().unwrap_or_default();
                    }
                    let created = create_folder(writer, &container.id, &parent_id, item).await?;
                    self.created_folders.write().insert(key, created.id.clone());
                    created.id
                }
            };
        }

        Ok(parent_id)
    }
}
