//! Collision detection and resolution for restored items.

use tracing::{debug, info};

use keepsake_common::Result;
use keepsake_remote::{CollisionPolicy, DestinationItem, DestinationWriter, NewItem};

use crate::count::{CountKey, Counter};
use crate::restore_caches::{CollisionEntry, CollisionKeys};

/// What happened to a restored item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Written as a new item, possibly under a disambiguated name.
    Created(DestinationItem),
    /// An existing file was deleted and the item written in its place.
    Replaced(DestinationItem),
    /// Left alone because the name was taken.
    Skipped { existing_id: String },
}

/// Decides how restored items are written when their name is taken.
#[derive(Debug, Clone)]
pub struct CollisionResolver {
    policy: CollisionPolicy,
    counter: Counter,
}

impl CollisionResolver {
    pub fn new(policy: CollisionPolicy, counter: Counter) -> Self {
        Self { policy, counter }
    }

    pub fn policy(&self) -> CollisionPolicy {
        self.policy
    }

    /// Find what currently holds the item's name, if anything.
    pub fn detect_collision<'a>(
        &self,
        collisions: &'a CollisionKeys,
        name: &str,
    ) -> Option<&'a CollisionEntry> {
        collisions.get(name)
    }

    /// Write one item into `parent_id`, applying the collision policy.
    ///
    /// | collision      | Copy            | Replace                 | Skip      |
    /// |----------------|-----------------|-------------------------|-----------|
    /// | none           | create          | create                  | create    |
    /// | existing file  | create (rename) | delete, then create     | skip      |
    /// | existing folder| create (rename) | create, folder kept     | skip      |
    ///
    /// # Errors
    /// - Deleting the existing file failed for a reason other than it being gone
    /// - Creating the item failed
    pub async fn restore_item(
        &self,
        writer: &dyn DestinationWriter,
        collisions: &CollisionKeys,
        container_id: &str,
        parent_id: &str,
        item: NewItem,
    ) -> Result<RestoreOutcome> {
        let Some(existing) = self.detect_collision(collisions, &item.name) else {
            let created = writer
                .create_item(container_id, parent_id, item, self.policy)
                .await?;
            self.counter.inc(CountKey::NewItemCreated);
            return Ok(RestoreOutcome::Created(created));
        };

        match self.policy {
            CollisionPolicy::Skip => {
                info!(name = %item.name, "Name taken, skipping item");
                self.counter.inc(CountKey::CollisionSkip);
                Ok(RestoreOutcome::Skipped {
                    existing_id: existing.item_id.clone(),
                })
            }
            CollisionPolicy::Copy => {
                let created = writer
                    .create_item(container_id, parent_id, item, CollisionPolicy::Copy)
                    .await?;
                self.counter.inc(CountKey::NewItemCreated);
                Ok(RestoreOutcome::Created(created))
            }
            CollisionPolicy::Replace if existing.is_folder => {
                // Folders are never deleted; the destination picks a free name.
                let created = writer
                    .create_item(container_id, parent_id, item, CollisionPolicy::Copy)
                    .await?;
                self.counter.inc(CountKey::NewItemCreated);
                Ok(RestoreOutcome::Created(created))
            }
            CollisionPolicy::Replace => {
                match writer.delete_item(container_id, &existing.item_id).await {
                    Ok(()) => {}
                    Err(e) if e.is_deleted_in_flight() => {
                        debug!(item_id = %existing.item_id, "Replaced item already gone");
                    }
                    Err(e) => return Err(e),
                }
                let created = writer
                    .create_item(container_id, parent_id, item, CollisionPolicy::Replace)
                    .await?;
                self.counter.inc(CountKey::CollisionReplace);
                Ok(RestoreOutcome::Replaced(created))
            }
        }
    }
}

/// Create a folder, or return the folder that already holds the name.
///
/// The folder's permissions go to the destination either way. If a file
/// holds the name, the folder is created under a free name instead.
pub async fn create_folder(
    writer: &dyn DestinationWriter,
    container_id: &str,
    parent_id: &str,
    folder: NewItem,
) -> Result<DestinationItem> {
    match writer
        .create_item(
            container_id,
            parent_id,
            folder.clone(),
            CollisionPolicy::Replace,
        )
        .await
    {
        Err(e) if e.is_already_exists() => {
            debug!("Folder name {} held by a file, creating a copy", folder.name);
            writer
                .create_item(container_id, parent_id, folder, CollisionPolicy::Copy)
                .await
        }
        other => other,
    }
}
