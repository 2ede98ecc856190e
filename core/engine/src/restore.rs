//! Restore of backed-up drive items into a destination.

use std::sync::Arc;
use tracing::{debug, info, instrument};

use keepsake_common::{
    Bus, Error, FaultError, FaultItem, ItemPath, Result, SkipCause, Skipped,
};
use keepsake_remote::{ContainerPoster, DestinationWriter, NewItem};

use crate::collision::{CollisionResolver, RestoreOutcome};
use crate::config::RestoreConfig;
use crate::count::Counter;
use crate::permissions::{compute_previous_metadata, permissions_to_grant};
use crate::restore_caches::{ContainerInfo, RestoreCaches};
use crate::restore_paths::{augment_restore_paths, RestorePath};
use crate::status::{CollectionMetrics, CollectionStatus, Operation};
use crate::store::{data_item_id, meta_path_for, StoredKind, StoredReader};

/// The backed-up container being restored and where it goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreTarget {
    /// Container id recorded by the backup.
    pub old_container_id: String,
    /// Owner of the destination container.
    pub protected_resource_id: String,
    /// Name used when a new container has to be created and the backup
    /// recorded none.
    pub fallback_name: String,
}

/// Restores drive entries into containers of one destination.
pub struct DriveRestorer<D> {
    destination: Arc<D>,
    caches: Arc<RestoreCaches>,
    resolver: CollisionResolver,
    config: RestoreConfig,
}

impl<D> DriveRestorer<D>
where
    D: ContainerPoster + DestinationWriter,
{
    pub fn new(
        destination: Arc<D>,
        caches: Arc<RestoreCaches>,
        config: RestoreConfig,
        counter: Counter,
    ) -> Self {
        Self {
            destination,
            caches,
            resolver: CollisionResolver::new(config.on_collision, counter),
            config,
        }
    }

    pub fn caches(&self) -> &Arc<RestoreCaches> {
        &self.caches
    }

    /// Restore `paths` into the container resolved for `target`.
    ///
    /// Per-item failures are recorded on `bus`; name collisions left alone
    /// are recorded as skips.
    ///
    /// # Errors
    /// - The destination container could not be resolved or created
    /// - The restore paths are inconsistent
    #[instrument(skip(self, reader, paths, bus), fields(container = %target.old_container_id))]
    pub async fn restore(
        &self,
        reader: &dyn StoredReader,
        target: &RestoreTarget,
        paths: Vec<RestorePath>,
        bus: &Bus,
    ) -> Result<CollectionStatus> {
        let container = self
            .caches
            .ensure_container_exists(
                self.destination.as_ref(),
                &target.old_container_id,
                &target.protected_resource_id,
                &target.fallback_name,
            )
            .await?;
        let plan = augment_restore_paths(paths)?;
        let errs = bus.local();
        let mut metrics = CollectionMetrics::default();

        info!(
            "Restoring {} entries into {} ({})",
            plan.len(),
            container.name,
            container.id
        );

        for path in &plan {
            if bus.failure().is_some() {
                break;
            }

            match StoredKind::of_path(&path.stored) {
                StoredKind::DirMeta => {
                    if let Err(e) = self.restore_folder(reader, &container, path).await {
                        let folder = path.restore.to_string_path();
                        errs.add_recoverable(
                            FaultError::from(e)
                                .context("restoring folder")
                                .with_item(FaultItem::container(&container.id, &folder, &folder)),
                        );
                    }
                }
                StoredKind::Data => {
                    metrics.objects += 1;
                    let item = stored_fault_item(&container, &path.stored);

                    match self.restore_file(reader, &container, path).await {
                        Ok((RestoreOutcome::Skipped { .. }, _)) => {
                            metrics.successes += 1;
                            errs.add_skip(Skipped::new(item, SkipCause::Policy));
                        }
                        Ok((_, size)) => {
                            metrics.successes += 1;
                            metrics.bytes += size;
                        }
                        Err(e) => {
                            errs.add_recoverable(
                                FaultError::from(e).context("restoring item").with_item(item),
                            );
                        }
                    }
                }
                StoredKind::Meta => {}
                StoredKind::Other => debug!("Ignoring stored entry {}", path.stored),
            }
        }

        Ok(CollectionStatus {
            operation: Operation::Restore,
            folder: container.name,
            metrics,
        })
    }

    async fn restore_folder(
        &self,
        reader: &dyn StoredReader,
        container: &ContainerInfo,
        path: &RestorePath,
    ) -> Result<()> {
        let meta = reader.read_metadata(&path.stored).await?;
        let folder = path.stored.parent().ok_or_else(|| {
            Error::InvalidInput(format!("folder metadata without a folder: {}", path.stored))
        })?;

        // Parents come first in the plan, so their metadata is already known.
        let permissions = if self.config.include_permissions {
            let parent_meta =
                compute_previous_metadata(&folder, |p| self.caches.parent_metadata(p))?;
            permissions_to_grant(&meta, &parent_meta)
        } else {
            Vec::new()
        };
        self.caches.set_parent_metadata(folder, meta);

        self.caches
            .ensure_folder_path(
                self.destination.as_ref(),
                container,
                path.restore.components(),
                permissions,
            )
            .await?;
        Ok(())
    }

    async fn restore_file(
        &self,
        reader: &dyn StoredReader,
        container: &ContainerInfo,
        path: &RestorePath,
    ) -> Result<(RestoreOutcome, i64)> {
        let meta = reader.read_metadata(&meta_path_for(&path.stored)?).await?;
        let data = reader.read(&path.stored).await?;
        let size = data.len() as i64;

        let permissions = if self.config.include_permissions {
            let parent_meta = compute_previous_metadata(&path.stored, |p| {
                self.caches.parent_metadata(p)
            })?;
            permissions_to_grant(&meta, &parent_meta)
        } else {
            Vec::new()
        };

        let name = if meta.file_name.is_empty() {
            stored_id(&path.stored)
        } else {
            meta.file_name
        };

        let parent_id = self
            .caches
            .ensure_folder_path(
                self.destination.as_ref(),
                container,
                path.restore.components(),
                Vec::new(),
            )
            .await?;
        let collisions = self
            .caches
            .collision_keys(self.destination.as_ref(), &container.id, &parent_id)
            .await?;

        let mut item = NewItem::file(name, data);
        item.permissions = permissions;

        let outcome = self
            .resolver
            .restore_item(
                self.destination.as_ref(),
                &collisions,
                &container.id,
                &parent_id,
                item,
            )
            .await?;
        Ok((outcome, size))
    }
}

fn stored_id(stored: &ItemPath) -> String {
    stored
        .name()
        .map(|n| data_item_id(n).to_string())
        .unwrap_or_default()
}

fn stored_fault_item(container: &ContainerInfo, stored: &ItemPath) -> FaultItem {
    let id = stored_id(stored);
    FaultItem::file(&container.id, &id, &id)
}
