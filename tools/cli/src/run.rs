//! Backup and restore runs against an in-memory drive.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use keepsake_common::{Bus, DrivePath, Errors, ItemPath};
use keepsake_engine::{
    Collection, CountKey, Counter, DriveRestorer, DriveSource, ItemSource, MemoryStore, Options,
    RestoreCaches, RestorePath, RestoreTarget, StatusAggregator, StatusSummary, StatusUpdater,
    StoredKind, UrlCache,
};
use keepsake_remote::MemoryRemote;

use crate::fixture::{Fixture, LoadedDrive};

/// What a run prints.
#[derive(Debug, Serialize)]
pub struct Report {
    pub summary: StatusSummary,
    pub errors: Errors,
    pub counters: BTreeMap<CountKey, i64>,
}

/// Result of a backup: the source drive and what was stored.
pub struct Backup {
    pub remote: MemoryRemote,
    pub drive: LoadedDrive,
    pub store: MemoryStore,
    pub report: Report,
}

/// Back up the fixture's drive into a memory store.
pub async fn run_backup(fixture: &Fixture, options: &Options) -> Result<Backup> {
    let remote = MemoryRemote::new();
    let drive = fixture.load(&remote).await?;
    let drive_id = drive.drive.id.clone();

    let bus = Bus::new(options.fail_fast);
    let counter = Counter::new();
    let status = Arc::new(StatusAggregator::new());
    let store = MemoryStore::new();

    let url_cache = Arc::new(UrlCache::new(
        drive_id.clone(),
        None,
        options.url_cache_refresh_interval,
        Arc::new(remote.file_delta_pager(&drive_id)),
    )?);

    // Enumerate before the deletions below; deleted files then fail at
    // download time.
    if let Some(first) = drive.files.first() {
        url_cache
            .get_item_properties(&first.id)
            .await
            .context("Failed to enumerate drive")?;
    }
    for file in drive.files.iter().filter(|f| f.deleted) {
        remote.remove_item(&drive_id, &file.id)?;
    }

    for (folder, meta) in &drive.folders {
        store.put_dir_meta(&drive.drive_path(folder)?, meta)?;
    }

    for folder in drive.file_folders() {
        let files: Vec<_> = drive.files.iter().filter(|f| f.folder == folder).collect();
        let full_path = drive.drive_path(&folder)?;
        let location = location_of(&drive, &folder)?;

        let source = ItemSource::Drive(DriveSource::new(
            url_cache.clone(),
            Arc::new(remote.clone()),
        ));
        let collection = Arc::new(
            Collection::new(
                drive_id.clone(),
                full_path.clone(),
                location,
                source,
                status.clone(),
            )
            .with_options(options)
            .with_counter(counter.clone())
            .with_added(files.iter().map(|f| f.id.clone())),
        );

        let mut items = collection.items(bus.clone());
        while let Some(item) = items.recv().await {
            let (Some(data), Some(file)) = (item.data, files.iter().find(|f| f.id == item.id))
            else {
                continue;
            };
            store.put_drive_file(&full_path, &item.id, data, &file.meta)?;
        }
    }

    info!("Backed up {} entries", store.len());
    let report = Report {
        summary: status.summary(),
        errors: bus.errors(),
        counters: counter.totals(),
    };

    Ok(Backup {
        remote,
        drive,
        store,
        report,
    })
}

/// Back up the fixture, then restore it.
///
/// With `in_place` the backup is restored into the drive it came from, so
/// every item collides with itself; otherwise into a fresh destination.
pub async fn run_restore(fixture: &Fixture, options: &Options, in_place: bool) -> Result<Report> {
    let backup = run_backup(fixture, options).await?;
    let source = &backup.drive.drive;

    let destination = if in_place {
        backup.remote.clone()
    } else {
        MemoryRemote::new()
    };

    let caches = Arc::new(
        RestoreCaches::new()
            .with_backup_container_names([(source.id.clone(), source.name.clone())]),
    );
    caches
        .populate(&destination, &fixture.owner)
        .await
        .context("Failed to list destination drives")?;

    let counter = Counter::new();
    let bus = Bus::new(options.fail_fast);
    let restorer = DriveRestorer::new(
        Arc::new(destination),
        caches,
        options.restore,
        counter.clone(),
    );

    let paths = restore_paths(&backup.store)?;
    let target = RestoreTarget {
        old_container_id: source.id.clone(),
        protected_resource_id: fixture.owner.clone(),
        fallback_name: source.name.clone(),
    };
    let status = restorer
        .restore(&backup.store, &target, paths, &bus)
        .await
        .context("Restore failed")?;
    info!("{}", status);

    let aggregator = StatusAggregator::new();
    aggregator.update(status);

    Ok(Report {
        summary: aggregator.summary(),
        errors: bus.errors(),
        counters: counter.totals(),
    })
}

/// Every stored data entry, restored into the folder it was backed up from.
fn restore_paths(store: &MemoryStore) -> Result<Vec<RestorePath>> {
    let mut paths = Vec::new();
    for stored in store.paths_of(StoredKind::Data) {
        let drive = DrivePath::from_item_path(&stored)?;
        let folders = drive.folders[..drive.folders.len().saturating_sub(1)].to_vec();
        paths.push(RestorePath {
            restore: ItemPath::from_components(folders)?,
            stored,
        });
    }
    Ok(paths)
}

fn location_of(drive: &LoadedDrive, folder: &ItemPath) -> Result<ItemPath> {
    let mut location = ItemPath::parse(&drive.drive.name)?;
    for component in folder.components() {
        location = location.join(component)?;
    }
    Ok(location)
}
