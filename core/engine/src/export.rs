//! Export of backed-up items under their original names.

use tracing::{debug, instrument};

use keepsake_common::{Bus, FaultError, FaultItem, ItemPath, Result};

use crate::status::{CollectionMetrics, CollectionStatus, Operation};
use crate::store::{data_item_id, meta_path_for, StoredKind, StoredReader};

/// A stored item ready to be written out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportItem {
    pub name: String,
    pub stored: ItemPath,
    pub data: Vec<u8>,
}

/// Name an entry is exported under, or `None` if it is not exported.
///
/// `.data` entries take the file name recorded in their `.meta` entry, or
/// the item id when none was recorded. `.meta` and `.dirmeta` entries are
/// only read alongside data. Anything else keeps its stored name.
pub async fn export_name(stored: &ItemPath, reader: &dyn StoredReader) -> Result<Option<String>> {
    let Some(name) = stored.name() else {
        return Ok(None);
    };

    match StoredKind::of(name) {
        StoredKind::Meta | StoredKind::DirMeta => Ok(None),
        StoredKind::Other => Ok(Some(name.to_string())),
        StoredKind::Data => {
            let meta = reader.read_metadata(&meta_path_for(stored)?).await?;
            if meta.file_name.is_empty() {
                Ok(Some(data_item_id(name).to_string()))
            } else {
                Ok(Some(meta.file_name))
            }
        }
    }
}

async fn export_one(stored: &ItemPath, reader: &dyn StoredReader) -> Result<Option<ExportItem>> {
    let Some(name) = export_name(stored, reader).await? else {
        return Ok(None);
    };
    let data = reader.read(stored).await?;
    Ok(Some(ExportItem {
        name,
        stored: stored.clone(),
        data,
    }))
}

/// Read every exportable entry of `paths`.
///
/// Entries that cannot be read are recorded on the bus and left out.
#[instrument(skip_all, fields(paths = paths.len()))]
pub async fn export_items(
    reader: &dyn StoredReader,
    paths: &[ItemPath],
    bus: &Bus,
) -> (Vec<ExportItem>, CollectionStatus) {
    let errs = bus.local();
    let mut items = Vec::new();
    let mut metrics = CollectionMetrics::default();

    for stored in paths {
        if bus.failure().is_some() {
            break;
        }

        let exported = export_one(stored, reader).await;

        match exported {
            Ok(None) => debug!("Not exporting {}", stored),
            Ok(Some(item)) => {
                metrics.objects += 1;
                metrics.successes += 1;
                metrics.bytes += item.data.len() as i64;
                items.push(item);
            }
            Err(e) => {
                metrics.objects += 1;
                let id = stored.name().unwrap_or_default();
                errs.add_recoverable(
                    FaultError::from(e)
                        .context("exporting item")
                        .with_item(FaultItem::file(stored.to_string_path(), id, id)),
                );
            }
        }
    }

    let status = CollectionStatus {
        operation: Operation::Export,
        folder: String::new(),
        metrics,
    };
    (items, status)
}
