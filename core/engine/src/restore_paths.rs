//! Restore path planning for drive items.

use std::collections::BTreeMap;

use keepsake_common::{DrivePath, Error, ItemPath, Result};

use crate::store::{StoredKind, DIRMETA_NAME};

/// A stored entry and the destination folder it is restored into.
///
/// `restore` is relative to the destination container root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RestorePath {
    pub stored: ItemPath,
    pub restore: ItemPath,
}

/// Add the folder metadata entries a set of restored items depends on.
///
/// For every folder between the drive root and each item, the folder's
/// `.dirmeta` entry is added once, paired with the destination folder it
/// restores into. The result is ordered so that a folder's metadata comes
/// before the entries inside it.
///
/// # Errors
/// - A stored path is not below a drive root
/// - A restore path has fewer folders than the stored path it restores
pub fn augment_restore_paths(paths: Vec<RestorePath>) -> Result<Vec<RestorePath>> {
    let mut planned: BTreeMap<ItemPath, RestorePath> = BTreeMap::new();

    for path in paths {
        let drive = DrivePath::from_item_path(&path.stored)?;
        let folders = drive.folders.len().saturating_sub(1);
        if path.restore.depth() < folders {
            return Err(Error::InvalidInput(format!(
                "restore path {} is shallower than {}",
                path.restore, path.stored
            )));
        }

        let mut stored_dir = path.stored.parent();
        let mut restore_dir = Some(path.restore.clone());
        for _ in 0..folders {
            let (Some(dir), Some(target)) = (stored_dir, restore_dir) else {
                break;
            };
            let dirmeta = dir.join(DIRMETA_NAME)?;
            planned.entry(dirmeta.clone()).or_insert(RestorePath {
                stored: dirmeta,
                restore: target.clone(),
            });
            stored_dir = dir.parent();
            restore_dir = target.parent();
        }

        planned.insert(path.stored.clone(), path);
    }

    let mut result: Vec<RestorePath> = planned.into_values().collect();
    result.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
    Ok(result)
}

fn sort_key(path: &RestorePath) -> (Option<ItemPath>, bool, &ItemPath) {
    let is_dirmeta = StoredKind::of_path(&path.stored) == StoredKind::DirMeta;
    (path.stored.parent(), !is_dirmeta, &path.stored)
}
