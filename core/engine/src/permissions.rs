//! Effective sharing permissions of restored drive items.
//!
//! Folder metadata is stored once per folder, so an item whose own sharing
//! mode is inherited gets its permissions from the nearest ancestor that
//! set its own.

use std::collections::HashMap;

use keepsake_common::{DrivePath, Error, ItemPath, Result, DRIVE_ROOT_DEPTH};
use keepsake_remote::{Metadata, Permission, SharingMode};

/// Metadata in effect for `item` before it was backed up, as defined by its
/// ancestors.
///
/// Walks upward from the immediate parent. The first ancestor whose sharing
/// mode is not `Inherited` wins. Reaching the drive root yields the default
/// metadata.
///
/// # Errors
/// - `item` is not below a drive root
/// - An ancestor between the item and the drive root has no recorded metadata
pub fn compute_previous_metadata<F>(item: &ItemPath, lookup: F) -> Result<Metadata>
where
    F: Fn(&ItemPath) -> Option<Metadata>,
{
    DrivePath::from_item_path(item)?;

    let mut current = item.parent();
    while let Some(dir) = current {
        if dir.depth() <= DRIVE_ROOT_DEPTH {
            break;
        }

        let meta = lookup(&dir)
            .ok_or_else(|| Error::NotFound(format!("no metadata recorded for folder {}", dir)))?;
        if meta.sharing_mode != SharingMode::Inherited {
            return Ok(meta);
        }
        current = dir.parent();
    }

    Ok(Metadata::default())
}

/// Permissions to add and to remove to go from `before` to `after`.
///
/// Permissions are matched by id. A permission whose roles changed shows up
/// in both lists.
pub fn diff_permissions(
    before: &[Permission],
    after: &[Permission],
) -> (Vec<Permission>, Vec<Permission>) {
    let before_by_id: HashMap<&str, &Permission> =
        before.iter().map(|p| (p.id.as_str(), p)).collect();
    let after_by_id: HashMap<&str, &Permission> =
        after.iter().map(|p| (p.id.as_str(), p)).collect();

    let added = after
        .iter()
        .filter(|p| before_by_id.get(p.id.as_str()).copied() != Some(*p))
        .cloned()
        .collect();
    let removed = before
        .iter()
        .filter(|p| after_by_id.get(p.id.as_str()).copied() != Some(*p))
        .cloned()
        .collect();

    (added, removed)
}

/// Grants a restored item needs on top of what it inherits from its parent.
pub fn permissions_to_grant(item_meta: &Metadata, parent_meta: &Metadata) -> Vec<Permission> {
    match item_meta.sharing_mode {
        SharingMode::Inherited => Vec::new(),
        SharingMode::Custom | SharingMode::Unset => {
            diff_permissions(&parent_meta.permissions, &item_meta.permissions).0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compute_previous_metadata_in(
        item: &ItemPath,
        parent_metas: &HashMap<ItemPath, Metadata>,
    ) -> Result<Metadata> {
        compute_previous_metadata(item, |p| parent_metas.get(p).cloned())
    }

    fn perm(id: &str, role: &str) -> Permission {
        Permission {
            id: id.to_string(),
            roles: vec![role.to_string()],
            entity_id: "user-id".to_string(),
            email: None,
        }
    }

    fn custom(role: &str) -> Metadata {
        Metadata {
            file_name: String::new(),
            sharing_mode: SharingMode::Custom,
            permissions: vec![perm("p1", role)],
        }
    }

    fn inherited() -> Metadata {
        Metadata {
            sharing_mode: SharingMode::Inherited,
            ..Default::default()
        }
    }

    fn path(s: &str) -> ItemPath {
        ItemPath::parse(s).unwrap()
    }

    const ENTRY: &str = "drives/drive-id/root:/level0/level1/level2/entry";
    const LEVEL2: &str = "drives/drive-id/root:/level0/level1/level2";
    const LEVEL1: &str = "drives/drive-id/root:/level0/level1";
    const LEVEL0: &str = "drives/drive-id/root:/level0";

    fn metas(entries: &[(&str, Metadata)]) -> HashMap<ItemPath, Metadata> {
        entries
            .iter()
            .map(|(p, m)| (path(p), m.clone()))
            .collect()
    }

    #[test]
    fn test_root_level_entry() {
        let meta =
            compute_previous_metadata_in(&path("drives/drive-id/root:/entry"), &HashMap::new())
                .unwrap();
        assert_eq!(meta, Metadata::default());
    }

    #[test]
    fn test_root_level_directory() {
        let meta = compute_previous_metadata_in(&path(LEVEL0), &HashMap::new()).unwrap();
        assert_eq!(meta, Metadata::default());
    }

    #[test]
    fn test_direct_parent_permissions() {
        let parents = metas(&[(LEVEL2, custom("write"))]);
        let meta = compute_previous_metadata_in(&path(ENTRY), &parents).unwrap();
        assert_eq!(meta, custom("write"));
    }

    #[test]
    fn test_top_level_parent_permissions() {
        let parents = metas(&[
            (LEVEL2, inherited()),
            (LEVEL1, inherited()),
            (LEVEL0, custom("write")),
        ]);
        let meta = compute_previous_metadata_in(&path(ENTRY), &parents).unwrap();
        assert_eq!(meta, custom("write"));
    }

    #[test]
    fn test_all_inherited() {
        let parents = metas(&[
            (LEVEL2, inherited()),
            (LEVEL1, inherited()),
            (LEVEL0, inherited()),
        ]);
        let meta = compute_previous_metadata_in(&path(ENTRY), &parents).unwrap();
        assert_eq!(meta, Metadata::default());
    }

    #[test]
    fn test_nearest_custom_ancestor_wins() {
        let parents = metas(&[
            (LEVEL2, inherited()),
            (LEVEL1, custom("write")),
            (LEVEL0, custom("read")),
        ]);
        let meta = compute_previous_metadata_in(&path(ENTRY), &parents).unwrap();
        assert_eq!(meta, custom("write"));
    }

    #[test]
    fn test_missing_ancestor_is_an_error() {
        let parents = metas(&[(LEVEL2, inherited())]);
        let err = compute_previous_metadata_in(&path(ENTRY), &parents).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_non_drive_path_rejected() {
        assert!(compute_previous_metadata_in(&path("a/b/c"), &HashMap::new()).is_err());
    }

    #[test]
    fn test_diff_permissions() {
        let before = vec![perm("keep", "read"), perm("drop", "read"), perm("change", "read")];
        let after = vec![perm("keep", "read"), perm("change", "write"), perm("new", "read")];

        let (added, removed) = diff_permissions(&before, &after);
        let added: Vec<_> = added.iter().map(|p| p.id.as_str()).collect();
        let removed: Vec<_> = removed.iter().map(|p| p.id.as_str()).collect();

        assert_eq!(added, vec!["change", "new"]);
        assert_eq!(removed, vec!["drop", "change"]);
    }

    #[test]
    fn test_permissions_to_grant() {
        let parent = custom("read");
        let mut item = custom("read");
        item.permissions.push(perm("p2", "write"));

        let grants = permissions_to_grant(&item, &parent);
        assert_eq!(grants, vec![perm("p2", "write")]);
        assert!(permissions_to_grant(&inherited(), &parent).is_empty());
    }
}
