//! JSON fixtures describing one drive to back up.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use keepsake_common::ItemPath;
use keepsake_remote::{
    CollisionPolicy, DestinationWriter, MemoryRemote, Metadata, NewItem, Permission,
    RemoteContainer, SharingMode,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureFolder {
    /// Folder path below the drive root, e.g. `docs/2024`.
    pub path: String,
    #[serde(default)]
    pub sharing_mode: SharingMode,
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureFile {
    /// File path below the drive root, e.g. `docs/report.txt`.
    pub path: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sharing_mode: SharingMode,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    /// Deleted from the drive after enumeration, before its content is read.
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fixture {
    pub owner: String,
    pub drive: String,
    #[serde(default)]
    pub folders: Vec<FixtureFolder>,
    #[serde(default)]
    pub files: Vec<FixtureFile>,
}

/// A file as loaded into the drive.
#[derive(Debug, Clone)]
pub struct LoadedFile {
    pub id: String,
    /// Folder path below the drive root.
    pub folder: ItemPath,
    pub meta: Metadata,
    pub deleted: bool,
}

/// The drive built from a fixture.
#[derive(Debug, Clone)]
pub struct LoadedDrive {
    pub drive: RemoteContainer,
    /// Every folder below the root with its metadata, parents first.
    pub folders: Vec<(ItemPath, Metadata)>,
    pub files: Vec<LoadedFile>,
}

impl LoadedDrive {
    /// `drives/<id>/root:` followed by `folder`.
    pub fn drive_path(&self, folder: &ItemPath) -> Result<ItemPath> {
        let mut path = ItemPath::parse(&format!("drives/{}/root:", self.drive.id))?;
        for component in folder.components() {
            path = path.join(component)?;
        }
        Ok(path)
    }

    /// Folders holding files, including the root when it holds any.
    pub fn file_folders(&self) -> Vec<ItemPath> {
        let mut folders: Vec<ItemPath> = self.files.iter().map(|f| f.folder.clone()).collect();
        folders.sort();
        folders.dedup();
        folders
    }
}

impl Fixture {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture {}", path.display()))?;
        serde_json::from_str(&raw).context("Invalid fixture")
    }

    /// Build the drive in `remote`. Files marked deleted are created here and
    /// removed later by the caller.
    pub async fn load(&self, remote: &MemoryRemote) -> Result<LoadedDrive> {
        let drive = remote.add_drive(&self.owner, &self.drive);
        let root_id = remote.root_id(&drive.id)?;

        let mut folder_ids: HashMap<ItemPath, String> = HashMap::new();
        folder_ids.insert(ItemPath::root(), root_id);
        let mut folders = Vec::new();

        let mut declared: HashMap<ItemPath, &FixtureFolder> = HashMap::new();
        for folder in &self.folders {
            declared.insert(ItemPath::parse(&folder.path)?, folder);
        }

        let mut wanted: Vec<ItemPath> = declared.keys().cloned().collect();
        for file in &self.files {
            if let Some(parent) = ItemPath::parse(&file.path)?.parent() {
                wanted.push(parent);
            }
        }
        // Every ancestor is needed too.
        for path in wanted.clone() {
            let mut current = path.parent();
            while let Some(p) = current {
                current = p.parent();
                wanted.push(p);
            }
        }
        wanted.sort();
        wanted.dedup();

        for path in wanted.into_iter().filter(|p| !p.is_root()) {
            let (Some(parent), Some(name)) = (path.parent(), path.name()) else {
                continue;
            };
            let parent_id = folder_ids
                .get(&parent)
                .cloned()
                .with_context(|| format!("Missing parent folder for {}", path))?;
            let created = remote.add_folder(&drive.id, &parent_id, name)?;
            folder_ids.insert(path.clone(), created.id);

            let meta = declared
                .get(&path)
                .map(|f| Metadata {
                    file_name: name.to_string(),
                    sharing_mode: f.sharing_mode,
                    permissions: f.permissions.clone(),
                })
                .unwrap_or_else(|| Metadata {
                    file_name: name.to_string(),
                    sharing_mode: SharingMode::Inherited,
                    permissions: Vec::new(),
                });
            folders.push((path, meta));
        }

        let mut files = Vec::new();
        for file in &self.files {
            let path = ItemPath::parse(&file.path)?;
            let name = path
                .name()
                .with_context(|| format!("File path is empty: {:?}", file.path))?
                .to_string();
            let folder = path.parent().unwrap_or_else(ItemPath::root);
            let parent_id = folder_ids
                .get(&folder)
                .cloned()
                .with_context(|| format!("Missing folder for {}", path))?;

            let mut item = NewItem::file(name.clone(), file.content.clone().into_bytes());
            item.permissions = file.permissions.clone();
            let created = remote
                .create_item(&drive.id, &parent_id, item, CollisionPolicy::Skip)
                .await
                .with_context(|| format!("Failed to create {}", path))?;

            files.push(LoadedFile {
                id: created.id,
                folder,
                meta: Metadata {
                    file_name: name,
                    sharing_mode: file.sharing_mode,
                    permissions: file.permissions.clone(),
                },
                deleted: file.deleted,
            });
        }

        Ok(LoadedDrive {
            drive,
            folders,
            files,
        })
    }
}

#[cfg(test)]
pub(crate) const SAMPLE_FIXTURE: &str = r#"{
    "owner": "user1",
    "drive": "OneDrive",
    "folders": [
        {
            "path": "docs",
            "sharing_mode": "custom",
            "permissions": [{ "id": "p1", "roles": ["read"], "entity_id": "u1" }]
        }
    ],
    "files": [
        { "path": "top.txt", "content": "top", "sharing_mode": "inherited" },
        { "path": "docs/a.txt", "content": "aaa", "sharing_mode": "inherited" },
        { "path": "docs/deep/b.txt", "content": "bb", "sharing_mode": "inherited" },
        { "path": "docs/gone.txt", "content": "x", "deleted": true }
    ]
}"#;
