//! In-memory remote for testing and demos.
//!
//! `MemoryRemote` plays both roles: the source service whose drives are
//! enumerated during backup, and the destination that restores write into.
//! All data is stored in memory and lost on drop.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use keepsake_common::{Error, Result};

use crate::model::{
    CollisionPolicy, DestinationItem, DriveItem, DriveItemInfo, ExchangeInfo, ExchangeItemType,
    ItemInfo, NewItem, Permission, RawItem, RemoteContainer,
};
use crate::pager::{DeltaPage, DeltaPager, Page, Pager};
use crate::provider::{
    ContainerLister, ContainerPoster, DestinationWriter, DriveContentReader,
    ItemGetterSerializer, RootFolderGetter,
};

const URL_SCHEME: &str = "memory://";
const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
struct Node {
    id: String,
    name: String,
    parent_id: Option<String>,
    is_folder: bool,
    content: Vec<u8>,
    permissions: Vec<Permission>,
    modified: DateTime<Utc>,
    deleted: bool,
}

impl Node {
    fn to_drive_item(&self, drive_id: &str) -> DriveItem {
        let download_url = if self.is_folder || self.deleted {
            None
        } else {
            Some(format!("{}{}/{}", URL_SCHEME, drive_id, self.id))
        };
        DriveItem {
            id: self.id.clone(),
            name: self.name.clone(),
            parent_id: self.parent_id.clone(),
            is_folder: self.is_folder,
            deleted: self.deleted,
            download_url,
            size: self.content.len() as i64,
            modified: self.modified,
        }
    }

    fn to_destination_item(&self) -> DestinationItem {
        DestinationItem {
            id: self.id.clone(),
            name: self.name.clone(),
            is_folder: self.is_folder,
        }
    }
}

#[derive(Debug)]
struct Drive {
    owner: String,
    name: String,
    root_id: String,
    nodes: HashMap<String, Node>,
    /// Node ids in the order they changed; the delta log.
    changes: Vec<String>,
}

impl Drive {
    fn live_child(&self, parent_id: &str, name: &str) -> Option<&Node> {
        self.nodes.values().find(|n| {
            !n.deleted && n.parent_id.as_deref() == Some(parent_id) && n.name == name
        })
    }

    fn live_folder(&self, id: &str) -> Result<&Node> {
        match self.nodes.get(id) {
            Some(n) if n.is_folder && !n.deleted => Ok(n),
            Some(_) => Err(Error::InvalidInput(format!("not a folder: {}", id))),
            None => Err(Error::NotFound(format!("folder not found: {}", id))),
        }
    }

    fn insert(&mut self, node: Node) {
        self.changes.push(node.id.clone());
        self.nodes.insert(node.id.clone(), node);
    }

    /// First free "name N" (suffix goes before the extension).
    fn disambiguate(&self, parent_id: &str, name: &str) -> String {
        let (stem, ext) = match name.rfind('.') {
            Some(pos) if pos > 0 => name.split_at(pos),
            _ => (name, ""),
        };
        let mut n = 1;
        loop {
            let candidate = format!("{} {}{}", stem, n, ext);
            if self.live_child(parent_id, &candidate).is_none() {
                return candidate;
            }
            n += 1;
        }
    }
}

type Drives = Arc<RwLock<HashMap<String, Drive>>>;

/// In-memory drive service.
#[derive(Clone)]
pub struct MemoryRemote {
    drives: Drives,
    page_size: usize,
}

impl MemoryRemote {
    /// Create an empty remote.
    pub fn new() -> Self {
        Self {
            drives: Arc::new(RwLock::new(HashMap::new())),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Set how many records each page carries.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Add a drive owned by `owner`. The drive gets an empty root folder.
    pub fn add_drive(&self, owner: &str, name: &str) -> RemoteContainer {
        let id = Uuid::new_v4().to_string();
        let root_id = Uuid::new_v4().to_string();
        let mut drive = Drive {
            owner: owner.to_string(),
            name: name.to_string(),
            root_id: root_id.clone(),
            nodes: HashMap::new(),
            changes: Vec::new(),
        };
        drive.nodes.insert(
            root_id.clone(),
            Node {
                id: root_id,
                name: "root".to_string(),
                parent_id: None,
                is_folder: true,
                content: Vec::new(),
                permissions: Vec::new(),
                modified: Utc::now(),
                deleted: false,
            },
        );
        self.drives.write().insert(id.clone(), drive);

        RemoteContainer {
            id,
            name: name.to_string(),
        }
    }

    /// Root folder id of a drive.
    pub fn root_id(&self, drive_id: &str) -> Result<String> {
        let drives = self.drives.read();
        let drive = drives
            .get(drive_id)
            .ok_or_else(|| Error::NotFound(format!("drive not found: {}", drive_id)))?;
        Ok(drive.root_id.clone())
    }

    /// Add a file under `parent_id`.
    pub fn add_file(
        &self,
        drive_id: &str,
        parent_id: &str,
        name: &str,
        content: Vec<u8>,
    ) -> Result<DriveItem> {
        self.add_node(drive_id, parent_id, name, false, content)
    }

    /// Add a folder under `parent_id`.
    pub fn add_folder(&self, drive_id: &str, parent_id: &str, name: &str) -> Result<DriveItem> {
        self.add_node(drive_id, parent_id, name, true, Vec::new())
    }

    fn add_node(
        &self,
        drive_id: &str,
        parent_id: &str,
        name: &str,
        is_folder: bool,
        content: Vec<u8>,
    ) -> Result<DriveItem> {
        let mut drives = self.drives.write();
        let drive = drives
            .get_mut(drive_id)
            .ok_or_else(|| Error::NotFound(format!("drive not found: {}", drive_id)))?;
        drive.live_folder(parent_id)?;
        if drive.live_child(parent_id, name).is_some() {
            return Err(Error::AlreadyExists(name.to_string()));
        }

        let node = Node {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            parent_id: Some(parent_id.to_string()),
            is_folder,
            content,
            permissions: Vec::new(),
            modified: Utc::now(),
            deleted: false,
        };
        let item = node.to_drive_item(drive_id);
        drive.insert(node);
        Ok(item)
    }

    /// Mark an item deleted. It shows up as a deletion in later deltas.
    pub fn remove_item(&self, drive_id: &str, item_id: &str) -> Result<()> {
        let mut drives = self.drives.write();
        let drive = drives
            .get_mut(drive_id)
            .ok_or_else(|| Error::NotFound(format!("drive not found: {}", drive_id)))?;
        let node = drive
            .nodes
            .get_mut(item_id)
            .filter(|n| !n.deleted)
            .ok_or_else(|| Error::DeletedInFlight(item_id.to_string()))?;
        node.deleted = true;
        node.modified = Utc::now();
        drive.changes.push(item_id.to_string());
        Ok(())
    }

    /// Content of a live file.
    pub fn content(&self, drive_id: &str, item_id: &str) -> Result<Vec<u8>> {
        let drives = self.drives.read();
        drives
            .get(drive_id)
            .and_then(|d| d.nodes.get(item_id))
            .filter(|n| !n.deleted && !n.is_folder)
            .map(|n| n.content.clone())
            .ok_or_else(|| Error::NotFound(format!("file not found: {}", item_id)))
    }

    /// Permissions recorded on a live item.
    pub fn permissions(&self, drive_id: &str, item_id: &str) -> Result<Vec<Permission>> {
        let drives = self.drives.read();
        drives
            .get(drive_id)
            .and_then(|d| d.nodes.get(item_id))
            .filter(|n| !n.deleted)
            .map(|n| n.permissions.clone())
            .ok_or_else(|| Error::NotFound(format!("item not found: {}", item_id)))
    }

    /// Live children of a folder, sorted by name.
    pub fn children(&self, drive_id: &str, folder_id: &str) -> Result<Vec<DestinationItem>> {
        let drives = self.drives.read();
        let drive = drives
            .get(drive_id)
            .ok_or_else(|| Error::NotFound(format!("drive not found: {}", drive_id)))?;
        drive.live_folder(folder_id)?;

        let mut children: Vec<DestinationItem> = drive
            .nodes
            .values()
            .filter(|n| !n.deleted && n.parent_id.as_deref() == Some(folder_id))
            .map(Node::to_destination_item)
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    /// Every container, sorted by name.
    pub fn containers(&self) -> Vec<RemoteContainer> {
        let drives = self.drives.read();
        let mut all: Vec<RemoteContainer> = drives
            .iter()
            .map(|(id, d)| RemoteContainer {
                id: id.clone(),
                name: d.name.clone(),
            })
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Delta enumeration over every record of a drive, folders included.
    pub fn delta_pager(&self, drive_id: &str) -> MemoryDeltaPager {
        self.make_delta_pager(drive_id, false)
    }

    /// Delta enumeration over the file records of a drive.
    pub fn file_delta_pager(&self, drive_id: &str) -> MemoryDeltaPager {
        self.make_delta_pager(drive_id, true)
    }

    fn make_delta_pager(&self, drive_id: &str, files_only: bool) -> MemoryDeltaPager {
        MemoryDeltaPager {
            drives: self.drives.clone(),
            drive_id: drive_id.to_string(),
            page_size: self.page_size,
            files_only,
        }
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

/// Delta pager over one drive's change log.
///
/// Links are `delta:<n>` (resume after the first n changes) and `next:<n>`
/// (next page of the current enumeration).
pub struct MemoryDeltaPager {
    drives: Drives,
    drive_id: String,
    page_size: usize,
    files_only: bool,
}

fn parse_offset(link: Option<&str>) -> Result<usize> {
    let Some(link) = link else {
        return Ok(0);
    };
    let offset = link
        .strip_prefix("delta:")
        .or_else(|| link.strip_prefix("next:"))
        .ok_or_else(|| Error::InvalidInput(format!("malformed page link: {}", link)))?;
    offset
        .parse()
        .map_err(|_| Error::InvalidInput(format!("malformed page link: {}", link)))
}

#[async_trait]
impl DeltaPager<DriveItem> for MemoryDeltaPager {
    async fn next_page(&self, link: Option<&str>) -> Result<DeltaPage<DriveItem>> {
        let offset = parse_offset(link)?;
        let drives = self.drives.read();
        let drive = drives
            .get(&self.drive_id)
            .ok_or_else(|| Error::NotFound(format!("drive not found: {}", self.drive_id)))?;

        let total = drive.changes.len();
        let start = offset.min(total);
        let end = (start + self.page_size).min(total);

        let values = drive.changes[start..end]
            .iter()
            .filter_map(|id| drive.nodes.get(id))
            .filter(|n| n.parent_id.is_some())
            .filter(|n| !(self.files_only && n.is_folder))
            .map(|n| n.to_drive_item(&self.drive_id))
            .collect();

        if end < total {
            Ok(DeltaPage {
                values,
                next_link: Some(format!("next:{}", end)),
                delta_link: None,
            })
        } else {
            Ok(DeltaPage {
                values,
                next_link: None,
                delta_link: Some(format!("delta:{}", total)),
            })
        }
    }
}

/// Pager over a snapshot of one owner's drives.
struct MemoryContainerPager {
    containers: Vec<RemoteContainer>,
    page_size: usize,
}

#[async_trait]
impl Pager<RemoteContainer> for MemoryContainerPager {
    async fn next_page(&self, link: Option<&str>) -> Result<Page<RemoteContainer>> {
        let start = parse_offset(link)?.min(self.containers.len());
        let end = (start + self.page_size).min(self.containers.len());
        let next_link = (end < self.containers.len()).then(|| format!("next:{}", end));

        Ok(Page {
            values: self.containers[start..end].to_vec(),
            next_link,
        })
    }
}

#[async_trait]
impl RootFolderGetter for MemoryRemote {
    async fn get_root_folder(&self, container_id: &str) -> Result<DestinationItem> {
        let drives = self.drives.read();
        let drive = drives
            .get(container_id)
            .ok_or_else(|| Error::NotFound(format!("drive not found: {}", container_id)))?;
        let root = drive.live_folder(&drive.root_id)?;
        Ok(root.to_destination_item())
    }
}

impl ContainerLister for MemoryRemote {
    fn container_pager(&self, protected_resource_id: &str) -> Box<dyn Pager<RemoteContainer>> {
        let drives = self.drives.read();
        let mut containers: Vec<RemoteContainer> = drives
            .iter()
            .filter(|(_, d)| d.owner == protected_resource_id)
            .map(|(id, d)| RemoteContainer {
                id: id.clone(),
                name: d.name.clone(),
            })
            .collect();
        containers.sort_by(|a, b| a.name.cmp(&b.name));

        Box::new(MemoryContainerPager {
            containers,
            page_size: self.page_size,
        })
    }
}

#[async_trait]
impl ContainerPoster for MemoryRemote {
    async fn post_container(
        &self,
        protected_resource_id: &str,
        name: &str,
    ) -> Result<RemoteContainer> {
        let taken = self
            .drives
            .read()
            .values()
            .any(|d| d.owner == protected_resource_id && d.name == name);
        if taken {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        Ok(self.add_drive(protected_resource_id, name))
    }
}

#[async_trait]
impl DriveContentReader for MemoryRemote {
    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let (drive_id, item_id) = url
            .strip_prefix(URL_SCHEME)
            .and_then(|rest| rest.split_once('/'))
            .ok_or_else(|| Error::InvalidInput(format!("not a download url: {}", url)))?;

        let drives = self.drives.read();
        match drives.get(drive_id).and_then(|d| d.nodes.get(item_id)) {
            Some(n) if !n.deleted && !n.is_folder => Ok(n.content.clone()),
            Some(n) if n.is_folder => Err(Error::InvalidInput(format!(
                "cannot download folder: {}",
                item_id
            ))),
            _ => Err(Error::DeletedInFlight(item_id.to_string())),
        }
    }

    async fn item_info(&self, drive_id: &str, item_id: &str) -> Result<DriveItemInfo> {
        let drives = self.drives.read();
        let node = drives
            .get(drive_id)
            .and_then(|d| d.nodes.get(item_id))
            .filter(|n| !n.deleted)
            .ok_or_else(|| Error::DeletedInFlight(item_id.to_string()))?;

        Ok(DriveItemInfo {
            drive_id: drive_id.to_string(),
            item_name: node.name.clone(),
            size: node.content.len() as i64,
            modified: node.modified,
            parent_path: String::new(),
        })
    }
}

#[async_trait]
impl DestinationWriter for MemoryRemote {
    async fn list_container(
        &self,
        container_id: &str,
        folder_id: &str,
    ) -> Result<Vec<DestinationItem>> {
        self.children(container_id, folder_id)
    }

    async fn create_item(
        &self,
        container_id: &str,
        parent_id: &str,
        item: NewItem,
        on_collision: CollisionPolicy,
    ) -> Result<DestinationItem> {
        let mut drives = self.drives.write();
        let drive = drives
            .get_mut(container_id)
            .ok_or_else(|| Error::NotFound(format!("drive not found: {}", container_id)))?;
        drive.live_folder(parent_id)?;

        let mut name = item.name.clone();
        if let Some(existing) = drive.live_child(parent_id, &item.name).cloned() {
            match on_collision {
                CollisionPolicy::Skip => return Err(Error::AlreadyExists(item.name)),
                CollisionPolicy::Copy => name = drive.disambiguate(parent_id, &item.name),
                CollisionPolicy::Replace => {
                    if existing.is_folder != item.is_folder {
                        return Err(Error::AlreadyExists(item.name));
                    }
                    if existing.is_folder {
                        if let Some(node) = drive.nodes.get_mut(&existing.id) {
                            for grant in item.permissions {
                                match node.permissions.iter_mut().find(|p| p.id == grant.id) {
                                    Some(current) => *current = grant,
                                    None => node.permissions.push(grant),
                                }
                            }
                        }
                        return Ok(existing.to_destination_item());
                    }
                    if let Some(node) = drive.nodes.get_mut(&existing.id) {
                        node.deleted = true;
                    }
                }
            }
        }

        let node = Node {
            id: Uuid::new_v4().to_string(),
            name,
            parent_id: Some(parent_id.to_string()),
            is_folder: item.is_folder,
            content: item.content.unwrap_or_default(),
            permissions: item.permissions,
            modified: Utc::now(),
            deleted: false,
        };
        let created = node.to_destination_item();
        drive.insert(node);
        Ok(created)
    }

    async fn delete_item(&self, container_id: &str, item_id: &str) -> Result<()> {
        self.remove_item(container_id, item_id)
    }
}

/// A mail message kept by `MemoryMailbox`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MemoryMessage {
    pub id: String,
    pub subject: String,
    pub sender: String,
    pub body: String,
}

/// In-memory mailbox serving mail folders to a collection.
#[derive(Clone, Default)]
pub struct MemoryMailbox {
    folders: Arc<RwLock<HashMap<String, HashMap<String, MemoryMessage>>>>,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a message in a folder, returning its id.
    pub fn add_message(&self, folder_id: &str, subject: &str, sender: &str, body: &str) -> String {
        let id = Uuid::new_v4().to_string();
        let message = MemoryMessage {
            id: id.clone(),
            subject: subject.to_string(),
            sender: sender.to_string(),
            body: body.to_string(),
        };
        self.folders
            .write()
            .entry(folder_id.to_string())
            .or_default()
            .insert(id.clone(), message);
        id
    }

    /// Remove a message, as if deleted by the user.
    pub fn remove_message(&self, folder_id: &str, message_id: &str) -> bool {
        self.folders
            .write()
            .get_mut(folder_id)
            .and_then(|f| f.remove(message_id))
            .is_some()
    }
}

#[async_trait]
impl ItemGetterSerializer for MemoryMailbox {
    async fn get_item(&self, container_id: &str, item_id: &str) -> Result<(RawItem, ItemInfo)> {
        let message = self
            .folders
            .read()
            .get(container_id)
            .and_then(|f| f.get(item_id))
            .cloned()
            .ok_or_else(|| Error::DeletedInFlight(item_id.to_string()))?;

        let info = ItemInfo::Exchange(ExchangeInfo {
            item_type: ExchangeItemType::Mail,
            subject: message.subject.clone(),
            sender: message.sender.clone(),
            size: 0,
            modified: Utc::now(),
            parent_path: String::new(),
        });
        let payload =
            serde_json::to_value(&message).map_err(|e| Error::Serialization(e.to_string()))?;

        Ok((
            RawItem {
                id: message.id,
                payload,
            },
            info,
        ))
    }

    async fn serialize(&self, item: &RawItem) -> Result<Vec<u8>> {
        serde_json::to_vec(&item.payload).map_err(|e| Error::Serialization(e.to_string()))
    }
}
