//! Collaborator traits for the remote service and the restore destination.

use async_trait::async_trait;

use keepsake_common::Result;

use crate::model::{
    CollisionPolicy, DestinationItem, DriveItemInfo, ItemInfo, NewItem, RawItem, RemoteContainer,
};
use crate::pager::Pager;

/// Fetches and serializes items of one service (mail, contacts, events,
/// channel messages).
///
/// Implementations must handle their own authentication and rate limiting.
#[async_trait]
pub trait ItemGetterSerializer: Send + Sync {
    /// Fetch an item and its service-specific info.
    ///
    /// # Errors
    /// - `Error::DeletedInFlight` if the item was removed since enumeration
    /// - Network errors
    async fn get_item(&self, container_id: &str, item_id: &str) -> Result<(RawItem, ItemInfo)>;

    /// Serialize a fetched item into the bytes that get stored.
    async fn serialize(&self, item: &RawItem) -> Result<Vec<u8>>;
}

/// Reads drive file content and details.
#[async_trait]
pub trait DriveContentReader: Send + Sync {
    /// Download the content behind a transient download URL.
    ///
    /// # Errors
    /// - `Error::DeletedInFlight` if the item behind the URL is gone
    /// - `Error::Network` if the URL expired or the transfer failed
    async fn download(&self, url: &str) -> Result<Vec<u8>>;

    /// Read the details of a drive item.
    async fn item_info(&self, drive_id: &str, item_id: &str) -> Result<DriveItemInfo>;
}

/// Resolves the root folder of a container.
#[async_trait]
pub trait RootFolderGetter: Send + Sync {
    async fn get_root_folder(&self, container_id: &str) -> Result<DestinationItem>;
}

/// Lists the containers owned by a protected resource.
pub trait ContainerLister: RootFolderGetter {
    fn container_pager(&self, protected_resource_id: &str) -> Box<dyn Pager<RemoteContainer>>;
}

/// Creates containers.
#[async_trait]
pub trait ContainerPoster: RootFolderGetter {
    /// Create a container under a protected resource.
    ///
    /// # Errors
    /// - `Error::AlreadyExists` if the name is taken
    async fn post_container(
        &self,
        protected_resource_id: &str,
        name: &str,
    ) -> Result<RemoteContainer>;
}

/// Writes items back into destination containers.
#[async_trait]
pub trait DestinationWriter: Send + Sync {
    /// List the direct children of a folder.
    async fn list_container(
        &self,
        container_id: &str,
        folder_id: &str,
    ) -> Result<Vec<DestinationItem>>;

    /// Create an item in a folder.
    ///
    /// # Postconditions
    /// - With `Copy`, a name clash yields a renamed item
    /// - With `Replace`, a clashing folder is kept and receives the item's
    ///   permissions, and a clashing file is overwritten
    ///
    /// # Errors
    /// - `Error::AlreadyExists` if the name is taken and the policy cannot resolve it
    async fn create_item(
        &self,
        container_id: &str,
        parent_id: &str,
        item: NewItem,
        on_collision: CollisionPolicy,
    ) -> Result<DestinationItem>;

    /// Delete an item.
    ///
    /// # Errors
    /// - `Error::DeletedInFlight` if the item is already gone
    async fn delete_item(&self, container_id: &str, item_id: &str) -> Result<()>;
}
