//! Item records and the service-specific sources they are fetched from.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use keepsake_common::{Error, Result};
use keepsake_remote::{DriveContentReader, ItemGetterSerializer, ItemInfo};

use crate::url_cache::UrlCache;

/// One record emitted by a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub id: String,
    /// Serialized content. `None` for tombstones.
    pub data: Option<Vec<u8>>,
    pub info: Option<ItemInfo>,
    pub mod_time: DateTime<Utc>,
    pub deleted: bool,
}

impl Item {
    /// A deletion marker. Carries no content.
    pub fn tombstone(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: None,
            info: None,
            mod_time: Utc::now(),
            deleted: true,
        }
    }

    /// Size reported by the item's info, zero for tombstones.
    pub fn size(&self) -> i64 {
        self.info.as_ref().map(ItemInfo::size).unwrap_or(0)
    }
}

/// Content and info of a fetched item.
#[derive(Debug, Clone)]
pub struct FetchedItem {
    pub data: Vec<u8>,
    pub info: ItemInfo,
}

/// Drive files: the download URL comes from the URL cache.
pub struct DriveSource {
    drive_id: String,
    url_cache: Arc<UrlCache>,
    reader: Arc<dyn DriveContentReader>,
}

impl DriveSource {
    pub fn new(url_cache: Arc<UrlCache>, reader: Arc<dyn DriveContentReader>) -> Self {
        Self {
            drive_id: url_cache.drive_id().to_string(),
            url_cache,
            reader,
        }
    }

    pub fn url_cache(&self) -> &Arc<UrlCache> {
        &self.url_cache
    }

    async fn fetch(&self, item_id: &str) -> Result<FetchedItem> {
        let props = self.url_cache.get_item_properties(item_id).await?;
        if props.is_deleted {
            return Err(Error::DeletedInFlight(item_id.to_string()));
        }

        let data = self.reader.download(&props.download_url).await?;
        let info = self.reader.item_info(&self.drive_id, item_id).await?;

        Ok(FetchedItem {
            data,
            info: ItemInfo::Drive(info),
        })
    }
}

/// Where a collection's items come from, one variant per service.
pub enum ItemSource {
    /// Mail, contacts and events.
    Exchange(Arc<dyn ItemGetterSerializer>),
    /// Channel messages.
    Groups(Arc<dyn ItemGetterSerializer>),
    /// Files and document libraries.
    Drive(DriveSource),
}

impl ItemSource {
    /// Fetch and serialize one item.
    ///
    /// # Errors
    /// - `Error::DeletedInFlight` if the item disappeared since enumeration
    /// - Whatever the remote collaborator reports
    pub async fn fetch(&self, container_id: &str, item_id: &str) -> Result<FetchedItem> {
        match self {
            Self::Exchange(getter) | Self::Groups(getter) => {
                let (raw, info) = getter.get_item(container_id, item_id).await?;
                let data = getter.serialize(&raw).await?;
                Ok(FetchedItem { data, info })
            }
            Self::Drive(source) => source.fetch(item_id).await,
        }
    }

    pub fn service(&self) -> &'static str {
        match self {
            Self::Exchange(_) => "exchange",
            Self::Groups(_) => "groups",
            Self::Drive(_) => "drive",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keepsake_remote::{MemoryMailbox, MemoryRemote};
    use std::time::Duration;

    #[test]
    fn test_tombstone() {
        let before = Utc::now();
        let item = Item::tombstone("gone");

        assert!(item.deleted);
        assert!(item.data.is_none());
        assert!(item.mod_time >= before);
        assert_eq!(item.size(), 0);
    }

    #[tokio::test]
    async fn test_exchange_source_fetch() {
        let mailbox = MemoryMailbox::new();
        let id = mailbox.add_message("inbox", "hi", "a@example.com", "body");
        let source = ItemSource::Exchange(Arc::new(mailbox));

        let fetched = source.fetch("inbox", &id).await.unwrap();
        assert!(!fetched.data.is_empty());
        assert_eq!(source.service(), "exchange");
    }

    #[tokio::test]
    async fn test_drive_source_uses_url_cache() {
        let remote = MemoryRemote::new();
        let drive = remote.add_drive("user1", "OneDrive");
        let root = remote.root_id(&drive.id).unwrap();
        let kept = remote.add_file(&drive.id, &root, "a.txt", b"abc".to_vec()).unwrap();
        let gone = remote.add_file(&drive.id, &root, "b.txt", b"x".to_vec()).unwrap();
        remote.remove_item(&drive.id, &gone.id).unwrap();

        let cache = Arc::new(
            UrlCache::new(
                drive.id.clone(),
                None,
                Duration::from_secs(60),
                Arc::new(remote.file_delta_pager(&drive.id)),
            )
            .unwrap(),
        );
        let source = ItemSource::Drive(DriveSource::new(cache.clone(), Arc::new(remote)));

        let fetched = source.fetch(&drive.id, &kept.id).await.unwrap();
        assert_eq!(fetched.data, b"abc");
        assert!(matches!(fetched.info, ItemInfo::Drive(ref i) if i.item_name == "a.txt"));

        let err = source.fetch(&drive.id, &gone.id).await.unwrap_err();
        assert!(err.is_deleted_in_flight());
        assert_eq!(cache.delta_query_count(), 1);
    }
}
