//! Remote and destination collaborator abstractions for keepsake.
//!
//! The engine never talks to a vendor API directly. It consumes:
//! - delta and plain pagers for enumerating items and containers
//! - per-service item getters that fetch and serialize content
//! - destination writers that list, create and delete restored items
//!
//! `MemoryRemote` and `MemoryMailbox` implement every contract in memory.

pub mod memory;
pub mod model;
pub mod pager;
pub mod provider;

pub use memory::{MemoryDeltaPager, MemoryMailbox, MemoryMessage, MemoryRemote};
pub use model::{
    CollisionPolicy, DestinationItem, DriveItem, DriveItemInfo, ExchangeInfo, ExchangeItemType,
    GroupsInfo, ItemInfo, Metadata, NewItem, Permission, RawItem, RemoteContainer, SharingMode,
};
pub use pager::{collect_all, walk_delta, DeltaPage, DeltaPager, Page, Pager};
pub use provider::{
    ContainerLister, ContainerPoster, DestinationWriter, DriveContentReader,
    ItemGetterSerializer, RootFolderGetter,
};
