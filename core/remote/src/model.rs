//! Records exchanged with the remote and destination collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use keepsake_common::Error;

/// One record from a drive delta enumeration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveItem {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub is_folder: bool,
    pub deleted: bool,
    /// Transient, expiring link to the content. Only set for live files.
    pub download_url: Option<String>,
    pub size: i64,
    pub modified: DateTime<Utc>,
}

/// A container (drive, document library) as reported by the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteContainer {
    pub id: String,
    pub name: String,
}

/// An item living in a destination container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationItem {
    pub id: String,
    pub name: String,
    pub is_folder: bool,
}

/// An item to create in a destination container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewItem {
    pub name: String,
    pub is_folder: bool,
    pub content: Option<Vec<u8>>,
    pub permissions: Vec<Permission>,
}

impl NewItem {
    pub fn file(name: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content: Some(content),
            ..Default::default()
        }
    }

    pub fn folder(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_folder: true,
            ..Default::default()
        }
    }
}

/// An item as returned by a service-specific getter, before serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    pub id: String,
    pub payload: serde_json::Value,
}

/// How to handle a restored item whose name is already taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    /// Create anyway and let the destination pick a new name.
    Copy,
    /// Delete the existing item, then create.
    Replace,
    /// Leave the existing item alone.
    #[default]
    Skip,
}

impl FromStr for CollisionPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "copy" => Ok(Self::Copy),
            "replace" => Ok(Self::Replace),
            "skip" => Ok(Self::Skip),
            other => Err(Error::InvalidInput(format!(
                "unknown collision policy: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for CollisionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Copy => "copy",
            Self::Replace => "replace",
            Self::Skip => "skip",
        };
        write!(f, "{}", s)
    }
}

/// Category of exchange item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeItemType {
    Mail,
    Contact,
    Event,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeInfo {
    pub item_type: ExchangeItemType,
    pub subject: String,
    pub sender: String,
    pub size: i64,
    pub modified: DateTime<Utc>,
    pub parent_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveItemInfo {
    pub drive_id: String,
    pub item_name: String,
    pub size: i64,
    pub modified: DateTime<Utc>,
    pub parent_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupsInfo {
    pub message_preview: String,
    pub size: i64,
    pub modified: DateTime<Utc>,
    pub parent_path: String,
}

/// Service-specific details about a backed up item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ItemInfo {
    Exchange(ExchangeInfo),
    Drive(DriveItemInfo),
    Groups(GroupsInfo),
}

impl ItemInfo {
    pub fn size(&self) -> i64 {
        match self {
            Self::Exchange(i) => i.size,
            Self::Drive(i) => i.size,
            Self::Groups(i) => i.size,
        }
    }

    pub fn set_size(&mut self, size: i64) {
        match self {
            Self::Exchange(i) => i.size = size,
            Self::Drive(i) => i.size = size,
            Self::Groups(i) => i.size = size,
        }
    }

    pub fn modified(&self) -> DateTime<Utc> {
        match self {
            Self::Exchange(i) => i.modified,
            Self::Drive(i) => i.modified,
            Self::Groups(i) => i.modified,
        }
    }

    pub fn parent_path(&self) -> &str {
        match self {
            Self::Exchange(i) => &i.parent_path,
            Self::Drive(i) => &i.parent_path,
            Self::Groups(i) => &i.parent_path,
        }
    }

    pub fn set_parent_path(&mut self, path: impl Into<String>) {
        let path = path.into();
        match self {
            Self::Exchange(i) => i.parent_path = path,
            Self::Drive(i) => i.parent_path = path,
            Self::Groups(i) => i.parent_path = path,
        }
    }
}

/// Sharing mode recorded for a file or folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharingMode {
    /// No sharing information recorded.
    #[default]
    Unset,
    /// Permissions come from the nearest non-inherited ancestor.
    Inherited,
    /// Explicit permissions set on this item.
    Custom,
}

/// A single grant of roles to a grantee.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Permission {
    pub id: String,
    pub roles: Vec<String>,
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Metadata stored alongside a drive item or folder.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, rename = "filename")]
    pub file_name: String,
    #[serde(default)]
    pub sharing_mode: SharingMode,
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

impl Metadata {
    /// Parse a `.meta` / `.dirmeta` record.
    pub fn from_json(data: &[u8]) -> keepsake_common::Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn to_json(&self) -> keepsake_common::Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}
