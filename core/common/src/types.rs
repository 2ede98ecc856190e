//! Common types used throughout keepsake.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of leading components that make up a drive root: `drives/<id>/root:`.
pub const DRIVE_ROOT_DEPTH: usize = 3;

const DRIVES_SEGMENT: &str = "drives";
const ROOT_SEGMENT: &str = "root:";

/// A hierarchical location inside a service, independent of the storage layout.
///
/// Paths are made of non-empty components joined by '/'. Drive-backed services
/// prefix every path with `drives/<drive-id>/root:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemPath {
    components: Vec<String>,
}

impl ItemPath {
    /// Create a root path.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Create a path from string components.
    ///
    /// # Errors
    /// - Returns error if any component is empty or contains a separator
    pub fn from_components(components: Vec<String>) -> crate::Result<Self> {
        for comp in &components {
            validate_component(comp)?;
        }
        Ok(Self { components })
    }

    /// Parse a path string into an ItemPath.
    ///
    /// Uses '/' as separator; leading and trailing separators are ignored.
    pub fn parse(path: &str) -> crate::Result<Self> {
        let path = path.trim_start_matches('/').trim_end_matches('/');
        if path.is_empty() {
            return Ok(Self::root());
        }

        let components: Vec<String> = path.split('/').map(String::from).collect();
        Self::from_components(components)
    }

    /// Check if this is the root path.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Get the parent path, if any.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        let mut components = self.components.clone();
        components.pop();
        Some(Self { components })
    }

    /// Get the last component.
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    /// Join this path with a child component.
    pub fn join(&self, child: &str) -> crate::Result<Self> {
        validate_component(child)?;
        let mut components = self.components.clone();
        components.push(child.to_string());
        Ok(Self { components })
    }

    /// Get the path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Number of components.
    pub fn depth(&self) -> usize {
        self.components.len()
    }

    /// True when `prefix` is this path or one of its ancestors.
    pub fn starts_with(&self, prefix: &ItemPath) -> bool {
        self.components.starts_with(&prefix.components)
    }

    /// Convert to a string representation.
    pub fn to_string_path(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            format!("/{}", self.components.join("/"))
        }
    }
}

impl fmt::Display for ItemPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_path())
    }
}

fn validate_component(comp: &str) -> crate::Result<()> {
    if comp.is_empty() {
        return Err(crate::Error::InvalidInput(
            "Path component cannot be empty".to_string(),
        ));
    }
    if comp.contains('/') || comp.contains('\\') {
        return Err(crate::Error::InvalidInput(
            "Path component cannot contain separators".to_string(),
        ));
    }
    Ok(())
}

/// A location inside a drive: the drive id plus the folders below its root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DrivePath {
    pub drive_id: String,
    pub folders: Vec<String>,
}

impl DrivePath {
    /// Split a `drives/<id>/root:/...` path.
    ///
    /// # Errors
    /// - Returns error if the path does not start with a drive root
    pub fn from_item_path(path: &ItemPath) -> crate::Result<Self> {
        let comps = path.components();
        if comps.len() < DRIVE_ROOT_DEPTH || comps[0] != DRIVES_SEGMENT || comps[2] != ROOT_SEGMENT
        {
            return Err(crate::Error::InvalidInput(format!(
                "not a drive path: {}",
                path
            )));
        }
        Ok(Self {
            drive_id: comps[1].clone(),
            folders: comps[DRIVE_ROOT_DEPTH..].to_vec(),
        })
    }

    /// The `drives/<id>/root:` path of this drive.
    pub fn root_path(&self) -> crate::Result<ItemPath> {
        ItemPath::from_components(vec![
            DRIVES_SEGMENT.to_string(),
            self.drive_id.clone(),
            ROOT_SEGMENT.to_string(),
        ])
    }

    /// Rebuild the full item path.
    pub fn to_item_path(&self) -> crate::Result<ItemPath> {
        let mut path = self.root_path()?;
        for folder in &self.folders {
            path = path.join(folder)?;
        }
        Ok(path)
    }
}
