//! Asset records and per-package metadata.
//!
//! An [`AssetRecord`] describes one discoverable content item. Its object path
//! (`/Game/Props/Chair.Chair`) is the catalog-wide key; package name and
//! folder are derived from it once and cached so filters never re-split paths.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const REDIRECTOR_CLASS: &str = "ObjectRedirector";
pub const PRIMARY_ASSET_TYPE_TAG: &str = "PrimaryAssetType";
pub const PRIMARY_ASSET_NAME_TAG: &str = "PrimaryAssetName";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct PackageFlags: u32 {
        const NEWLY_CREATED = 0x0000_0001;
        const CLIENT_OPTIONAL = 0x0000_0002;
        const SERVER_SIDE_ONLY = 0x0000_0004;
        const COMPILED_IN = 0x0000_0010;
        const FOR_DIFFING = 0x0000_0020;
        const EDITOR_ONLY = 0x0000_0040;
        const CONTAINS_MAP = 0x0002_0000;
        const FILTER_EDITOR_ONLY = 0x8000_0000;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AssetRecord {
    pub object_path: String,
    pub package_name: String,
    pub package_path: String,
    pub group_names: String,
    pub asset_name: String,
    pub class_name: String,
    pub tags: BTreeMap<String, String>,
    pub chunk_ids: BTreeSet<i32>,
    pub package_flags: PackageFlags,
}

impl AssetRecord {
    pub fn new(package_name: &str, asset_name: &str, class_name: &str) -> Self {
        Self::with_groups(package_name, "", asset_name, class_name)
    }

    pub fn with_groups(
        package_name: &str,
        group_names: &str,
        asset_name: &str,
        class_name: &str,
    ) -> Self {
        Self {
            object_path: object_path_for(package_name, group_names, asset_name),
            package_name: package_name.to_string(),
            package_path: package_path_of(package_name).to_string(),
            group_names: group_names.to_string(),
            asset_name: asset_name.to_string(),
            class_name: class_name.to_string(),
            tags: BTreeMap::new(),
            chunk_ids: BTreeSet::new(),
            package_flags: PackageFlags::empty(),
        }
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_chunk(mut self, chunk_id: i32) -> Self {
        self.chunk_ids.insert(chunk_id);
        self
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn is_redirector(&self) -> bool {
        self.class_name == REDIRECTOR_CLASS
    }

    /// Recomputes the cached keys after `package_name`, `group_names` or
    /// `asset_name` were edited directly.
    pub fn refresh_derived_keys(&mut self) {
        self.object_path = object_path_for(&self.package_name, &self.group_names, &self.asset_name);
        self.package_path = package_path_of(&self.package_name).to_string();
    }
}

/// Non-asset metadata about a package file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PackageData {
    pub disk_size: i64,
    pub package_guid: [u8; 16],
    pub content_hash: String,
    pub cooked_version: u32,
}

pub fn object_path_for(package_name: &str, group_names: &str, asset_name: &str) -> String {
    if group_names.is_empty() {
        format!("{package_name}.{asset_name}")
    } else {
        format!("{package_name}.{group_names}.{asset_name}")
    }
}

/// `/Game/Props/Chair` -> `/Game/Props`. A root package such as `/Game`
/// yields an empty path.
pub fn package_path_of(package_name: &str) -> &str {
    match package_name.rfind('/') {
        Some(idx) => &package_name[..idx],
        None => "",
    }
}

/// `/Game/Props/Chair` -> `Chair`.
pub fn package_short_name(package_name: &str) -> &str {
    match package_name.rfind('/') {
        Some(idx) => &package_name[idx + 1..],
        None => package_name,
    }
}

/// `/Game/Props/Chair.Chair` -> `/Game/Props/Chair`.
pub fn package_of_object_path(object_path: &str) -> &str {
    match object_path.find('.') {
        Some(idx) => &object_path[..idx],
        None => object_path,
    }
}

/// Reduces an export text path (`Class'/Game/BP.BP_C'`) or an object path
/// (`/Game/BP.BP_C`) to the bare object name (`BP_C`).
pub fn export_text_path_to_object_name(export_text_path: &str) -> &str {
    let mut path = export_text_path.trim();
    if let Some(start) = path.find('\'')
        && path.ends_with('\'')
        && path.len() > start + 1
    {
        path = &path[start + 1..path.len() - 1];
    }
    let name_start = path.rfind(['.', ':']).map(|idx| idx + 1).unwrap_or(0);
    let name = &path[name_start..];
    match name.rfind('/') {
        Some(idx) => &name[idx + 1..],
        None => name,
    }
}
