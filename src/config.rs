use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};

use crate::asset::AssetRecord;
use crate::class_tree::ClassHierarchy;
use crate::cli::Cli;

pub const HOME_ENV: &str = "ASSET_CATALOG_HOME";
pub const LOG_ENV: &str = "ASSET_CATALOG_LOG";
pub const WILDCARD: &str = "*";

pub const DEFAULT_MAX_SECONDS_PER_FRAME: f64 = 0.015;

pub fn default_soft_dependency_skip_list() -> Vec<String> {
    [
        "/Script/CoreUObject",
        "/Script/Engine",
        "/Script/BlueprintGraph",
        "/Script/UnrealEd",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub serialization: SerializationConfig,
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializationConfig {
    pub serialize_asset_registry: bool,
    pub serialize_dependencies: bool,
    pub serialize_searchable_name_dependencies: bool,
    pub serialize_manage_dependencies: bool,
    pub serialize_package_data: bool,
    pub use_tag_allowlist_instead_of_denylist: bool,
    /// `(Class=Name,Tag=Name)` entries, read when the allowlist mode is on.
    pub cooked_tags_allowlist: Vec<String>,
    /// `(Class=Name,Tag=Name)` entries, read when the allowlist mode is off.
    pub cooked_tags_denylist: Vec<String>,
}

impl Default for SerializationConfig {
    fn default() -> Self {
        Self {
            serialize_asset_registry: true,
            serialize_dependencies: true,
            serialize_searchable_name_dependencies: false,
            serialize_manage_dependencies: false,
            serialize_package_data: true,
            use_tag_allowlist_instead_of_denylist: false,
            cooked_tags_allowlist: Vec::new(),
            cooked_tags_denylist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRoot {
    /// Long package root such as `/Game`.
    pub mount_point: String,
    pub directory: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub max_seconds_per_frame: f64,
    pub soft_dependency_skip_list: Vec<String>,
    pub class_generator_names: Vec<String>,
    pub content_roots: Vec<ContentRoot>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_seconds_per_frame: DEFAULT_MAX_SECONDS_PER_FRAME,
            soft_dependency_skip_list: default_soft_dependency_skip_list(),
            class_generator_names: vec!["Blueprint".to_string()],
            content_roots: Vec::new(),
        }
    }
}

impl CatalogConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Loads `path` when it exists, the built-in defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) if path.exists() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }
}

/// Switches for what the binary catalog format writes and reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializationOptions {
    pub serialize_asset_registry: bool,
    pub serialize_dependencies: bool,
    pub serialize_searchable_name_dependencies: bool,
    pub serialize_manage_dependencies: bool,
    pub serialize_package_data: bool,
    pub use_tag_allowlist_instead_of_denylist: bool,
    /// Class name (or `*`) to tag names (or `*`).
    pub cook_filterlist_tags_by_class: HashMap<String, HashSet<String>>,
}

impl Default for SerializationOptions {
    fn default() -> Self {
        Self::from_config(&SerializationConfig::default(), &ClassHierarchy::new())
    }
}

impl SerializationOptions {
    /// Reads the flags and parses the active filter list. Entries naming a
    /// loaded class are also applied to its currently known subclasses.
    pub fn from_config(config: &SerializationConfig, classes: &ClassHierarchy) -> Self {
        let mut options = Self {
            serialize_asset_registry: config.serialize_asset_registry,
            serialize_dependencies: config.serialize_dependencies,
            serialize_searchable_name_dependencies: config.serialize_searchable_name_dependencies,
            serialize_manage_dependencies: config.serialize_manage_dependencies,
            serialize_package_data: config.serialize_package_data,
            use_tag_allowlist_instead_of_denylist: config.use_tag_allowlist_instead_of_denylist,
            cook_filterlist_tags_by_class: HashMap::new(),
        };

        let entries = if config.use_tag_allowlist_instead_of_denylist {
            &config.cooked_tags_allowlist
        } else {
            &config.cooked_tags_denylist
        };

        for entry in entries {
            let Some((class, tag)) = parse_filter_entry(entry) else {
                tracing::warn!(entry = entry.as_str(), "ignoring malformed tag filter entry");
                continue;
            };
            if classes.is_loaded(&class) {
                let no_exclusions = Default::default();
                for sub in classes.sub_classes([class.as_str()], &no_exclusions) {
                    options.add_filter(&sub, &tag);
                }
            } else {
                options.add_filter(&class, &tag);
            }
        }
        options
    }

    /// Every flag on and no tag filtering.
    pub fn for_development() -> Self {
        Self {
            serialize_asset_registry: true,
            serialize_dependencies: true,
            serialize_searchable_name_dependencies: true,
            serialize_manage_dependencies: true,
            serialize_package_data: true,
            use_tag_allowlist_instead_of_denylist: false,
            cook_filterlist_tags_by_class: HashMap::new(),
        }
    }

    pub fn add_filter(&mut self, class: &str, tag: &str) {
        self.cook_filterlist_tags_by_class
            .entry(class.to_string())
            .or_default()
            .insert(tag.to_string());
    }

    pub fn keeps_tag(&self, class: &str, tag: &str) -> bool {
        let listed = |key: &str| {
            self.cook_filterlist_tags_by_class
                .get(key)
                .is_some_and(|tags| tags.contains(tag) || tags.contains(WILDCARD))
        };
        let in_list = listed(WILDCARD) || listed(class);
        if self.use_tag_allowlist_instead_of_denylist {
            in_list
        } else {
            !in_list
        }
    }

    pub fn filter_tags(&self, record: &AssetRecord) -> BTreeMap<String, String> {
        record
            .tags
            .iter()
            .filter(|(tag, _)| self.keeps_tag(&record.class_name, tag))
            .map(|(tag, value)| (tag.clone(), value.clone()))
            .collect()
    }

    pub fn filtered_record(&self, record: &AssetRecord) -> AssetRecord {
        AssetRecord {
            tags: self.filter_tags(record),
            ..record.clone()
        }
    }
}

/// Parses `(Class=SomeClass,Tag=SomeTag)`. Surrounding parentheses are
/// optional; both keys must be present and non-empty.
pub fn parse_filter_entry(entry: &str) -> Option<(String, String)> {
    let mut trimmed = entry.trim();
    trimmed = trimmed.strip_prefix('(').unwrap_or(trimmed);
    trimmed = trimmed.strip_suffix(')').unwrap_or(trimmed);

    let mut class = String::new();
    let mut tag = String::new();
    for token in trimmed.split(',') {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        match key.trim() {
            "Class" => class = value.trim().to_string(),
            "Tag" => tag = value.trim().to_string(),
            _ => {}
        }
    }
    (!class.is_empty() && !tag.is_empty()).then_some((class, tag))
}

pub fn resolve_catalog_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(p) = cli.catalog.clone() {
        return Ok(p);
    }
    Ok(catalog_home()?.join("catalog.bin"))
}

pub fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(p) = cli.config.clone() {
        return Ok(p);
    }
    Ok(catalog_home()?.join("catalog.toml"))
}

pub fn resolve_cache_path(cli: &Cli) -> Result<Option<PathBuf>> {
    if cli.no_cache {
        return Ok(None);
    }
    if let Some(p) = cli.cache.clone() {
        return Ok(Some(p));
    }
    Ok(Some(catalog_home()?.join("scan-cache.lmdb")))
}

pub fn catalog_home() -> Result<PathBuf> {
    if let Ok(p) = env::var(HOME_ENV)
        && !p.is_empty()
    {
        return Ok(PathBuf::from(p));
    }
    let base = dirs::data_local_dir()
        .or_else(dirs::cache_dir)
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow::anyhow!("Failed to resolve data directory"))?;
    Ok(base.join("asset-catalog"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class_tree::LoadedClass;

    #[test]
    fn filter_entries_parse_with_whitespace() {
        assert_eq!(
            parse_filter_entry(" (Class=Texture2D, Tag=ImportPath) "),
            Some(("Texture2D".to_string(), "ImportPath".to_string()))
        );
        assert_eq!(parse_filter_entry("(Class=Texture2D)"), None);
        assert_eq!(parse_filter_entry("Class=*,Tag=*"), Some(("*".to_string(), "*".to_string())));
    }

    #[test]
    fn config_file_overrides_defaults() -> Result<()> {
        let config = CatalogConfig::parse(
            r#"
            [serialization]
            serialize_package_data = false
            cooked_tags_denylist = ["(Class=Texture,Tag=SourceFile)"]

            [registry]
            max_seconds_per_frame = 0.5

            [[registry.content_roots]]
            mount_point = "/Game"
            directory = "content"
            "#,
        )?;
        assert!(!config.serialization.serialize_package_data);
        assert!(config.serialization.serialize_dependencies);
        assert_eq!(config.registry.max_seconds_per_frame, 0.5);
        assert_eq!(config.registry.class_generator_names, vec!["Blueprint"]);
        assert_eq!(config.registry.content_roots[0].mount_point, "/Game");
        Ok(())
    }

    #[test]
    fn denylist_strips_tags_and_propagates_to_loaded_subclasses() {
        let mut classes = ClassHierarchy::new();
        classes.register_class(LoadedClass::new("Texture", None));
        classes.register_class(LoadedClass::new("Texture2D", Some("Texture")));
        let config = SerializationConfig {
            cooked_tags_denylist: vec!["(Class=Texture,Tag=SourceFile)".to_string()],
            ..SerializationConfig::default()
        };
        let options = SerializationOptions::from_config(&config, &classes);

        let record = AssetRecord::new("/Game/T", "T", "Texture2D")
            .with_tag("SourceFile", "t.png")
            .with_tag("Width", "512");
        let filtered = options.filtered_record(&record);
        assert_eq!(filtered.tag("SourceFile"), None);
        assert_eq!(filtered.tag("Width"), Some("512"));
    }

    #[test]
    fn allowlist_wildcards_keep_only_listed_tags() {
        let config = SerializationConfig {
            use_tag_allowlist_instead_of_denylist: true,
            cooked_tags_allowlist: vec![
                "(Class=*,Tag=PrimaryAssetType)".to_string(),
                "(Class=Map,Tag=*)".to_string(),
            ],
            ..SerializationConfig::default()
        };
        let options = SerializationOptions::from_config(&config, &ClassHierarchy::new());
        assert!(options.keeps_tag("Texture", "PrimaryAssetType"));
        assert!(!options.keeps_tag("Texture", "Width"));
        assert!(options.keeps_tag("Map", "Anything"));
        assert!(SerializationOptions::for_development().keeps_tag("Texture", "Width"));
    }
}
