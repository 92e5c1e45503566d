//! The live catalog.
//!
//! [`Registry`] owns one [`RegistryState`] plus the caches around it (folder
//! tree, class hierarchy, empty packages, in-memory assets) and merges scanner
//! batches into the index a bounded slice at a time. Everything here runs on
//! the owner thread; the scanner only hands over batches.

use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::asset::{
    AssetRecord, PRIMARY_ASSET_NAME_TAG, PRIMARY_ASSET_TYPE_TAG, PackageData, PackageFlags,
    export_text_path_to_object_name, package_of_object_path, package_path_of,
};
use crate::class_tree::{ClassHierarchy, LoadedClass};
use crate::config::{CatalogConfig, RegistryConfig, SerializationConfig, SerializationOptions};
use crate::dependency::DependencyCategory;
use crate::error::FormatError;
use crate::filter::{AssetFilter, is_path_or_descendant};
use crate::identifier::AssetIdentifier;
use crate::manage::{ManageCandidate, ManagerDecision, set_manage_references};
use crate::path_tree::PathTree;
use crate::scanner::{AssetScanner, PackageDependencyData, ScanResults};
use crate::serialization;
use crate::state::{AssetId, RegistryState};

pub const GENERATED_CLASS_TAG: &str = "GeneratedClass";
pub const PARENT_CLASS_TAG: &str = "ParentClass";

/// Decides when a tick has to hand control back.
pub trait TimeBudget {
    /// Checked after every processed item.
    fn exhausted(&mut self) -> bool;
}

/// Wall clock budget for one frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameBudget {
    deadline: Instant,
}

impl FrameBudget {
    pub fn new(max: Duration) -> Self {
        Self {
            deadline: Instant::now() + max,
        }
    }
}

impl TimeBudget for FrameBudget {
    fn exhausted(&mut self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// Never runs out; drains everything in one pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unbounded;

impl TimeBudget for Unbounded {
    fn exhausted(&mut self) -> bool {
        false
    }
}

/// Allows a fixed number of items per tick (at least one).
#[derive(Debug, Clone, Copy)]
pub struct ItemBudget(pub usize);

impl TimeBudget for ItemBudget {
    fn exhausted(&mut self) -> bool {
        self.0 = self.0.saturating_sub(1);
        self.0 == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStatus {
    Drained,
    MoreWork,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileLoadProgress {
    pub total: usize,
    pub processed: usize,
    pub pending: usize,
    pub discovering: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    PathAdded(String),
    PathRemoved(String),
    AssetAdded(AssetRecord),
    AssetRemoved(AssetRecord),
    AssetUpdated(AssetRecord),
    AssetRenamed {
        record: AssetRecord,
        old_object_path: String,
    },
    InMemoryAssetCreated(AssetRecord),
    InMemoryAssetDeleted(AssetRecord),
    FileLoadProgress(FileLoadProgress),
    /// The initial search finished. Fired once.
    FilesLoaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn FnMut(&RegistryEvent)>;

#[derive(Debug, Default)]
struct PendingResults {
    paths: VecDeque<String>,
    records: VecDeque<AssetRecord>,
    dependencies: VecDeque<PackageDependencyData>,
    cooked: VecDeque<String>,
}

impl PendingResults {
    fn push(&mut self, results: ScanResults) {
        self.paths.extend(results.discovered_paths);
        self.records.extend(results.asset_records);
        self.dependencies.extend(results.dependency_data);
        self.cooked.extend(results.cooked_packages_without_metadata);
    }

    fn len(&self) -> usize {
        self.paths.len() + self.records.len() + self.dependencies.len() + self.cooked.len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn status(&self) -> TickStatus {
        if self.is_empty() {
            TickStatus::Drained
        } else {
            TickStatus::MoreWork
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ScannerStatus {
    pending_files: usize,
    pending_paths: usize,
    discovering: bool,
}

impl ScannerStatus {
    fn is_searching(&self) -> bool {
        self.discovering || self.pending_files > 0 || self.pending_paths > 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub assets: usize,
    pub packages: usize,
    pub dependency_nodes: usize,
    pub package_data: usize,
    pub cached_paths: usize,
    pub in_memory_assets: usize,
    pub empty_packages: usize,
    pub pending_results: usize,
    pub cooked_packages_without_metadata: usize,
    pub initial_search_completed: bool,
}

pub struct Registry {
    state: RegistryState,
    paths: PathTree,
    classes: ClassHierarchy,
    config: RegistryConfig,
    serialization_config: SerializationConfig,
    options: SerializationOptions,
    scanner: Option<Box<dyn AssetScanner>>,
    pending: PendingResults,
    scanner_status: ScannerStatus,
    in_memory: BTreeMap<String, AssetRecord>,
    empty_packages: HashSet<String>,
    cooked_without_metadata: BTreeSet<String>,
    synchronously_scanned: HashSet<String>,
    skip_list: HashSet<String>,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
    created_at: Instant,
    search_started_at: Option<Instant>,
    initial_search_completed: bool,
}

impl Registry {
    pub fn new(config: &CatalogConfig) -> Self {
        let classes = ClassHierarchy::new();
        let options = SerializationOptions::from_config(&config.serialization, &classes);
        Self {
            state: RegistryState::new(),
            paths: PathTree::new(),
            classes,
            skip_list: config.registry.soft_dependency_skip_list.iter().cloned().collect(),
            config: config.registry.clone(),
            serialization_config: config.serialization.clone(),
            options,
            scanner: None,
            pending: PendingResults::default(),
            scanner_status: ScannerStatus::default(),
            in_memory: BTreeMap::new(),
            empty_packages: HashSet::new(),
            cooked_without_metadata: BTreeSet::new(),
            synchronously_scanned: HashSet::new(),
            listeners: Vec::new(),
            next_listener: 0,
            created_at: Instant::now(),
            search_started_at: None,
            initial_search_completed: false,
        }
    }

    pub fn with_scanner(mut self, scanner: impl AssetScanner + 'static) -> Self {
        self.scanner = Some(Box::new(scanner));
        self
    }

    pub fn set_scanner(&mut self, scanner: Box<dyn AssetScanner>) {
        self.scanner = Some(scanner);
    }

    pub fn state(&self) -> &RegistryState {
        &self.state
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn serialization_options(&self) -> &SerializationOptions {
        &self.options
    }

    pub fn set_serialization_options(&mut self, options: SerializationOptions) {
        self.options = options;
    }

    // ---- Events --------------------------------------------------------------

    pub fn subscribe(&mut self, listener: impl FnMut(&RegistryEvent) + 'static) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != before
    }

    fn emit(&mut self, event: RegistryEvent) {
        for (_, listener) in self.listeners.iter_mut() {
            listener(&event);
        }
    }

    // ---- Classes -------------------------------------------------------------

    /// Registers a class known to the host. Serialization filters mentioning a
    /// class propagate to subclasses registered before the options are
    /// rebuilt with [`Registry::refresh_serialization_options`].
    pub fn register_class(&mut self, class: LoadedClass) {
        self.classes.register_class(class);
    }

    pub fn unregister_class(&mut self, name: &str) -> bool {
        self.classes.unregister_class(name)
    }

    pub fn refresh_serialization_options(&mut self) {
        self.options = SerializationOptions::from_config(&self.serialization_config, &self.classes);
    }

    pub fn get_ancestor_class_names(&self, class: &str) -> Option<Vec<String>> {
        self.classes.ancestors(class)
    }

    pub fn get_derived_class_names<'a>(
        &self,
        classes: impl IntoIterator<Item = &'a str>,
        excluded: &BTreeSet<String>,
    ) -> BTreeSet<String> {
        self.classes.sub_classes(classes, excluded)
    }

    fn is_class_generator(&self, record: &AssetRecord) -> bool {
        self.config
            .class_generator_names
            .iter()
            .any(|name| *name == record.class_name)
    }

    fn generated_class_name(&self, record: &AssetRecord) -> Option<String> {
        if !self.is_class_generator(record) {
            return None;
        }
        record
            .tag(GENERATED_CLASS_TAG)
            .filter(|tag| !tag.is_empty())
            .map(|tag| export_text_path_to_object_name(tag).to_string())
    }

    fn cache_generated_class(&mut self, record: &AssetRecord) {
        let Some(generated) = self.generated_class_name(record) else {
            return;
        };
        if let Some(parent) = record.tag(PARENT_CLASS_TAG).filter(|tag| !tag.is_empty()) {
            let parent = export_text_path_to_object_name(parent).to_string();
            self.classes.cache_generated_class(&generated, Some(parent.as_str()));
        }
    }

    fn uncache_generated_class(&mut self, record: &AssetRecord) {
        if let Some(generated) = self.generated_class_name(record) {
            self.classes.uncache_generated_class(&generated);
        }
    }

    // ---- Paths ---------------------------------------------------------------

    pub fn add_path(&mut self, path: &str) -> bool {
        if self.paths.cache_path(path) {
            self.emit(RegistryEvent::PathAdded(path.trim_end_matches('/').to_string()));
            true
        } else {
            false
        }
    }

    /// Fails while assets still live under `path`, unless
    /// `even_if_assets_still_exist`.
    pub fn remove_path(&mut self, path: &str, even_if_assets_still_exist: bool) -> bool {
        if !even_if_assets_still_exist && !self.get_assets_by_path(path, true).is_empty() {
            return false;
        }
        if self.paths.remove_path(path) {
            self.emit(RegistryEvent::PathRemoved(path.trim_end_matches('/').to_string()));
            true
        } else {
            false
        }
    }

    pub fn get_all_cached_paths(&self) -> Vec<String> {
        self.paths.all_paths().map(str::to_string).collect()
    }

    pub fn get_sub_paths(&self, base: &str, recurse: bool) -> Vec<String> {
        self.paths.sub_paths(base, recurse)
    }

    // ---- Queries -------------------------------------------------------------

    /// Replaces recursive paths and classes with their explicit expansion.
    pub fn expand_recursive_filter(&self, filter: &AssetFilter) -> AssetFilter {
        let mut expanded = filter.clone();
        if filter.recursive_paths {
            for path in filter.package_paths.iter() {
                expanded.package_paths.extend(self.paths.sub_paths(path, true));
            }
        }
        if filter.recursive_classes {
            expanded.class_names = self.classes.sub_classes(
                filter.class_names.iter().map(String::as_str),
                &filter.recursive_classes_exclusion_set,
            );
        }
        expanded.recursive_paths = false;
        expanded.recursive_classes = false;
        expanded.recursive_classes_exclusion_set.clear();
        expanded
    }

    /// In-memory assets first, then disk-backed ones not shadowed by them.
    /// `None` when the filter is rejected.
    pub fn get_assets(&self, filter: &AssetFilter) -> Option<Vec<AssetRecord>> {
        if let Err(err) = filter.validate_constrained(true) {
            tracing::warn!("rejected asset filter: {err}");
            return None;
        }
        let expanded = self.expand_recursive_filter(filter);

        let mut skip = self.empty_packages.clone();
        let mut out = Vec::new();
        if !expanded.include_only_on_disk_assets {
            for record in self.live_in_memory() {
                skip.insert(record.package_name.clone());
                if expanded.matches(record, None) {
                    out.push(record.clone());
                }
            }
        }

        match self.state.get_assets(&expanded, &skip) {
            Ok(records) => {
                out.extend(records.into_iter().cloned());
                Some(out)
            }
            Err(err) => {
                tracing::warn!("rejected expanded asset filter: {err}");
                None
            }
        }
    }

    pub fn get_all_assets(&self, include_only_on_disk: bool) -> Vec<AssetRecord> {
        let mut skip = self.empty_packages.clone();
        let mut out = Vec::new();
        if !include_only_on_disk {
            for record in self.live_in_memory() {
                skip.insert(record.package_name.clone());
                out.push(record.clone());
            }
        }
        out.extend(self.state.get_all_assets(&skip).into_iter().cloned());
        out
    }

    fn live_in_memory(&self) -> impl Iterator<Item = &AssetRecord> + '_ {
        self.in_memory
            .values()
            .filter(|record| !record.package_flags.contains(PackageFlags::FOR_DIFFING))
    }

    pub fn get_assets_by_package_name(&self, package_name: &str, include_only_on_disk: bool) -> Vec<AssetRecord> {
        let filter = AssetFilter::new()
            .package_name(package_name)
            .only_on_disk(include_only_on_disk);
        self.get_assets(&filter).unwrap_or_default()
    }

    pub fn get_assets_by_path(&self, package_path: &str, recursive: bool) -> Vec<AssetRecord> {
        let filter = AssetFilter::new()
            .package_path(package_path.trim_end_matches('/'))
            .recursive_paths(recursive);
        self.get_assets(&filter).unwrap_or_default()
    }

    pub fn get_assets_by_class(&self, class_name: &str, search_sub_classes: bool) -> Vec<AssetRecord> {
        let filter = AssetFilter::new()
            .class_name(class_name)
            .recursive_classes(search_sub_classes);
        self.get_assets(&filter).unwrap_or_default()
    }

    pub fn get_assets_by_tag_values<'a>(&self, tags_and_values: impl IntoIterator<Item = (&'a str, &'a str)>) -> Vec<AssetRecord> {
        let filter = tags_and_values
            .into_iter()
            .fold(AssetFilter::new(), |filter, (tag, value)| filter.tag(tag, value));
        self.get_assets(&filter).unwrap_or_default()
    }

    pub fn get_asset_by_object_path(&self, object_path: &str, include_only_on_disk: bool) -> Option<AssetRecord> {
        if !include_only_on_disk
            && let Some(record) = self.in_memory.get(object_path)
        {
            return Some(record.clone());
        }
        self.state.asset_by_object_path(object_path).cloned()
    }

    /// Applies `filter` to loose records, e.g. results from another source.
    pub fn run_assets_through_filter(&self, records: &mut Vec<AssetRecord>, filter: &AssetFilter) {
        if filter.is_empty() {
            return;
        }
        let requested: Option<HashSet<String>> = (filter.recursive_classes && !filter.class_names.is_empty())
            .then(|| {
                self.classes
                    .sub_classes(
                        filter.class_names.iter().map(String::as_str),
                        &filter.recursive_classes_exclusion_set,
                    )
                    .into_iter()
                    .collect()
            });
        records.retain(|record| filter.matches(record, requested.as_ref()));
    }

    pub fn get_dependencies(&self, identifier: &AssetIdentifier, mask: DependencyCategory) -> Option<Vec<AssetIdentifier>> {
        self.state.get_dependencies(identifier, mask)
    }

    pub fn get_referencers(&self, identifier: &AssetIdentifier, mask: DependencyCategory) -> Option<Vec<AssetIdentifier>> {
        self.state.get_referencers(identifier, mask)
    }

    /// Package names only, deduplicated in first-seen order.
    pub fn get_package_dependencies(&self, package_name: &str, mask: DependencyCategory) -> Option<Vec<String>> {
        self.get_dependencies(&AssetIdentifier::package(package_name), mask)
            .map(|ids| unique_packages(&ids))
    }

    pub fn get_package_referencers(&self, package_name: &str, mask: DependencyCategory) -> Option<Vec<String>> {
        self.get_referencers(&AssetIdentifier::package(package_name), mask)
            .map(|ids| unique_packages(&ids))
    }

    pub fn get_package_data(&self, package_name: &str) -> Option<&PackageData> {
        self.state.package_data(package_name)
    }

    pub fn is_loading_assets(&self) -> bool {
        !self.initial_search_completed
    }

    pub fn cooked_packages_without_metadata(&self) -> impl Iterator<Item = &str> + '_ {
        self.cooked_without_metadata.iter().map(String::as_str)
    }

    pub fn is_empty_package(&self, package_name: &str) -> bool {
        self.empty_packages.contains(package_name)
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            assets: self.state.num_assets(),
            packages: self.state.package_names().count(),
            dependency_nodes: self.state.num_dependency_nodes(),
            package_data: self.state.num_package_data(),
            cached_paths: self.paths.len(),
            in_memory_assets: self.in_memory.len(),
            empty_packages: self.empty_packages.len(),
            pending_results: self.pending.len(),
            cooked_packages_without_metadata: self.cooked_without_metadata.len(),
            initial_search_completed: self.initial_search_completed,
        }
    }

    // ---- Mutations -----------------------------------------------------------

    pub fn set_primary_asset_id_for_object_path(&mut self, object_path: &str, asset_type: &str, asset_name: &str) -> bool {
        let Some(id) = self.state.asset_id(object_path) else {
            return false;
        };
        let Some(mut record) = self.state.asset(id).cloned() else {
            return false;
        };
        record.tags.insert(PRIMARY_ASSET_TYPE_TAG.to_string(), asset_type.to_string());
        record.tags.insert(PRIMARY_ASSET_NAME_TAG.to_string(), asset_name.to_string());
        self.update_asset_data(id, record)
    }

    pub fn set_manage_references(
        &mut self,
        manager_map: &[(AssetIdentifier, AssetIdentifier)],
        clear_existing: bool,
        recurse: DependencyCategory,
        should_set: impl FnMut(&ManageCandidate<'_>) -> ManagerDecision,
    ) -> usize {
        set_manage_references(&mut self.state, manager_map, clear_existing, recurse, should_set)
    }

    fn add_asset_data(&mut self, record: AssetRecord) -> bool {
        match self.state.add_asset(record.clone()) {
            Ok(_) => {
                self.cache_generated_class(&record);
                self.emit(RegistryEvent::AssetAdded(record));
                true
            }
            Err(err) => {
                tracing::warn!("failed to add asset: {err}");
                false
            }
        }
    }

    fn update_asset_data(&mut self, id: AssetId, record: AssetRecord) -> bool {
        let Some(old) = self.state.asset(id).cloned() else {
            return false;
        };
        if old == record {
            return true;
        }
        self.uncache_generated_class(&old);
        self.cache_generated_class(&record);
        match self.state.update_asset(id, record.clone()) {
            Ok(()) => {
                self.emit(RegistryEvent::AssetUpdated(record));
                true
            }
            Err(err) => {
                tracing::warn!("failed to update asset {}: {err}", old.object_path);
                false
            }
        }
    }

    fn remove_asset_data(&mut self, id: AssetId) -> bool {
        let Some(record) = self.state.asset(id).cloned() else {
            return false;
        };
        match self.state.remove_asset(id) {
            Ok(_) => {
                self.uncache_generated_class(&record);
                self.emit(RegistryEvent::AssetRemoved(record));
                true
            }
            Err(err) => {
                tracing::warn!("failed to remove asset {}: {err}", record.object_path);
                false
            }
        }
    }

    /// Removes every disk-backed record of `package_name`.
    pub fn remove_package_data(&mut self, package_name: &str) -> usize {
        let ids: Vec<AssetId> = self.state.package_bucket(package_name).to_vec();
        ids.into_iter().filter(|id| self.remove_asset_data(*id)).count()
    }

    // ---- In-memory assets ----------------------------------------------------

    pub fn asset_created(&mut self, mut record: AssetRecord) {
        record.package_flags.insert(PackageFlags::NEWLY_CREATED);
        self.empty_packages.remove(&record.package_name);
        let path = record.package_path.clone();
        self.add_path(&path);
        self.in_memory.insert(record.object_path.clone(), record.clone());
        self.emit(RegistryEvent::AssetAdded(record.clone()));
        self.emit(RegistryEvent::InMemoryAssetCreated(record));
    }

    pub fn asset_deleted(&mut self, object_path: &str) -> bool {
        let Some(record) = self.in_memory.remove(object_path) else {
            return false;
        };
        if !self.has_in_memory_assets(&record.package_name) {
            self.empty_packages.insert(record.package_name.clone());
        }
        self.emit(RegistryEvent::AssetRemoved(record.clone()));
        self.emit(RegistryEvent::InMemoryAssetDeleted(record));
        true
    }

    pub fn asset_renamed(&mut self, record: AssetRecord, old_object_path: &str) {
        self.in_memory.remove(old_object_path);
        self.empty_packages.remove(&record.package_name);
        let old_package = package_of_object_path(old_object_path).to_string();
        self.in_memory.insert(record.object_path.clone(), record.clone());
        if old_package != record.package_name && !self.has_in_memory_assets(&old_package) {
            self.empty_packages.insert(old_package);
        }
        let path = package_path_of(&record.package_name).to_string();
        self.add_path(&path);
        self.emit(RegistryEvent::AssetRenamed {
            record,
            old_object_path: old_object_path.to_string(),
        });
    }

    fn has_in_memory_assets(&self, package_name: &str) -> bool {
        self.in_memory
            .values()
            .any(|record| record.package_name == package_name)
    }

    // ---- Search --------------------------------------------------------------

    pub fn search_all_assets(&mut self, synchronous: bool) {
        self.search_started_at = Some(Instant::now());
        let roots: Vec<String> = self
            .config
            .content_roots
            .iter()
            .map(|root| root.mount_point.clone())
            .collect();
        if synchronous {
            self.scan_paths_and_files_synchronous(&roots, &[], false);
            self.try_complete_initial_search();
        } else {
            self.add_paths_to_search(&roots);
        }
    }

    pub fn add_paths_to_search(&mut self, paths: &[String]) {
        if let Some(scanner) = self.scanner.as_mut() {
            scanner.add_search_paths(paths);
            self.scanner_status.discovering = true;
        }
    }

    pub fn add_path_to_search(&mut self, path: &str) {
        self.add_paths_to_search(&[path.to_string()]);
    }

    pub fn add_files_to_search(&mut self, package_names: &[String]) {
        if let Some(scanner) = self.scanner.as_mut() {
            scanner.add_files(package_names);
            self.scanner_status.discovering = true;
        }
    }

    pub fn prioritize_search_path(&mut self, path: &str) {
        if let Some(scanner) = self.scanner.as_mut() {
            scanner.prioritize_search_path(path);
        }
        let (mut front, back): (VecDeque<AssetRecord>, VecDeque<AssetRecord>) = self
            .pending
            .records
            .drain(..)
            .partition(|record| is_path_or_descendant(&record.package_path, path));
        front.extend(back);
        self.pending.records = front;

        let (mut front, back): (VecDeque<PackageDependencyData>, VecDeque<PackageDependencyData>) = self
            .pending
            .dependencies
            .drain(..)
            .partition(|data| is_path_or_descendant(package_path_of(&data.package_name), path));
        front.extend(back);
        self.pending.dependencies = front;
    }

    pub fn scan_paths_synchronous(&mut self, paths: &[String], force_rescan: bool) -> usize {
        self.scan_paths_and_files_synchronous(paths, &[], force_rescan)
    }

    pub fn scan_files_synchronous(&mut self, package_names: &[String], force_rescan: bool) -> usize {
        self.scan_paths_and_files_synchronous(&[], package_names, force_rescan)
    }

    /// Scans on this thread and merges everything found, bypassing the frame
    /// budget. Each path or file is scanned once unless `force_rescan`.
    /// Returns the number of asset records found.
    pub fn scan_paths_and_files_synchronous(&mut self, paths: &[String], files: &[String], force_rescan: bool) -> usize {
        let started = Instant::now();
        let mut memo = |items: &[String]| -> Vec<String> {
            items
                .iter()
                .filter(|item| self.synchronously_scanned.insert((*item).clone()) || force_rescan)
                .cloned()
                .collect()
        };
        let paths_to_scan = memo(paths);
        let files_to_scan = memo(files);
        if paths_to_scan.is_empty() && files_to_scan.is_empty() {
            return 0;
        }
        let Some(scanner) = self.scanner.as_mut() else {
            tracing::warn!("synchronous scan requested without a scanner");
            return 0;
        };

        let results = scanner.scan_synchronous(&paths_to_scan, &files_to_scan);
        let found = results.asset_records.len();
        let mut batch = PendingResults::default();
        batch.push(results);
        self.drain(&mut batch, &mut Unbounded);

        let first = paths_to_scan.first().or(files_to_scan.first()).cloned().unwrap_or_default();
        let others = paths_to_scan.len() + files_to_scan.len() - 1;
        tracing::debug!(
            "synchronous scan of '{first}' and {others} other paths found {found} assets in {:.4} seconds",
            started.elapsed().as_secs_f64()
        );
        found
    }

    pub fn on_content_path_mounted(&mut self, mount_point: &str) {
        self.add_path_to_search(mount_point);
    }

    /// Drops every record under `mount_point` and the root path itself.
    pub fn on_content_path_dismounted(&mut self, mount_point: &str) {
        let root = mount_point.trim_end_matches('/').to_string();
        let mut folders = self.paths.sub_paths(&root, true);
        folders.push(root.clone());

        let doomed: Vec<AssetId> = folders
            .iter()
            .flat_map(|folder| self.state.path_bucket(folder).iter().copied())
            .collect();
        for id in doomed {
            self.remove_asset_data(id);
        }
        self.remove_path(&root, true);
    }

    // ---- Ingestion -----------------------------------------------------------

    /// One frame of ingestion under the configured `max_seconds_per_frame`.
    pub fn tick(&mut self) -> TickStatus {
        if self.config.max_seconds_per_frame > 0.0 {
            let mut budget = FrameBudget::new(Duration::from_secs_f64(self.config.max_seconds_per_frame));
            self.tick_with_budget(&mut budget)
        } else {
            self.tick_with_budget(&mut Unbounded)
        }
    }

    /// Pulls the scanner's results and drains pending work until `budget` is
    /// exhausted. Returns `MoreWork` while anything is queued or the scanner
    /// is still searching.
    pub fn tick_with_budget(&mut self, budget: &mut dyn TimeBudget) -> TickStatus {
        if let Some(scanner) = self.scanner.as_mut() {
            let results = scanner.get_and_drain_results();
            for seconds in results.search_times.iter() {
                tracing::debug!("background search completed in {seconds:.4} seconds");
            }
            self.scanner_status = ScannerStatus {
                pending_files: results.pending_files,
                pending_paths: results.pending_paths,
                discovering: results.is_discovering,
            };
            self.pending.push(results);
        }

        let queued = self.pending.len();
        let had_work = queued > 0;
        let mut pending = std::mem::take(&mut self.pending);
        let status = self.drain(&mut pending, budget);
        self.pending = pending;
        if had_work {
            tracing::debug!(
                processed = queued - self.pending.len(),
                remaining = self.pending.len(),
                "ingestion tick"
            );
        }

        let searching = self.scanner_status.is_searching();
        if searching || had_work {
            let progress = self.progress();
            self.emit(RegistryEvent::FileLoadProgress(progress));
        }

        if status == TickStatus::Drained && !searching {
            self.try_complete_initial_search();
            TickStatus::Drained
        } else {
            TickStatus::MoreWork
        }
    }

    /// Ticks without a budget until nothing is queued and the scanner is idle,
    /// or `timeout` passes.
    pub fn wait_for_completion(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.tick_with_budget(&mut Unbounded) == TickStatus::Drained {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn progress(&self) -> FileLoadProgress {
        let assets = self.state.num_assets();
        let dependencies = self.pending.dependencies.len();
        let files = self.scanner_status.pending_files;
        FileLoadProgress {
            total: assets + self.pending.records.len() + dependencies + files,
            processed: assets.saturating_sub(dependencies),
            pending: files + dependencies,
            discovering: self.scanner_status.discovering,
        }
    }

    fn try_complete_initial_search(&mut self) {
        if self.initial_search_completed {
            return;
        }
        self.initial_search_completed = true;
        let started = self.search_started_at.unwrap_or(self.created_at);
        tracing::info!(
            "asset discovery completed in {:.4} seconds",
            started.elapsed().as_secs_f64()
        );
        self.emit(RegistryEvent::FilesLoaded);
    }

    /// Paths, then records, then dependency data, then cooked packages. Each
    /// stage stops as soon as the budget runs out and leaves the rest queued.
    fn drain(&mut self, batch: &mut PendingResults, budget: &mut dyn TimeBudget) -> TickStatus {
        while let Some(path) = batch.paths.pop_front() {
            self.add_path(&path);
            if budget.exhausted() {
                return batch.status();
            }
        }
        while let Some(record) = batch.records.pop_front() {
            self.asset_search_data_gathered(record);
            if budget.exhausted() {
                return batch.status();
            }
        }
        while let Some(data) = batch.dependencies.pop_front() {
            self.dependency_data_gathered(data);
            if budget.exhausted() {
                return batch.status();
            }
        }
        while let Some(package) = batch.cooked.pop_front() {
            tracing::debug!(package = package.as_str(), "cooked package has no asset metadata");
            self.cooked_without_metadata.insert(package);
            if budget.exhausted() {
                return batch.status();
            }
        }
        TickStatus::Drained
    }

    fn asset_search_data_gathered(&mut self, record: AssetRecord) {
        let path = record.package_path.clone();
        match self.state.asset_id(&record.object_path) {
            Some(id) => {
                self.update_asset_data(id, record);
            }
            None => {
                self.add_asset_data(record);
            }
        }
        self.add_path(&path);
    }

    /// Replaces every edge of the package with what the scan found.
    fn dependency_data_gathered(&mut self, data: PackageDependencyData) {
        let PackageDependencyData {
            package_name,
            package_data,
            imports,
            soft_references,
            searchable_names,
        } = data;

        *self.state.create_or_get_package_data(&package_name) = package_data;
        let node = self.state.create_or_find_node(&AssetIdentifier::package(package_name.as_str()));
        self.state
            .graph_mut()
            .clear_dependencies(node, DependencyCategory::ALL);

        for name in searchable_names {
            let identifier = AssetIdentifier::value(name.package_name, name.object_name, name.value_name);
            let target = self.state.create_or_find_node(&identifier);
            self.state
                .graph_mut()
                .connect(node, target, DependencyCategory::SEARCHABLE_NAME);
        }

        let mut seen: HashSet<String> = HashSet::new();
        let mut edges: Vec<(String, DependencyCategory)> = Vec::new();
        for import in imports {
            if import.is_empty() || self.skip_list.contains(&import) || !seen.insert(import.clone()) {
                continue;
            }
            edges.push((import, DependencyCategory::HARD));
        }
        for reference in soft_references {
            if reference.is_empty() || self.skip_list.contains(&reference) || !seen.insert(reference.clone()) {
                continue;
            }
            if !reference.starts_with('/') {
                tracing::warn!(
                    package = package_name.as_str(),
                    reference = reference.as_str(),
                    "soft reference uses a short package name, resave the package to fix it"
                );
            }
            edges.push((reference, DependencyCategory::SOFT));
        }
        for (target, category) in edges {
            let target = self.state.create_or_find_node(&AssetIdentifier::package(target));
            self.state.graph_mut().connect(node, target, category);
        }
    }

    /// Queues a batch as if the scanner had produced it.
    pub fn enqueue_results(&mut self, results: ScanResults) {
        self.pending.push(results);
    }

    // ---- Persistence ---------------------------------------------------------

    /// Writes the catalog. With `override_records` only those records are
    /// written, together with the edges and package data that still apply.
    pub fn save(&self, path: &Path, override_records: Option<&[AssetRecord]>) -> Result<usize> {
        if !self.options.serialize_asset_registry {
            tracing::info!("catalog serialization is disabled, nothing written");
            return Ok(0);
        }
        match override_records {
            Some(records) if !records.is_empty() => {
                let temp = RegistryState::initialize_from_existing(&self.state, Some(records), &self.options);
                serialization::save_to_file(path, &temp, &self.options)
            }
            _ => serialization::save_to_file(path, &self.state, &self.options),
        }
    }

    pub fn load(&mut self, path: &Path) -> Result<()> {
        let state = serialization::load_from_file(path, &self.options)?;
        self.install_state(state);
        Ok(())
    }

    pub fn load_bytes(&mut self, bytes: &[u8]) -> Result<(), FormatError> {
        let state = serialization::deserialize(bytes, &self.options)?;
        self.install_state(state);
        Ok(())
    }

    pub fn save_bytes(&self) -> Vec<u8> {
        serialization::serialize(&self.state, &self.options)
    }

    fn install_state(&mut self, state: RegistryState) {
        self.state = state;
        let records: Vec<AssetRecord> = self.state.iter_assets().map(|(_, r)| r.clone()).collect();
        tracing::info!(assets = records.len(), "catalog loaded");
        for record in records.iter() {
            self.add_path(&record.package_path);
            self.cache_generated_class(record);
        }
    }
}

fn unique_packages(identifiers: &[AssetIdentifier]) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::new();
    identifiers
        .iter()
        .filter_map(AssetIdentifier::package_name)
        .filter(|name| seen.insert(*name))
        .map(str::to_string)
        .collect()
}
