//! The catalog index.
//!
//! [`RegistryState`] owns every [`AssetRecord`] in an arena and keeps five
//! secondary maps over it: object path (1:1), package name, folder path, class
//! name and tag key (1:N). Buckets store [`AssetId`] handles, so an update
//! migrates handles between buckets and the handle held by callers stays valid.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::asset::{AssetRecord, PackageData};
use crate::config::SerializationOptions;
use crate::dependency::{DependencyCategory, DependencyGraph, NodeId};
use crate::error::{FilterError, IndexError};
use crate::filter::{AssetFilter, merge_intersect};
use crate::identifier::AssetIdentifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetId(u32);

impl AssetId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

type Buckets = HashMap<String, Vec<AssetId>>;

#[derive(Debug, Clone, Default)]
pub struct RegistryState {
    records: Vec<Option<AssetRecord>>,
    free: Vec<u32>,
    by_object_path: HashMap<String, AssetId>,
    by_package_name: Buckets,
    by_path: Buckets,
    by_class: Buckets,
    by_tag: Buckets,
    package_data: HashMap<String, PackageData>,
    graph: DependencyGraph,
}

fn bucket_insert(buckets: &mut Buckets, key: &str, id: AssetId) {
    let bucket = buckets.entry(key.to_string()).or_default();
    if !bucket.contains(&id) {
        bucket.push(id);
    }
}

fn bucket_remove(buckets: &mut Buckets, key: &str, id: AssetId) {
    if let Some(bucket) = buckets.get_mut(key) {
        bucket.retain(|existing| *existing != id);
        if bucket.is_empty() {
            buckets.remove(key);
        }
    }
}

impl RegistryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn num_assets(&self) -> usize {
        self.by_object_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_object_path.is_empty()
    }

    pub fn num_dependency_nodes(&self) -> usize {
        self.graph.len()
    }

    pub fn num_package_data(&self) -> usize {
        self.package_data.len()
    }

    pub fn reserve(&mut self, assets: usize) {
        self.records.reserve(assets);
        self.by_object_path.reserve(assets);
    }

    // ---- Records -------------------------------------------------------------

    pub fn add_asset(&mut self, record: AssetRecord) -> Result<AssetId, IndexError> {
        if self.by_object_path.contains_key(&record.object_path) {
            return Err(IndexError::DuplicateObjectPath(record.object_path));
        }
        let id = match self.free.pop() {
            Some(slot) => AssetId(slot),
            None => {
                self.records.push(None);
                AssetId((self.records.len() - 1) as u32)
            }
        };
        self.index_record(id, &record);
        self.records[id.index()] = Some(record);
        Ok(id)
    }

    fn index_record(&mut self, id: AssetId, record: &AssetRecord) {
        self.by_object_path.insert(record.object_path.clone(), id);
        bucket_insert(&mut self.by_package_name, &record.package_name, id);
        bucket_insert(&mut self.by_path, &record.package_path, id);
        bucket_insert(&mut self.by_class, &record.class_name, id);
        for key in record.tags.keys() {
            bucket_insert(&mut self.by_tag, key, id);
        }
    }

    /// Replaces the record behind `id`, migrating it only between the buckets
    /// whose key actually changed. The handle is preserved.
    pub fn update_asset(&mut self, id: AssetId, new_record: AssetRecord) -> Result<(), IndexError> {
        let old = self.asset(id).ok_or(IndexError::StaleHandle(id.0))?;

        if old.object_path != new_record.object_path
            && self.by_object_path.contains_key(&new_record.object_path)
        {
            return Err(IndexError::DuplicateObjectPath(new_record.object_path));
        }

        let old_object_path = old.object_path.clone();
        let old_package = old.package_name.clone();
        let old_path = old.package_path.clone();
        let old_class = old.class_name.clone();
        let old_tags: BTreeSet<String> = old.tags.keys().cloned().collect();
        let new_tags: BTreeSet<String> = new_record.tags.keys().cloned().collect();

        if old_object_path != new_record.object_path {
            self.by_object_path.remove(&old_object_path);
            self.by_object_path.insert(new_record.object_path.clone(), id);
        }
        if old_package != new_record.package_name {
            bucket_remove(&mut self.by_package_name, &old_package, id);
            bucket_insert(&mut self.by_package_name, &new_record.package_name, id);
        }
        if old_path != new_record.package_path {
            bucket_remove(&mut self.by_path, &old_path, id);
            bucket_insert(&mut self.by_path, &new_record.package_path, id);
        }
        if old_class != new_record.class_name {
            bucket_remove(&mut self.by_class, &old_class, id);
            bucket_insert(&mut self.by_class, &new_record.class_name, id);
        }
        for removed in old_tags.difference(&new_tags) {
            bucket_remove(&mut self.by_tag, removed, id);
        }
        for added in new_tags.difference(&old_tags) {
            bucket_insert(&mut self.by_tag, added, id);
        }

        self.records[id.index()] = Some(new_record);
        Ok(())
    }

    /// Removes the record from every bucket. When it was the last record of
    /// its package, the package's dependency node and package data go too.
    pub fn remove_asset(&mut self, id: AssetId) -> Result<AssetRecord, IndexError> {
        let record = self
            .records
            .get_mut(id.index())
            .and_then(Option::take)
            .ok_or(IndexError::StaleHandle(id.0))?;
        self.free.push(id.0);

        self.by_object_path.remove(&record.object_path);
        bucket_remove(&mut self.by_package_name, &record.package_name, id);
        bucket_remove(&mut self.by_path, &record.package_path, id);
        bucket_remove(&mut self.by_class, &record.class_name, id);
        for key in record.tags.keys() {
            bucket_remove(&mut self.by_tag, key, id);
        }

        if !self.by_package_name.contains_key(&record.package_name) {
            self.graph
                .remove(&AssetIdentifier::package(record.package_name.as_str()));
            self.package_data.remove(&record.package_name);
        }
        Ok(record)
    }

    pub fn remove_asset_by_object_path(&mut self, object_path: &str) -> Result<AssetRecord, IndexError> {
        let id = self
            .asset_id(object_path)
            .ok_or_else(|| IndexError::UnknownAsset(object_path.to_string()))?;
        self.remove_asset(id)
    }

    pub fn asset(&self, id: AssetId) -> Option<&AssetRecord> {
        self.records.get(id.index()).and_then(Option::as_ref)
    }

    pub fn asset_id(&self, object_path: &str) -> Option<AssetId> {
        self.by_object_path.get(object_path).copied()
    }

    pub fn asset_by_object_path(&self, object_path: &str) -> Option<&AssetRecord> {
        self.asset_id(object_path).and_then(|id| self.asset(id))
    }

    pub fn iter_assets(&self) -> impl Iterator<Item = (AssetId, &AssetRecord)> + '_ {
        self.records
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|record| (AssetId(idx as u32), record)))
    }

    fn resolve<'a>(&'a self, ids: &'a [AssetId]) -> impl Iterator<Item = &'a AssetRecord> + 'a {
        ids.iter().filter_map(|id| self.asset(*id))
    }

    pub fn package_bucket(&self, package_name: &str) -> &[AssetId] {
        self.by_package_name
            .get(package_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn path_bucket(&self, package_path: &str) -> &[AssetId] {
        self.by_path.get(package_path).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn class_bucket(&self, class_name: &str) -> &[AssetId] {
        self.by_class.get(class_name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn tag_bucket(&self, tag: &str) -> &[AssetId] {
        self.by_tag.get(tag).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn assets_by_package_name(&self, package_name: &str) -> Vec<&AssetRecord> {
        self.resolve(self.package_bucket(package_name)).collect()
    }

    pub fn assets_by_path(&self, package_path: &str) -> Vec<&AssetRecord> {
        self.resolve(self.path_bucket(package_path)).collect()
    }

    pub fn assets_by_class(&self, class_name: &str) -> Vec<&AssetRecord> {
        self.resolve(self.class_bucket(class_name)).collect()
    }

    pub fn assets_by_tag(&self, tag: &str) -> Vec<&AssetRecord> {
        self.resolve(self.tag_bucket(tag)).collect()
    }

    pub fn has_package(&self, package_name: &str) -> bool {
        self.by_package_name.contains_key(package_name)
    }

    pub fn package_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.by_package_name.keys().map(String::as_str)
    }

    // ---- Queries -------------------------------------------------------------

    /// Evaluates an expanded filter against the disk-backed maps. Records in
    /// `packages_to_skip` are dropped from the result.
    pub fn get_assets(
        &self,
        filter: &AssetFilter,
        packages_to_skip: &HashSet<String>,
    ) -> Result<Vec<&AssetRecord>, FilterError> {
        filter.validate_constrained(false)?;

        let mut sets: Vec<Vec<AssetId>> = Vec::new();
        let collect = |buckets: &Buckets, keys: &BTreeSet<String>| -> Vec<AssetId> {
            keys.iter()
                .filter_map(|key| buckets.get(key))
                .flatten()
                .copied()
                .collect()
        };

        if !filter.package_names.is_empty() {
            sets.push(collect(&self.by_package_name, &filter.package_names));
        }
        if !filter.package_paths.is_empty() {
            sets.push(collect(&self.by_path, &filter.package_paths));
        }
        if !filter.class_names.is_empty() {
            sets.push(collect(&self.by_class, &filter.class_names));
        }
        if !filter.object_paths.is_empty() {
            sets.push(
                filter
                    .object_paths
                    .iter()
                    .filter_map(|path| self.asset_id(path))
                    .collect(),
            );
        }

        let tags_only = sets.is_empty();
        if tags_only {
            let mut seen: HashSet<AssetId> = HashSet::new();
            let mut matched = Vec::new();
            for (key, value) in filter.tags_and_values.iter() {
                for id in self.tag_bucket(key) {
                    let hit = self
                        .asset(*id)
                        .is_some_and(|record| record.tag(key) == Some(value.as_str()));
                    if hit && seen.insert(*id) {
                        matched.push(*id);
                    }
                }
            }
            sets.push(matched);
        }

        let mut combined = if sets.len() > 1 {
            let by_path = |a: &AssetId, b: &AssetId| {
                let a = self.asset(*a).map(|r| r.object_path.as_str());
                let b = self.asset(*b).map(|r| r.object_path.as_str());
                a.cmp(&b)
            };
            for set in sets.iter_mut() {
                set.sort_by(by_path);
                set.dedup();
            }
            let mut iter = sets.into_iter();
            let first = iter.next().unwrap_or_default();
            iter.fold(first, |acc, next| merge_intersect(&acc, &next, by_path))
        } else {
            sets.pop().unwrap_or_default()
        };

        if !tags_only && !filter.tags_and_values.is_empty() {
            combined.retain(|id| self.asset(*id).is_some_and(|record| filter.matches_tags(record)));
        }

        Ok(combined
            .into_iter()
            .filter_map(|id| self.asset(id))
            .filter(|record| !packages_to_skip.contains(&record.package_name))
            .collect())
    }

    pub fn get_all_assets(&self, packages_to_skip: &HashSet<String>) -> Vec<&AssetRecord> {
        self.iter_assets()
            .map(|(_, record)| record)
            .filter(|record| !packages_to_skip.contains(&record.package_name))
            .collect()
    }

    // ---- Dependency graph ----------------------------------------------------

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut DependencyGraph {
        &mut self.graph
    }

    pub fn find_node(&self, identifier: &AssetIdentifier) -> Option<NodeId> {
        self.graph.find(identifier)
    }

    pub fn create_or_find_node(&mut self, identifier: &AssetIdentifier) -> NodeId {
        self.graph.create_or_find(identifier)
    }

    pub fn remove_node(&mut self, identifier: &AssetIdentifier) -> bool {
        self.graph.remove(identifier)
    }

    /// One hop of outgoing edges. `None` when the identifier has no node.
    pub fn get_dependencies(
        &self,
        identifier: &AssetIdentifier,
        mask: DependencyCategory,
    ) -> Option<Vec<AssetIdentifier>> {
        let node = self.graph.find(identifier)?;
        Some(self.identifiers(&self.graph.dependencies(node, mask)))
    }

    /// One hop of incoming edges, re-checked against `mask`.
    pub fn get_referencers(
        &self,
        identifier: &AssetIdentifier,
        mask: DependencyCategory,
    ) -> Option<Vec<AssetIdentifier>> {
        let node = self.graph.find(identifier)?;
        Some(self.identifiers(&self.graph.referencers(node, mask)))
    }

    fn identifiers(&self, nodes: &[NodeId]) -> Vec<AssetIdentifier> {
        nodes
            .iter()
            .filter_map(|node| self.graph.identifier(*node))
            .cloned()
            .collect()
    }

    /// Follows redirector packages starting at `start`.
    ///
    /// A redirector package forwards through its dependencies: a dependency in
    /// `allowed_packages` is the answer, a dependency on another package known
    /// to the index is the next hop. A package holding a non-redirector record,
    /// or no record at all, resolves to itself. Returns `None` when the chain
    /// revisits a package before reaching an answer. Results are memoized in
    /// `cache` for the duration of one pass.
    pub fn resolve_redirector(
        &self,
        start: NodeId,
        allowed_packages: &HashSet<String>,
        cache: &mut HashMap<NodeId, Option<NodeId>>,
    ) -> Option<NodeId> {
        if let Some(cached) = cache.get(&start) {
            return *cached;
        }

        let mut current = start;
        let mut encountered: HashSet<Option<String>> = HashSet::new();
        let mut result = None;

        while result.is_none() {
            let Some(node) = self.graph.node(current) else {
                break;
            };
            let package = node.identifier().package_name().map(str::to_string);
            if !encountered.insert(package.clone()) {
                break;
            }

            let bucket = package
                .as_deref()
                .map(|name| self.package_bucket(name))
                .unwrap_or(&[]);
            if bucket.is_empty() {
                result = Some(current);
                break;
            }

            let mut next_hop = None;
            for record in self.resolve(bucket) {
                if record.is_redirector() {
                    let mut chained = None;
                    for (dependency, _) in node.dependencies(DependencyCategory::ALL) {
                        let dep_package = self
                            .graph
                            .identifier(dependency)
                            .and_then(AssetIdentifier::package_name);
                        let Some(dep_package) = dep_package else {
                            continue;
                        };
                        if allowed_packages.contains(dep_package) {
                            result = Some(dependency);
                        } else if self.has_package(dep_package) {
                            chained = Some(dependency);
                        }
                    }
                    if chained.is_some() && result.is_none() {
                        next_hop = chained;
                        break;
                    }
                } else {
                    result = Some(current);
                }
                if result.is_some() {
                    break;
                }
            }

            match next_hop {
                Some(next) => current = next,
                None if result.is_none() => {
                    // every record is a redirector with no usable target
                    break;
                }
                None => {}
            }
        }

        cache.insert(start, result);
        result
    }

    // ---- Package data --------------------------------------------------------

    pub fn package_data(&self, package_name: &str) -> Option<&PackageData> {
        self.package_data.get(package_name)
    }

    pub fn create_or_get_package_data(&mut self, package_name: &str) -> &mut PackageData {
        self.package_data
            .entry(package_name.to_string())
            .or_default()
    }

    pub fn remove_package_data(&mut self, package_name: &str) -> bool {
        self.package_data.remove(package_name).is_some()
    }

    pub fn iter_package_data(&self) -> impl Iterator<Item = (&str, &PackageData)> + '_ {
        self.package_data
            .iter()
            .map(|(name, data)| (name.as_str(), data))
    }

    // ---- Whole-state operations ---------------------------------------------

    /// Drops records whose package is outside `required` (when non-empty) or
    /// inside `removed`, then removes orphaned non-package nodes. Cycles among
    /// orphans are kept.
    pub fn prune_assets(&mut self, required: &HashSet<String>, removed: &HashSet<String>) {
        let doomed: Vec<AssetId> = self
            .iter_assets()
            .filter(|(_, record)| {
                (!required.is_empty() && !required.contains(&record.package_name))
                    || removed.contains(&record.package_name)
            })
            .map(|(id, _)| id)
            .collect();
        for id in doomed {
            if let Err(err) = self.remove_asset(id) {
                tracing::warn!("prune could not remove asset {id:?}: {err}");
            }
        }

        let orphans: Vec<AssetIdentifier> = self
            .graph
            .iter()
            .filter(|(_, node)| node.connection_count() == 0 && !node.identifier().is_package())
            .map(|(_, node)| node.identifier().clone())
            .collect();
        for identifier in orphans {
            self.graph.remove(&identifier);
        }
    }

    /// Builds a fresh state from `source`, applying the tag filter of
    /// `options`. Edges are kept only when both ends exist in `source`, and
    /// package data only for packages that still have records.
    pub fn initialize_from_existing(
        source: &RegistryState,
        override_records: Option<&[AssetRecord]>,
        options: &SerializationOptions,
    ) -> Self {
        let mut state = RegistryState::new();
        let records: Vec<&AssetRecord> = match override_records {
            Some(records) => records.iter().collect(),
            None => source.iter_assets().map(|(_, record)| record).collect(),
        };
        state.reserve(records.len());
        for record in records {
            if let Err(err) = state.add_asset(options.filtered_record(record)) {
                tracing::warn!("skipping record while copying state: {err}");
            }
        }

        for (_, node) in source.graph.iter() {
            let from = state.graph.create_or_find(node.identifier());
            for (target, category) in node.dependencies(DependencyCategory::ALL) {
                if let Some(target_id) = source.graph.identifier(target) {
                    let to = state.graph.create_or_find(target_id);
                    state.graph.connect(from, to, category);
                }
            }
        }

        for (package, data) in source.iter_package_data() {
            if state.has_package(package) {
                *state.create_or_get_package_data(package) = data.clone();
            }
        }
        state
    }

    /// Reports the first violated bucket or graph invariant.
    pub fn check_consistency(&self) -> Result<(), String> {
        for (id, record) in self.iter_assets() {
            if self.asset_id(&record.object_path) != Some(id) {
                return Err(format!("{} missing from object path map", record.object_path));
            }
            let expected = [
                ("package", self.package_bucket(&record.package_name)),
                ("path", self.path_bucket(&record.package_path)),
                ("class", self.class_bucket(&record.class_name)),
            ];
            for (kind, bucket) in expected {
                if bucket.iter().filter(|b| **b == id).count() != 1 {
                    return Err(format!("{} not exactly once in its {kind} bucket", record.object_path));
                }
            }
            for key in record.tags.keys() {
                if self.tag_bucket(key).iter().filter(|b| **b == id).count() != 1 {
                    return Err(format!("{} not exactly once in tag bucket {key}", record.object_path));
                }
            }
        }

        let maps: [(&str, &Buckets); 4] = [
            ("package", &self.by_package_name),
            ("path", &self.by_path),
            ("class", &self.by_class),
            ("tag", &self.by_tag),
        ];
        for (kind, buckets) in maps {
            for (key, bucket) in buckets {
                for id in bucket {
                    let Some(record) = self.asset(*id) else {
                        return Err(format!("stale handle in {kind} bucket {key}"));
                    };
                    let belongs = match kind {
                        "package" => record.package_name == *key,
                        "path" => record.package_path == *key,
                        "class" => record.class_name == *key,
                        _ => record.tags.contains_key(key),
                    };
                    if !belongs {
                        return Err(format!("{} misfiled in {kind} bucket {key}", record.object_path));
                    }
                }
            }
        }
        if self.by_object_path.len() != self.iter_assets().count() {
            return Err("object path map size differs from record count".to_string());
        }

        for (id, node) in self.graph.iter() {
            for (target, _) in node.dependencies(DependencyCategory::ALL) {
                let mirrored = self
                    .graph
                    .node(target)
                    .is_some_and(|t| t.referencers().contains(&id));
                if !mirrored {
                    return Err(format!("edge from {} has no referencer back-link", node.identifier()));
                }
            }
            for referencer in node.referencers() {
                if !self
                    .graph
                    .node(*referencer)
                    .is_some_and(|r| r.dependencies(DependencyCategory::ALL).any(|(t, _)| t == id))
                {
                    return Err(format!("dangling referencer on {}", node.identifier()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(records: &[&AssetRecord]) -> Vec<String> {
        let mut out: Vec<String> = records.iter().map(|r| r.object_path.clone()).collect();
        out.sort();
        out
    }

    fn scenario_state() -> anyhow::Result<RegistryState> {
        let mut state = RegistryState::new();
        state.add_asset(AssetRecord::new("/Game/A", "A", "Foo").with_tag("Color", "Red"))?;
        state.add_asset(AssetRecord::new("/Game/B", "B", "Foo").with_tag("Color", "Blue"))?;
        Ok(state)
    }

    #[test]
    fn class_and_tag_filters_intersect() -> anyhow::Result<()> {
        let state = scenario_state()?;
        let skip = HashSet::new();

        let by_class = state.get_assets(&AssetFilter::new().class_name("Foo"), &skip)?;
        assert_eq!(paths(&by_class), vec!["/Game/A.A", "/Game/B.B"]);

        let filter = AssetFilter::new().class_name("Foo").tag("Color", "Red");
        let red = state.get_assets(&filter, &skip)?;
        assert_eq!(paths(&red), vec!["/Game/A.A"]);

        let tag_only = state.get_assets(&AssetFilter::new().tag("Color", "Blue"), &skip)?;
        assert_eq!(paths(&tag_only), vec!["/Game/B.B"]);
        Ok(())
    }

    #[test]
    fn get_assets_rejects_bad_filters_and_honours_skip_set() -> anyhow::Result<()> {
        let state = scenario_state()?;
        let skip = HashSet::from(["/Game/A".to_string()]);
        assert_eq!(
            state.get_assets(&AssetFilter::new(), &skip).err(),
            Some(FilterError::NoConstraints)
        );
        let recursive = AssetFilter::new().package_path("/Game").recursive_paths(true);
        assert_eq!(
            state.get_assets(&recursive, &skip).err(),
            Some(FilterError::RecursionNotExpanded)
        );
        let result = state.get_assets(&AssetFilter::new().package_path("/Game"), &skip)?;
        assert_eq!(paths(&result), vec!["/Game/B.B"]);
        Ok(())
    }

    #[test]
    fn duplicate_add_is_rejected_without_side_effects() -> anyhow::Result<()> {
        let mut state = scenario_state()?;
        let err = state.add_asset(AssetRecord::new("/Game/A", "A", "Bar"));
        assert_eq!(err, Err(IndexError::DuplicateObjectPath("/Game/A.A".to_string())));
        assert!(state.class_bucket("Bar").is_empty());
        state.check_consistency().map_err(anyhow::Error::msg)?;
        Ok(())
    }

    #[test]
    fn update_migrates_class_bucket_and_keeps_handle() -> anyhow::Result<()> {
        let mut state = scenario_state()?;
        let id = state.asset_id("/Game/A.A").ok_or_else(|| anyhow::anyhow!("missing"))?;
        let mut changed = state.asset(id).cloned().ok_or_else(|| anyhow::anyhow!("missing"))?;
        changed.class_name = "Bar".to_string();
        state.update_asset(id, changed)?;

        assert!(!state.class_bucket("Foo").contains(&id));
        assert!(state.class_bucket("Bar").contains(&id));
        assert_eq!(state.asset_id("/Game/A.A"), Some(id));
        state.check_consistency().map_err(anyhow::Error::msg)?;
        Ok(())
    }

    #[test]
    fn update_with_identical_record_changes_nothing() -> anyhow::Result<()> {
        let mut state = scenario_state()?;
        let id = state.asset_id("/Game/B.B").ok_or_else(|| anyhow::anyhow!("missing"))?;
        let before = state.tag_bucket("Color").to_vec();
        let same = state.asset(id).cloned().ok_or_else(|| anyhow::anyhow!("missing"))?;
        state.update_asset(id, same)?;
        assert_eq!(state.tag_bucket("Color"), before.as_slice());
        Ok(())
    }

    #[test]
    fn tag_changes_are_migrated_by_difference() -> anyhow::Result<()> {
        let mut state = scenario_state()?;
        let id = state.asset_id("/Game/A.A").ok_or_else(|| anyhow::anyhow!("missing"))?;
        let mut changed = state.asset(id).cloned().ok_or_else(|| anyhow::anyhow!("missing"))?;
        changed.tags.remove("Color");
        changed.tags.insert("Size".to_string(), "Large".to_string());
        state.update_asset(id, changed)?;

        assert_eq!(state.tag_bucket("Color").len(), 1);
        assert_eq!(state.tag_bucket("Size"), &[id]);
        state.check_consistency().map_err(anyhow::Error::msg)?;
        Ok(())
    }

    #[test]
    fn removing_last_record_drops_node_and_referencer_link() -> anyhow::Result<()> {
        let mut state = scenario_state()?;
        let a = state.create_or_find_node(&"/Game/A".into());
        let b = state.create_or_find_node(&"/Game/B".into());
        state.graph_mut().connect(a, b, DependencyCategory::HARD);
        state.create_or_get_package_data("/Game/A").disk_size = 42;

        assert_eq!(
            state.get_dependencies(&"/Game/A".into(), DependencyCategory::HARD),
            Some(vec![AssetIdentifier::package("/Game/B")])
        );
        assert_eq!(
            state.get_referencers(&"/Game/B".into(), DependencyCategory::HARD),
            Some(vec![AssetIdentifier::package("/Game/A")])
        );

        state.remove_asset_by_object_path("/Game/A.A")?;
        assert!(state.find_node(&"/Game/A".into()).is_none());
        assert_eq!(
            state.get_referencers(&"/Game/B".into(), DependencyCategory::ALL),
            Some(Vec::new())
        );
        assert!(state.package_data("/Game/A").is_none());
        Ok(())
    }

    #[test]
    fn redirector_chain_resolves_to_terminal_package() -> anyhow::Result<()> {
        let mut state = RegistryState::new();
        state.add_asset(AssetRecord::new("/Game/R1", "R1", "ObjectRedirector"))?;
        state.add_asset(AssetRecord::new("/Game/R2", "R2", "ObjectRedirector"))?;
        state.add_asset(AssetRecord::new("/Game/T", "T", "Texture"))?;
        let r1 = state.create_or_find_node(&"/Game/R1".into());
        let r2 = state.create_or_find_node(&"/Game/R2".into());
        let t = state.create_or_find_node(&"/Game/T".into());
        state.graph_mut().connect(r1, r2, DependencyCategory::HARD);
        state.graph_mut().connect(r2, t, DependencyCategory::HARD);

        let allowed = HashSet::from(["/Game/T".to_string()]);
        let mut cache = HashMap::new();
        assert_eq!(state.resolve_redirector(r1, &allowed, &mut cache), Some(t));
        assert_eq!(state.resolve_redirector(t, &allowed, &mut cache), Some(t));
        Ok(())
    }

    #[test]
    fn redirector_cycle_terminates_without_target() -> anyhow::Result<()> {
        let mut state = RegistryState::new();
        state.add_asset(AssetRecord::new("/Game/R1", "R1", "ObjectRedirector"))?;
        state.add_asset(AssetRecord::new("/Game/R2", "R2", "ObjectRedirector"))?;
        let r1 = state.create_or_find_node(&"/Game/R1".into());
        let r2 = state.create_or_find_node(&"/Game/R2".into());
        state.graph_mut().connect(r1, r2, DependencyCategory::SOFT);
        state.graph_mut().connect(r2, r1, DependencyCategory::SOFT);

        let mut cache = HashMap::new();
        assert_eq!(state.resolve_redirector(r1, &HashSet::new(), &mut cache), None);
        assert_eq!(cache.get(&r1), Some(&None));
        Ok(())
    }

    #[test]
    fn prune_keeps_required_packages_and_drops_orphan_values() -> anyhow::Result<()> {
        let mut state = scenario_state()?;
        state.create_or_find_node(&AssetIdentifier::value("/Game/B", None, "Orphan"));
        let required = HashSet::from(["/Game/A".to_string()]);
        state.prune_assets(&required, &HashSet::new());

        assert!(state.asset_by_object_path("/Game/A.A").is_some());
        assert!(state.asset_by_object_path("/Game/B.B").is_none());
        assert!(
            state
                .find_node(&AssetIdentifier::value("/Game/B", None, "Orphan"))
                .is_none()
        );
        Ok(())
    }

    #[test]
    fn initialize_from_existing_keeps_the_first_of_duplicate_overrides() -> anyhow::Result<()> {
        let source = scenario_state()?;
        let overrides = vec![
            AssetRecord::new("/Game/A", "A", "Foo"),
            AssetRecord::new("/Game/A", "A", "Bar"),
        ];
        let copy = RegistryState::initialize_from_existing(
            &source,
            Some(&overrides),
            &SerializationOptions::for_development(),
        );

        assert_eq!(copy.num_assets(), 1);
        let kept = copy
            .asset_by_object_path("/Game/A.A")
            .ok_or_else(|| anyhow::anyhow!("missing"))?;
        assert_eq!(kept.class_name, "Foo");
        assert!(copy.class_bucket("Bar").is_empty());
        copy.check_consistency().map_err(anyhow::Error::msg)?;
        Ok(())
    }
}
