//! Versioned binary catalog format.
//!
//! Layout (little endian):
//!
//! ```text
//! header   guid (4 x u32) | version i32          absent in PreVersioning
//! names    i64 offset of the name table           AddAssetRegistryState and later
//! assets   i32 count | records
//! nodes    i32 count | per node: identifier, five i32 counts
//!          (hard, soft, searchable, manage, referencers), then the indices
//! package  i32 count | (name, package data)       AddAssetRegistryState and later
//! table    i32 count | strings                    at the offset written above
//! ```
//!
//! The two legacy layouts keep strings inline and key their node table on the
//! asset table. Every version has its own decode function; the version read
//! from the header selects which one runs.

use anyhow::{Context, Result};
use memmap2::Mmap;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::asset::{AssetRecord, PackageData, PackageFlags};
use crate::config::SerializationOptions;
use crate::dependency::{DependencyCategory, NodeId};
use crate::error::FormatError;
use crate::identifier::AssetIdentifier;
use crate::state::RegistryState;

pub const REGISTRY_GUID: [u32; 4] = [0x717F_9EE7, 0xE9B0_493A, 0x88B3_9132, 0x1B38_8107];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FormatVersion {
    /// No header, inline strings, explicit node table keyed on asset indices.
    PreVersioning = 0,
    /// Header added, soft dependencies added, one node per asset.
    HardSoftDependencies = 1,
    /// Name table, identifiers, four edge categories and package data.
    AddAssetRegistryState = 2,
    /// Package data grows a content hash and a cooked version stamp.
    AddPackageHashes = 3,
}

impl FormatVersion {
    pub const LATEST: FormatVersion = FormatVersion::AddPackageHashes;

    pub fn from_i32(value: i32) -> Result<Self, FormatError> {
        match value {
            0 => Ok(Self::PreVersioning),
            1 => Ok(Self::HardSoftDependencies),
            2 => Ok(Self::AddAssetRegistryState),
            3 => Ok(Self::AddPackageHashes),
            other => Err(FormatError::UnknownVersion(other)),
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    fn is_legacy(self) -> bool {
        self < Self::AddAssetRegistryState
    }
}

// ---- Byte level -------------------------------------------------------------

#[derive(Default)]
struct NameTable {
    index: HashMap<String, u32>,
    names: Vec<String>,
}

impl NameTable {
    fn intern(&mut self, name: &str) -> u32 {
        if let Some(idx) = self.index.get(name) {
            return *idx;
        }
        let idx = self.names.len() as u32;
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), idx);
        idx
    }
}

struct Writer {
    buf: Vec<u8>,
    names: Option<NameTable>,
}

impl Writer {
    fn new(with_name_table: bool) -> Self {
        Self {
            buf: Vec::new(),
            names: with_name_table.then(NameTable::default),
        }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn count(&mut self, n: usize) {
        self.i32(i32::try_from(n).unwrap_or(i32::MAX));
    }

    fn string(&mut self, s: &str) {
        self.count(s.len());
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn name(&mut self, s: &str) {
        match self.names.as_mut() {
            Some(table) => {
                let idx = table.intern(s);
                self.u32(idx);
            }
            None => self.string(s),
        }
    }

    fn header(&mut self, version: FormatVersion) {
        for part in REGISTRY_GUID {
            self.u32(part);
        }
        self.i32(version.as_i32());
    }

    /// Reserves the name table offset; returns where it must be patched.
    fn name_table_placeholder(&mut self) -> usize {
        let at = self.buf.len();
        self.i64(0);
        at
    }

    fn finish_name_table(&mut self, placeholder: usize) {
        let Some(table) = self.names.take() else {
            return;
        };
        let offset = self.buf.len() as i64;
        self.buf[placeholder..placeholder + 8].copy_from_slice(&offset.to_le_bytes());
        self.count(table.names.len());
        for name in table.names.iter() {
            self.string(name);
        }
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    names: Option<Vec<String>>,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], pos: usize) -> Self {
        Self {
            data,
            pos,
            names: None,
        }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FormatError> {
        if self.remaining() < n {
            return Err(FormatError::UnexpectedEof { offset: self.pos });
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], FormatError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.array::<1>()?[0])
    }

    fn u32(&mut self) -> Result<u32, FormatError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, FormatError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, FormatError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn count(&mut self) -> Result<usize, FormatError> {
        let offset = self.pos;
        let count = self.i32()?;
        usize::try_from(count).map_err(|_| FormatError::NegativeCount { count, offset })
    }

    fn index(&mut self, len: usize) -> Result<usize, FormatError> {
        let index = self.i32()?;
        usize::try_from(index)
            .ok()
            .filter(|idx| *idx < len)
            .ok_or(FormatError::IndexOutOfRange { index, len })
    }

    fn string(&mut self) -> Result<String, FormatError> {
        let len = self.count()?;
        let offset = self.pos;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| FormatError::InvalidUtf8 { offset })
    }

    fn name(&mut self) -> Result<String, FormatError> {
        if self.names.is_none() {
            return self.string();
        }
        let index = self.u32()?;
        let names = self.names.as_deref().unwrap_or_default();
        names
            .get(index as usize)
            .cloned()
            .ok_or(FormatError::BadNameIndex {
                index,
                len: names.len(),
            })
    }

    /// Reads the name table at the offset stored at the cursor, then resumes
    /// right after the offset.
    fn load_name_table(&mut self) -> Result<(), FormatError> {
        let offset_pos = self.pos;
        let offset = self.i64()?;
        let resume = self.pos;
        let table_pos = usize::try_from(offset)
            .ok()
            .filter(|pos| *pos >= resume && *pos <= self.data.len())
            .ok_or(FormatError::UnexpectedEof { offset: offset_pos })?;

        self.pos = table_pos;
        let count = self.count()?;
        let mut names = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            names.push(self.string()?);
        }
        self.names = Some(names);
        self.pos = resume;
        Ok(())
    }
}

// ---- Records, identifiers and package data ---------------------------------

fn write_record(w: &mut Writer, record: &AssetRecord) {
    w.name(&record.package_name);
    w.name(&record.group_names);
    w.name(&record.asset_name);
    w.name(&record.class_name);
    w.count(record.tags.len());
    for (key, value) in record.tags.iter() {
        w.name(key);
        w.string(value);
    }
    w.count(record.chunk_ids.len());
    for chunk in record.chunk_ids.iter() {
        w.i32(*chunk);
    }
    w.u32(record.package_flags.bits());
}

fn read_record(r: &mut Reader<'_>) -> Result<AssetRecord, FormatError> {
    let package_name = r.name()?;
    let group_names = r.name()?;
    let asset_name = r.name()?;
    let class_name = r.name()?;
    let mut record = AssetRecord::with_groups(&package_name, &group_names, &asset_name, &class_name);
    for _ in 0..r.count()? {
        let key = r.name()?;
        let value = r.string()?;
        record.tags.insert(key, value);
    }
    for _ in 0..r.count()? {
        record.chunk_ids.insert(r.i32()?);
    }
    record.package_flags = PackageFlags::from_bits_retain(r.u32()?);
    Ok(record)
}

const ID_TYPE: u8 = 0x01;
const ID_PACKAGE: u8 = 0x02;
const ID_OBJECT: u8 = 0x04;
const ID_VALUE: u8 = 0x08;

fn write_identifier(w: &mut Writer, identifier: &AssetIdentifier) {
    let fields = [
        (ID_TYPE, identifier.primary_asset_type.as_deref()),
        (ID_PACKAGE, identifier.package_name.as_deref()),
        (ID_OBJECT, identifier.object_name.as_deref()),
        (ID_VALUE, identifier.value_name.as_deref()),
    ];
    let mask = fields
        .iter()
        .filter(|(_, value)| value.is_some())
        .fold(0u8, |mask, (bit, _)| mask | bit);
    w.u8(mask);
    for value in fields.iter().filter_map(|(_, value)| *value) {
        w.name(value);
    }
}

fn read_identifier(r: &mut Reader<'_>) -> Result<AssetIdentifier, FormatError> {
    let mask = r.u8()?;
    let mut field = |bit: u8| -> Result<Option<String>, FormatError> {
        if mask & bit != 0 { r.name().map(Some) } else { Ok(None) }
    };
    Ok(AssetIdentifier {
        primary_asset_type: field(ID_TYPE)?,
        package_name: field(ID_PACKAGE)?,
        object_name: field(ID_OBJECT)?,
        value_name: field(ID_VALUE)?,
    })
}

fn write_package_data(w: &mut Writer, data: &PackageData, version: FormatVersion) {
    w.i64(data.disk_size);
    w.buf.extend_from_slice(&data.package_guid);
    if version >= FormatVersion::AddPackageHashes {
        w.string(&data.content_hash);
        w.u32(data.cooked_version);
    }
}

fn read_package_data(r: &mut Reader<'_>, version: FormatVersion) -> Result<PackageData, FormatError> {
    let mut data = PackageData {
        disk_size: r.i64()?,
        package_guid: r.array()?,
        ..PackageData::default()
    };
    if version >= FormatVersion::AddPackageHashes {
        data.content_hash = r.string()?;
        data.cooked_version = r.u32()?;
    }
    Ok(data)
}

// ---- Write side --------------------------------------------------------------

fn sorted_records(state: &RegistryState) -> Vec<&AssetRecord> {
    let mut records: Vec<&AssetRecord> = state.iter_assets().map(|(_, r)| r).collect();
    records.sort_by(|a, b| a.object_path.cmp(&b.object_path));
    records
}

/// Packages a redirector may resolve to: those holding a real asset.
fn redirect_targets(state: &RegistryState) -> HashSet<String> {
    state
        .iter_assets()
        .filter(|(_, record)| !record.is_redirector())
        .map(|(_, record)| record.package_name.clone())
        .collect()
}

struct PlannedNode {
    identifier: AssetIdentifier,
    /// Indices per category in `DependencyCategory::ORDERED` order.
    dependencies: [Vec<i32>; 4],
    referencers: Vec<i32>,
}

/// Maps each written node's dependencies onto table indices, substituting
/// redirector targets, and derives referencers from what will be written.
fn plan_edges(
    state: &RegistryState,
    nodes: &[(NodeId, AssetIdentifier)],
    index_of: &HashMap<NodeId, i32>,
    categories: DependencyCategory,
) -> Vec<PlannedNode> {
    let allowed = redirect_targets(state);
    let mut cache: HashMap<NodeId, Option<NodeId>> = HashMap::new();
    let graph = state.graph();

    let mut planned: Vec<PlannedNode> = nodes
        .iter()
        .map(|(node_id, identifier)| {
            let mut dependencies: [Vec<i32>; 4] = Default::default();
            if let Some(node) = graph.node(*node_id) {
                for (slot, category) in DependencyCategory::ORDERED.into_iter().enumerate() {
                    if !categories.contains(category) {
                        continue;
                    }
                    for target in node.dependencies_of(category) {
                        let resolved = state.resolve_redirector(*target, &allowed, &mut cache);
                        if let Some(resolved) = resolved
                            && let Some(idx) = index_of.get(&resolved)
                            && !dependencies[slot].contains(idx)
                        {
                            dependencies[slot].push(*idx);
                        }
                    }
                }
            }
            for slot in dependencies.iter_mut() {
                slot.sort_unstable();
            }
            PlannedNode {
                identifier: identifier.clone(),
                dependencies,
                referencers: Vec::new(),
            }
        })
        .collect();

    let index_at: Vec<i32> = nodes
        .iter()
        .map(|(node_id, _)| index_of.get(node_id).copied().unwrap_or(-1))
        .collect();
    let position_of: HashMap<i32, usize> = index_at
        .iter()
        .enumerate()
        .map(|(position, idx)| (*idx, position))
        .collect();
    let edges: Vec<(i32, i32)> = planned
        .iter()
        .enumerate()
        .flat_map(|(from, node)| {
            let from = index_at[from];
            node.dependencies.iter().flatten().map(move |to| (from, *to))
        })
        .collect();
    for (from, to) in edges {
        if let Some(position) = position_of.get(&to)
            && let Some(target) = planned.get_mut(*position)
            && !target.referencers.contains(&from)
        {
            target.referencers.push(from);
        }
    }
    for node in planned.iter_mut() {
        node.referencers.sort_unstable();
    }
    planned
}

fn write_planned_node(w: &mut Writer, node: &PlannedNode, with_identifier: bool, slots: &[usize]) {
    if with_identifier {
        write_identifier(w, &node.identifier);
    }
    for slot in slots {
        w.count(node.dependencies[*slot].len());
    }
    w.count(node.referencers.len());
    for slot in slots {
        for idx in node.dependencies[*slot].iter() {
            w.i32(*idx);
        }
    }
    for idx in node.referencers.iter() {
        w.i32(*idx);
    }
}

fn written_categories(options: &SerializationOptions) -> DependencyCategory {
    let mut categories = DependencyCategory::PACKAGES;
    categories.set(
        DependencyCategory::SEARCHABLE_NAME,
        options.serialize_searchable_name_dependencies,
    );
    categories.set(DependencyCategory::MANAGE, options.serialize_manage_dependencies);
    categories
}

fn encode_current(state: &RegistryState, options: &SerializationOptions, version: FormatVersion) -> Vec<u8> {
    let mut w = Writer::new(true);
    w.header(version);
    let placeholder = w.name_table_placeholder();

    let records = sorted_records(state);
    w.count(records.len());
    for record in records.iter() {
        write_record(&mut w, &options.filtered_record(record));
    }

    let mut nodes: Vec<(NodeId, AssetIdentifier)> = Vec::new();
    if options.serialize_dependencies {
        nodes = state
            .graph()
            .iter()
            .filter(|(_, node)| {
                let id = node.identifier();
                id.is_package()
                    || (options.serialize_searchable_name_dependencies && id.is_value())
                    || (options.serialize_manage_dependencies && id.is_primary_asset())
            })
            .map(|(node_id, node)| (node_id, node.identifier().clone()))
            .collect();
        nodes.sort_by(|a, b| a.1.cmp(&b.1));
    }
    let index_of: HashMap<NodeId, i32> = nodes
        .iter()
        .enumerate()
        .map(|(idx, (node_id, _))| (*node_id, idx as i32))
        .collect();
    let planned = plan_edges(state, &nodes, &index_of, written_categories(options));

    w.count(planned.len());
    for node in planned.iter() {
        write_planned_node(&mut w, node, true, &[0, 1, 2, 3]);
    }

    if options.serialize_package_data {
        let mut packages: Vec<(&str, &PackageData)> = state.iter_package_data().collect();
        packages.sort_by(|a, b| a.0.cmp(b.0));
        w.count(packages.len());
        for (name, data) in packages {
            w.name(name);
            write_package_data(&mut w, data, version);
        }
    } else {
        w.count(0);
    }

    w.finish_name_table(placeholder);
    w.buf
}

fn encode_legacy(state: &RegistryState, options: &SerializationOptions, version: FormatVersion) -> Vec<u8> {
    let mut w = Writer::new(false);
    if version == FormatVersion::HardSoftDependencies {
        w.header(version);
    }

    let records = sorted_records(state);
    w.count(records.len());
    for record in records.iter() {
        write_record(&mut w, &options.filtered_record(record));
    }

    // (asset index, package) per node table slot
    let mut table: Vec<(usize, &str)> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for (idx, record) in records.iter().enumerate() {
        let first = seen.insert(record.package_name.as_str());
        if first || version == FormatVersion::HardSoftDependencies {
            table.push((idx, record.package_name.as_str()));
        }
    }

    let mut canonical: HashMap<NodeId, i32> = HashMap::new();
    let mut nodes: Vec<(NodeId, AssetIdentifier)> = Vec::new();
    for (slot, (_, package)) in table.iter().enumerate() {
        let identifier = AssetIdentifier::package(*package);
        if let Some(node_id) = state.find_node(&identifier)
            && !canonical.contains_key(&node_id)
        {
            canonical.insert(node_id, slot as i32);
            nodes.push((node_id, identifier));
        }
    }

    let categories = if !options.serialize_dependencies {
        DependencyCategory::empty()
    } else if version == FormatVersion::PreVersioning {
        DependencyCategory::HARD
    } else {
        DependencyCategory::PACKAGES
    };
    let planned = plan_edges(state, &nodes, &canonical, categories);
    let mut by_slot: HashMap<i32, &PlannedNode> = HashMap::new();
    for (node, (node_id, _)) in planned.iter().zip(nodes.iter()) {
        if let Some(slot) = canonical.get(node_id) {
            by_slot.insert(*slot, node);
        }
    }

    if version == FormatVersion::PreVersioning {
        w.count(table.len());
        for (asset_index, _) in table.iter() {
            w.count(*asset_index);
        }
    }

    let slots: &[usize] = if version == FormatVersion::PreVersioning { &[0] } else { &[0, 1] };
    let empty = PlannedNode {
        identifier: AssetIdentifier::default(),
        dependencies: Default::default(),
        referencers: Vec::new(),
    };
    for slot in 0..table.len() as i32 {
        let node = by_slot.get(&slot).copied().unwrap_or(&empty);
        write_planned_node(&mut w, node, false, slots);
    }
    w.buf
}

/// Encodes `state` in the latest format.
pub fn serialize(state: &RegistryState, options: &SerializationOptions) -> Vec<u8> {
    serialize_version(state, options, FormatVersion::LATEST)
}

pub fn serialize_version(
    state: &RegistryState,
    options: &SerializationOptions,
    version: FormatVersion,
) -> Vec<u8> {
    if version.is_legacy() {
        encode_legacy(state, options, version)
    } else {
        encode_current(state, options, version)
    }
}

// ---- Read side ---------------------------------------------------------------

/// Reads the header. Streams without the magic guid are legacy
/// `PreVersioning` data and are read from the start.
pub fn read_version(data: &[u8]) -> Result<(FormatVersion, usize), FormatError> {
    let mut r = Reader::new(data, 0);
    if data.len() >= 16 {
        let mut guid = [0u32; 4];
        for part in guid.iter_mut() {
            *part = r.u32()?;
        }
        if guid == REGISTRY_GUID {
            let version = FormatVersion::from_i32(r.i32()?)?;
            return Ok((version, r.pos));
        }
    }
    Ok((FormatVersion::PreVersioning, 0))
}

/// Decodes a catalog into a fresh state. Nothing is returned unless the whole
/// stream parsed.
pub fn deserialize(data: &[u8], options: &SerializationOptions) -> Result<RegistryState, FormatError> {
    let (version, start) = read_version(data)?;
    if start == 0 {
        tracing::warn!("catalog has no header, reading legacy pre-versioning layout");
    }
    let mut r = Reader::new(data, start);
    match version {
        FormatVersion::PreVersioning => decode_pre_versioning(&mut r, options),
        FormatVersion::HardSoftDependencies => decode_hard_soft(&mut r, options),
        FormatVersion::AddAssetRegistryState => decode_current(&mut r, options, version),
        FormatVersion::AddPackageHashes => decode_current(&mut r, options, version),
    }
}

fn read_assets(r: &mut Reader<'_>, state: &mut RegistryState) -> Result<Vec<String>, FormatError> {
    let count = r.count()?;
    state.reserve(count.min(r.remaining()));
    let mut packages = Vec::with_capacity(count.min(r.remaining()));
    for _ in 0..count {
        let record = read_record(r)?;
        let object_path = record.object_path.clone();
        packages.push(record.package_name.clone());
        state
            .add_asset(record)
            .map_err(|_| FormatError::DuplicateAsset(object_path))?;
    }
    Ok(packages)
}

/// Edges and referencer lists as they appear in a stream, by table index.
#[derive(Default)]
struct StreamGraph {
    edges: Vec<(usize, usize, DependencyCategory)>,
    referencers: Vec<(usize, usize)>,
}

impl StreamGraph {
    fn read_node(
        &mut self,
        r: &mut Reader<'_>,
        node: usize,
        len: usize,
        categories: &[DependencyCategory],
    ) -> Result<(), FormatError> {
        let mut counts = Vec::with_capacity(categories.len());
        for _ in categories {
            counts.push(r.count()?);
        }
        let referencer_count = r.count()?;
        for (category, count) in categories.iter().zip(counts) {
            for _ in 0..count {
                let target = r.index(len)?;
                self.edges.push((node, target, *category));
            }
        }
        for _ in 0..referencer_count {
            let referencer = r.index(len)?;
            self.referencers.push((node, referencer));
        }
        Ok(())
    }

    /// Every listed referencer must hold some edge to its node.
    fn validate(&self, name_of: impl Fn(usize) -> String) -> Result<(), FormatError> {
        let pairs: HashSet<(usize, usize)> = self.edges.iter().map(|(from, to, _)| (*from, *to)).collect();
        for (node, referencer) in self.referencers.iter() {
            if !pairs.contains(&(*referencer, *node)) {
                return Err(FormatError::DanglingReferencer {
                    node: name_of(*node),
                    referencer: name_of(*referencer),
                });
            }
        }
        Ok(())
    }

    fn apply(
        &self,
        state: &mut RegistryState,
        identifiers: &[Option<AssetIdentifier>],
        options: &SerializationOptions,
    ) {
        if !options.serialize_dependencies {
            return;
        }
        let loaded = written_categories(options);
        let ids: Vec<Option<NodeId>> = identifiers
            .iter()
            .map(|identifier| identifier.as_ref().map(|id| state.create_or_find_node(id)))
            .collect();
        for (from, to, category) in self.edges.iter() {
            if !loaded.contains(*category) {
                continue;
            }
            if let (Some(Some(from)), Some(Some(to))) = (ids.get(*from), ids.get(*to)) {
                state.graph_mut().connect(*from, *to, *category);
            }
        }
    }
}

fn describe(identifiers: &[Option<AssetIdentifier>], idx: usize) -> String {
    match identifiers.get(idx) {
        Some(Some(identifier)) => identifier.to_string(),
        _ => format!("#{idx}"),
    }
}

fn decode_current(
    r: &mut Reader<'_>,
    options: &SerializationOptions,
    version: FormatVersion,
) -> Result<RegistryState, FormatError> {
    r.load_name_table()?;
    let mut state = RegistryState::new();
    read_assets(r, &mut state)?;

    let node_count = r.count()?;
    let mut identifiers: Vec<Option<AssetIdentifier>> = Vec::with_capacity(node_count.min(r.remaining()));
    let mut stream = StreamGraph::default();
    for node in 0..node_count {
        identifiers.push(Some(read_identifier(r)?));
        stream.read_node(r, node, node_count, &DependencyCategory::ORDERED)?;
    }
    stream.validate(|idx| describe(&identifiers, idx))?;
    stream.apply(&mut state, &identifiers, options);

    for _ in 0..r.count()? {
        let package = r.name()?;
        let data = read_package_data(r, version)?;
        if options.serialize_package_data {
            *state.create_or_get_package_data(&package) = data;
        }
    }
    Ok(state)
}

fn decode_legacy(
    r: &mut Reader<'_>,
    options: &SerializationOptions,
    version: FormatVersion,
) -> Result<RegistryState, FormatError> {
    let mut state = RegistryState::new();
    let packages = read_assets(r, &mut state)?;

    let node_count = if version == FormatVersion::PreVersioning {
        r.count()?
    } else {
        packages.len()
    };

    // nodes past the asset table carry no identifier; their edges are dropped
    let mut identifiers: Vec<Option<AssetIdentifier>> = Vec::with_capacity(node_count.min(r.remaining()));
    for node in 0..node_count {
        if node >= packages.len() {
            identifiers.push(None);
            continue;
        }
        let asset_index = if version == FormatVersion::PreVersioning {
            r.index(packages.len())?
        } else {
            node
        };
        identifiers.push(Some(AssetIdentifier::package(packages[asset_index].as_str())));
    }

    let categories: &[DependencyCategory] = if version == FormatVersion::PreVersioning {
        &[DependencyCategory::HARD]
    } else {
        &[DependencyCategory::HARD, DependencyCategory::SOFT]
    };
    let mut stream = StreamGraph::default();
    for node in 0..node_count {
        stream.read_node(r, node, node_count, categories)?;
    }
    stream.validate(|idx| describe(&identifiers, idx))?;
    stream.apply(&mut state, &identifiers, options);
    Ok(state)
}

fn decode_pre_versioning(r: &mut Reader<'_>, options: &SerializationOptions) -> Result<RegistryState, FormatError> {
    decode_legacy(r, options, FormatVersion::PreVersioning)
}

fn decode_hard_soft(r: &mut Reader<'_>, options: &SerializationOptions) -> Result<RegistryState, FormatError> {
    decode_legacy(r, options, FormatVersion::HardSoftDependencies)
}

// ---- Files -------------------------------------------------------------------

pub fn save_to_file(path: &Path, state: &RegistryState, options: &SerializationOptions) -> Result<usize> {
    let bytes = serialize(state, options);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create catalog directory: {}", parent.display()))?;
    }

    let mut tmp_os = path.as_os_str().to_os_string();
    tmp_os.push(".tmp");
    let tmp = PathBuf::from(tmp_os);
    std::fs::write(&tmp, &bytes)
        .with_context(|| format!("Failed to write catalog file: {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace catalog file: {}", path.display()))?;
    Ok(bytes.len())
}

pub fn load_from_file(path: &Path, options: &SerializationOptions) -> Result<RegistryState> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open catalog file: {}", path.display()))?;
    // SAFETY: the file is opened read-only and the map is dropped before this
    // function returns; the decoded state owns all of its data.
    let mmap = unsafe { Mmap::map(&file) }
        .with_context(|| format!("Failed to map catalog file: {}", path.display()))?;
    deserialize(&mmap[..], options)
        .with_context(|| format!("Failed to decode catalog file: {}", path.display()))
}
