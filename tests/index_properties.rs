//! Property tests for the index.
//!
//! - Coherence: after any add/update/remove sequence every lookup map agrees
//!   with the record set
//! - Symmetry: every dependency edge has its referencer backlink
//! - Idempotence: re-applying an identical update changes nothing
//! - Roundtrip: a serialized state reads back with the same records and edges
//! - Composition: splitting a filter's constraints over two filters and
//!   intersecting their results gives the combined filter's result

use asset_catalog::asset::AssetRecord;
use asset_catalog::config::SerializationOptions;
use asset_catalog::dependency::{DependencyCategory, DependencyGraph};
use asset_catalog::filter::AssetFilter;
use asset_catalog::identifier::AssetIdentifier;
use asset_catalog::serialization::{deserialize, serialize};
use asset_catalog::state::RegistryState;
use proptest::prelude::*;
use std::collections::{BTreeSet, HashSet};

const PACKAGES: [&str; 6] = [
    "/Game/Props/Chair",
    "/Game/Props/Table",
    "/Game/Maps/Arena",
    "/Game/Maps/Deep/Cave",
    "/Game/Materials/Wood",
    "/Game/UI/Hud",
];
const CLASSES: [&str; 3] = ["StaticMesh", "Material", "World"];
const COLORS: [&str; 3] = ["Red", "Green", "Blue"];
const PATHS: [&str; 6] = [
    "/Game",
    "/Game/Props",
    "/Game/Maps",
    "/Game/Maps/Deep",
    "/Game/Materials",
    "/Game/UI",
];

#[derive(Debug, Clone)]
enum Op {
    Upsert { package: usize, class: usize, color: usize },
    Remove { package: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..PACKAGES.len(), 0..CLASSES.len(), 0..COLORS.len())
            .prop_map(|(package, class, color)| Op::Upsert { package, class, color }),
        1 => (0..PACKAGES.len()).prop_map(|package| Op::Remove { package }),
    ]
}

fn record(package: usize, class: usize, color: usize) -> AssetRecord {
    let name = PACKAGES[package].rsplit('/').next().unwrap_or_default();
    AssetRecord::new(PACKAGES[package], name, CLASSES[class]).with_tag("Color", COLORS[color])
}

fn apply(state: &mut RegistryState, op: &Op) {
    match *op {
        Op::Upsert { package, class, color } => {
            let next = record(package, class, color);
            match state.asset_id(&next.object_path) {
                Some(id) => state.update_asset(id, next).unwrap(),
                None => {
                    state.add_asset(next).unwrap();
                }
            }
        }
        Op::Remove { package } => {
            let name = PACKAGES[package].rsplit('/').next().unwrap_or_default();
            let object_path = format!("{}.{}", PACKAGES[package], name);
            let _ = state.remove_asset_by_object_path(&object_path);
        }
    }
}

fn object_paths<'a>(records: impl IntoIterator<Item = &'a AssetRecord>) -> BTreeSet<String> {
    records.into_iter().map(|r| r.object_path.clone()).collect()
}

/// Index sets for each constraint kind a query can carry.
#[derive(Debug, Clone)]
struct Constraints {
    packages: BTreeSet<usize>,
    paths: BTreeSet<usize>,
    classes: BTreeSet<usize>,
    colors: BTreeSet<usize>,
}

fn constraints_strategy() -> impl Strategy<Value = Constraints> {
    (
        prop::collection::btree_set(0..PACKAGES.len(), 0..3),
        prop::collection::btree_set(0..PATHS.len(), 0..3),
        prop::collection::btree_set(0..CLASSES.len(), 0..3),
        prop::collection::btree_set(0..COLORS.len(), 0..3),
    )
        .prop_map(|(packages, paths, classes, colors)| Constraints {
            packages,
            paths,
            classes,
            colors,
        })
}

/// Builds the filter holding the kinds whose `sides` entry equals `side`, in
/// the order packages, paths, classes, colors.
fn filter_for(constraints: &Constraints, sides: [bool; 4], side: bool) -> AssetFilter {
    let mut filter = AssetFilter::new();
    if sides[0] == side {
        for idx in constraints.packages.iter() {
            filter = filter.package_name(PACKAGES[*idx]);
        }
    }
    if sides[1] == side {
        for idx in constraints.paths.iter() {
            filter = filter.package_path(PATHS[*idx]);
        }
    }
    if sides[2] == side {
        for idx in constraints.classes.iter() {
            filter = filter.class_name(CLASSES[*idx]);
        }
    }
    if sides[3] == side {
        for idx in constraints.colors.iter() {
            filter = filter.tag("Color", COLORS[*idx]);
        }
    }
    filter
}

/// A filter without constraints selects every record not skipped.
fn query(state: &RegistryState, filter: &AssetFilter, skip: &HashSet<String>) -> BTreeSet<String> {
    if filter.is_empty() {
        object_paths(state.get_all_assets(skip))
    } else {
        object_paths(state.get_assets(filter, skip).unwrap())
    }
}

fn brute_force(state: &RegistryState, filter: &AssetFilter, skip: &HashSet<String>) -> BTreeSet<String> {
    object_paths(
        state
            .iter_assets()
            .map(|(_, r)| r)
            .filter(|r| !skip.contains(&r.package_name) && filter.matches(r, None)),
    )
}

proptest! {
    #[test]
    fn lookup_maps_stay_coherent(ops in prop::collection::vec(op_strategy(), 0..40)) {
        let mut state = RegistryState::new();
        for op in ops.iter() {
            apply(&mut state, op);
        }
        prop_assert!(state.check_consistency().is_ok());

        let skip = HashSet::new();
        for class in CLASSES {
            let indexed = state.get_assets(&AssetFilter::new().class_name(class), &skip).unwrap();
            let scanned = state.iter_assets().map(|(_, r)| r).filter(|r| r.class_name == class);
            prop_assert_eq!(object_paths(indexed), object_paths(scanned));
        }
        for color in COLORS {
            let indexed = state.get_assets(&AssetFilter::new().tag("Color", color), &skip).unwrap();
            let scanned = state.iter_assets().map(|(_, r)| r).filter(|r| r.tag("Color") == Some(color));
            prop_assert_eq!(object_paths(indexed), object_paths(scanned));
        }
        let props = state
            .get_assets(&AssetFilter::new().package_path("/Game/Props").class_name("StaticMesh"), &skip)
            .unwrap();
        let scanned = state
            .iter_assets()
            .map(|(_, r)| r)
            .filter(|r| r.package_path == "/Game/Props" && r.class_name == "StaticMesh");
        prop_assert_eq!(object_paths(props), object_paths(scanned));
    }

    #[test]
    fn identical_updates_are_idempotent(
        ops in prop::collection::vec(op_strategy(), 1..20),
        package in 0..PACKAGES.len(),
    ) {
        let mut state = RegistryState::new();
        for op in ops.iter() {
            apply(&mut state, op);
        }
        let target = record(package, 0, 0);
        apply(&mut state, &Op::Upsert { package, class: 0, color: 0 });
        let before: Vec<AssetRecord> = state.iter_assets().map(|(_, r)| r.clone()).collect();
        let id = state.asset_id(&target.object_path).unwrap();
        state.update_asset(id, target).unwrap();
        let after: Vec<AssetRecord> = state.iter_assets().map(|(_, r)| r.clone()).collect();
        prop_assert_eq!(before, after);
        prop_assert!(state.check_consistency().is_ok());
    }

    #[test]
    fn every_edge_has_a_backlink(
        edges in prop::collection::vec((0..PACKAGES.len(), 0..PACKAGES.len(), 0..4usize, any::<bool>()), 0..60),
    ) {
        let mut graph = DependencyGraph::new();
        let ids: Vec<_> = PACKAGES
            .iter()
            .map(|p| graph.create_or_find(&AssetIdentifier::package(*p)))
            .collect();
        for (from, to, category, connect) in edges.iter().copied() {
            let category = DependencyCategory::ORDERED[category];
            if connect {
                graph.connect(ids[from], ids[to], category);
            } else {
                graph.disconnect(ids[from], ids[to], category);
            }
        }

        for (from, node) in graph.iter() {
            for (to, category) in node.dependencies(DependencyCategory::ALL) {
                prop_assert!(graph.has_edge(from, to, category));
                prop_assert!(graph.referencers(to, category).contains(&from));
            }
        }
    }

    #[test]
    fn serialized_states_read_back(
        classes in prop::collection::vec(0..CLASSES.len(), PACKAGES.len()),
        edges in prop::collection::vec((0..PACKAGES.len(), 0..PACKAGES.len(), any::<bool>()), 0..20),
    ) {
        let mut state = RegistryState::new();
        for (package, class) in classes.iter().copied().enumerate() {
            state.add_asset(record(package, class, package % COLORS.len())).unwrap();
        }
        for (from, to, hard) in edges.iter().copied() {
            if from == to {
                continue;
            }
            let from = state.create_or_find_node(&AssetIdentifier::package(PACKAGES[from]));
            let to = state.create_or_find_node(&AssetIdentifier::package(PACKAGES[to]));
            let category = if hard { DependencyCategory::HARD } else { DependencyCategory::SOFT };
            state.graph_mut().connect(from, to, category);
        }

        let options = SerializationOptions::for_development();
        let bytes = serialize(&state, &options);
        let restored = deserialize(&bytes, &options).unwrap();

        let mut before: Vec<AssetRecord> = state.iter_assets().map(|(_, r)| r.clone()).collect();
        let mut after: Vec<AssetRecord> = restored.iter_assets().map(|(_, r)| r.clone()).collect();
        before.sort_by(|a, b| a.object_path.cmp(&b.object_path));
        after.sort_by(|a, b| a.object_path.cmp(&b.object_path));
        prop_assert_eq!(before, after);

        for package in PACKAGES {
            let id = AssetIdentifier::package(package);
            for category in [DependencyCategory::HARD, DependencyCategory::SOFT] {
                let expected: BTreeSet<AssetIdentifier> = state
                    .get_dependencies(&id, category)
                    .unwrap_or_default()
                    .into_iter()
                    .collect();
                let actual: BTreeSet<AssetIdentifier> = restored
                    .get_dependencies(&id, category)
                    .unwrap_or_default()
                    .into_iter()
                    .collect();
                prop_assert_eq!(expected, actual);
            }
        }
        prop_assert!(restored.check_consistency().is_ok());
    }

    #[test]
    fn split_filters_intersect_to_the_combined_result(
        ops in prop::collection::vec(op_strategy(), 0..40),
        constraints in constraints_strategy(),
        sides in prop::array::uniform4(any::<bool>()),
        skipped in prop::collection::btree_set(0..PACKAGES.len(), 0..2),
    ) {
        let mut state = RegistryState::new();
        for op in ops.iter() {
            apply(&mut state, op);
        }
        let skip: HashSet<String> = skipped.iter().map(|idx| PACKAGES[*idx].to_string()).collect();

        let left = filter_for(&constraints, sides, true);
        let right = filter_for(&constraints, sides, false);
        let combined = filter_for(&constraints, [true; 4], true);

        let expected = brute_force(&state, &combined, &skip);
        prop_assert_eq!(&query(&state, &combined, &skip), &expected);

        let intersected: BTreeSet<String> = query(&state, &left, &skip)
            .intersection(&query(&state, &right, &skip))
            .cloned()
            .collect();
        prop_assert_eq!(intersected, expected);
    }

    #[test]
    fn tag_only_filters_compose_with_an_empty_side(
        ops in prop::collection::vec(op_strategy(), 0..40),
        colors in prop::collection::btree_set(0..COLORS.len(), 1..=COLORS.len()),
    ) {
        let mut state = RegistryState::new();
        for op in ops.iter() {
            apply(&mut state, op);
        }
        let skip = HashSet::new();
        let constraints = Constraints {
            packages: BTreeSet::new(),
            paths: BTreeSet::new(),
            classes: BTreeSet::new(),
            colors,
        };
        // every kind on the left, so the right filter carries nothing
        let tags_only = filter_for(&constraints, [true; 4], true);
        let empty = filter_for(&constraints, [true; 4], false);
        prop_assert!(empty.is_empty());
        prop_assert!(state.get_assets(&empty, &skip).is_err());

        let expected = brute_force(&state, &tags_only, &skip);
        prop_assert_eq!(&query(&state, &tags_only, &skip), &expected);

        let intersected: BTreeSet<String> = query(&state, &tags_only, &skip)
            .intersection(&query(&state, &empty, &skip))
            .cloned()
            .collect();
        prop_assert_eq!(intersected, expected);
    }
}
