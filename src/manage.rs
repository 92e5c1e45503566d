//! Manage-edge propagation.
//!
//! Each explicit `(manager, target)` pair starts a depth-first walk at the
//! target. A caller predicate decides per visited node whether the manager
//! should manage it and whether the walk continues through its dependencies.
//! Nodes are collected first and committed as manage edges only once the walk
//! for that manager is complete, so the predicate always observes the manage
//! graph as it was before the run.

use bitflags::bitflags;
use std::collections::{BTreeMap, HashSet};

use crate::dependency::{DependencyCategory, NodeId};
use crate::identifier::AssetIdentifier;
use crate::state::RegistryState;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ManagerFlags: u8 {
        /// The target is the explicitly requested one, not reached by recursion.
        const IS_DIRECT_SET = 0x01;
        /// Some node already held a manage edge to the target before this run.
        const TARGET_HAS_EXISTING_MANAGER = 0x02;
        /// The target is itself explicitly managed by some manager in this run.
        const TARGET_HAS_DIRECT_MANAGER = 0x04;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerDecision {
    DoNotSet,
    SetButDoNotRecurse,
    SetAndRecurse,
}

#[derive(Debug, Clone, Copy)]
pub struct ManageCandidate<'a> {
    pub manager: &'a AssetIdentifier,
    pub source: &'a AssetIdentifier,
    pub target: &'a AssetIdentifier,
    pub dependency_type: DependencyCategory,
    pub flags: ManagerFlags,
}

/// The predicate used when the caller has no policy of its own.
pub fn set_but_do_not_recurse(_: &ManageCandidate<'_>) -> ManagerDecision {
    ManagerDecision::SetButDoNotRecurse
}

/// Adds manage edges for every pair in `manager_map` (manager, managed) and
/// whatever the predicate accepts beyond them. Returns the number of manage
/// edges committed.
pub fn set_manage_references(
    state: &mut RegistryState,
    manager_map: &[(AssetIdentifier, AssetIdentifier)],
    clear_existing: bool,
    recurse: DependencyCategory,
    mut should_set: impl FnMut(&ManageCandidate<'_>) -> ManagerDecision,
) -> usize {
    let mut existing: HashSet<NodeId> = state
        .graph()
        .iter()
        .flat_map(|(_, node)| {
            node.dependencies_of(DependencyCategory::MANAGE)
                .iter()
                .copied()
                .collect::<Vec<_>>()
        })
        .collect();

    if clear_existing {
        for target in existing.drain() {
            state.graph_mut().remove_manage_references_to(target);
        }
    }

    let mut explicit: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
    for (manager, managed) in manager_map {
        let Some(managed_node) = state.find_node(managed) else {
            tracing::warn!(%manager, %managed, "cannot set manager, managed asset does not exist");
            continue;
        };
        let manager_node = state.create_or_find_node(manager);
        let managers = explicit.entry(managed_node).or_default();
        if !managers.contains(&manager_node) {
            managers.push(manager_node);
        }
    }

    let mut committed = 0usize;
    for (base, managers) in explicit.iter() {
        for manager in managers.iter().copied() {
            let collected = collect_managed(
                state,
                manager,
                *base,
                recurse,
                &existing,
                &explicit,
                &mut should_set,
            );
            let graph = state.graph_mut();
            for target in collected {
                if !graph.has_edge(manager, target, DependencyCategory::MANAGE) {
                    committed += 1;
                }
                graph.connect(manager, target, DependencyCategory::MANAGE);
            }
        }
    }
    committed
}

fn collect_managed(
    state: &RegistryState,
    manager: NodeId,
    base: NodeId,
    recurse: DependencyCategory,
    existing: &HashSet<NodeId>,
    explicit: &BTreeMap<NodeId, Vec<NodeId>>,
    should_set: &mut impl FnMut(&ManageCandidate<'_>) -> ManagerDecision,
) -> Vec<NodeId> {
    let graph = state.graph();
    let Some(manager_id) = graph.identifier(manager) else {
        return Vec::new();
    };

    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut to_manage: Vec<NodeId> = Vec::new();
    let mut to_recurse: Vec<NodeId> = Vec::new();

    let mut consider = |source: NodeId,
                        target: NodeId,
                        dependency_type: DependencyCategory,
                        to_manage: &mut Vec<NodeId>,
                        to_recurse: &mut Vec<NodeId>| {
        if !visited.insert(target) {
            return;
        }
        let (Some(source_id), Some(target_id)) = (graph.identifier(source), graph.identifier(target)) else {
            return;
        };
        let direct = source == manager;
        let mut flags = ManagerFlags::empty();
        flags.set(ManagerFlags::IS_DIRECT_SET, direct);
        flags.set(ManagerFlags::TARGET_HAS_EXISTING_MANAGER, existing.contains(&target));
        flags.set(
            ManagerFlags::TARGET_HAS_DIRECT_MANAGER,
            !direct && explicit.contains_key(&target),
        );

        let decision = should_set(&ManageCandidate {
            manager: manager_id,
            source: source_id,
            target: target_id,
            dependency_type,
            flags,
        });
        match decision {
            ManagerDecision::DoNotSet => {}
            ManagerDecision::SetButDoNotRecurse => to_manage.push(target),
            ManagerDecision::SetAndRecurse => {
                to_manage.push(target);
                to_recurse.push(target);
            }
        }
    };

    consider(
        manager,
        base,
        DependencyCategory::MANAGE,
        &mut to_manage,
        &mut to_recurse,
    );

    if !recurse.is_empty() {
        while let Some(source) = to_recurse.pop() {
            let Some(node) = graph.node(source) else {
                continue;
            };
            for (target, category) in node.dependencies(recurse) {
                consider(source, target, category, &mut to_manage, &mut to_recurse);
            }
        }
    }
    to_manage
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AssetRecord;

    fn chain_state() -> anyhow::Result<RegistryState> {
        let mut state = RegistryState::new();
        for name in ["Map", "Mesh", "Texture", "Shared"] {
            state.add_asset(AssetRecord::new(&format!("/Game/{name}"), name, "Thing"))?;
        }
        let map = state.create_or_find_node(&"/Game/Map".into());
        let mesh = state.create_or_find_node(&"/Game/Mesh".into());
        let texture = state.create_or_find_node(&"/Game/Texture".into());
        let shared = state.create_or_find_node(&"/Game/Shared".into());
        let graph = state.graph_mut();
        graph.connect(map, mesh, DependencyCategory::HARD);
        graph.connect(mesh, texture, DependencyCategory::HARD);
        graph.connect(texture, mesh, DependencyCategory::HARD);
        graph.connect(map, shared, DependencyCategory::SOFT);
        Ok(state)
    }

    fn managed_by(state: &RegistryState, manager: &AssetIdentifier) -> Vec<String> {
        let mut out: Vec<String> = state
            .get_dependencies(manager, DependencyCategory::MANAGE)
            .unwrap_or_default()
            .iter()
            .map(ToString::to_string)
            .collect();
        out.sort();
        out
    }

    #[test]
    fn default_predicate_sets_only_the_explicit_target() -> anyhow::Result<()> {
        let mut state = chain_state()?;
        let manager = AssetIdentifier::primary_asset("Map", "Arena");
        let map = [(manager.clone(), AssetIdentifier::package("/Game/Map"))];
        let count = set_manage_references(&mut state, &map, false, DependencyCategory::HARD, set_but_do_not_recurse);
        assert_eq!(count, 1);
        assert_eq!(managed_by(&state, &manager), vec!["/Game/Map"]);
        Ok(())
    }

    #[test]
    fn recursion_follows_category_and_survives_cycles() -> anyhow::Result<()> {
        let mut state = chain_state()?;
        let manager = AssetIdentifier::primary_asset("Map", "Arena");
        let map = [(manager.clone(), AssetIdentifier::package("/Game/Map"))];
        let mut calls = 0usize;
        set_manage_references(&mut state, &map, false, DependencyCategory::HARD, |candidate| {
            calls += 1;
            if candidate.flags.contains(ManagerFlags::IS_DIRECT_SET) {
                assert_eq!(candidate.dependency_type, DependencyCategory::MANAGE);
            }
            ManagerDecision::SetAndRecurse
        });

        assert_eq!(
            managed_by(&state, &manager),
            vec!["/Game/Map", "/Game/Mesh", "/Game/Texture"]
        );
        assert_eq!(calls, 3);
        state.check_consistency().map_err(anyhow::Error::msg)?;
        Ok(())
    }

    #[test]
    fn flags_expose_pre_existing_managers() -> anyhow::Result<()> {
        let mut state = chain_state()?;
        let first = AssetIdentifier::primary_asset("Map", "Arena");
        set_manage_references(
            &mut state,
            &[(first.clone(), AssetIdentifier::package("/Game/Mesh"))],
            false,
            DependencyCategory::empty(),
            set_but_do_not_recurse,
        );

        let second = AssetIdentifier::primary_asset("Map", "Lobby");
        set_manage_references(
            &mut state,
            &[(second.clone(), AssetIdentifier::package("/Game/Map"))],
            false,
            DependencyCategory::HARD,
            |candidate| {
                if candidate.flags.contains(ManagerFlags::TARGET_HAS_EXISTING_MANAGER) {
                    ManagerDecision::DoNotSet
                } else {
                    ManagerDecision::SetAndRecurse
                }
            },
        );
        assert_eq!(managed_by(&state, &second), vec!["/Game/Map"]);
        assert_eq!(managed_by(&state, &first), vec!["/Game/Mesh"]);
        Ok(())
    }

    #[test]
    fn clear_existing_drops_old_edges_and_missing_targets_are_skipped() -> anyhow::Result<()> {
        let mut state = chain_state()?;
        let manager = AssetIdentifier::primary_asset("Map", "Arena");
        set_manage_references(
            &mut state,
            &[(manager.clone(), AssetIdentifier::package("/Game/Mesh"))],
            false,
            DependencyCategory::empty(),
            set_but_do_not_recurse,
        );
        let count = set_manage_references(
            &mut state,
            &[
                (manager.clone(), AssetIdentifier::package("/Game/Shared")),
                (manager.clone(), AssetIdentifier::package("/Game/Nowhere")),
            ],
            true,
            DependencyCategory::empty(),
            set_but_do_not_recurse,
        );
        assert_eq!(count, 1);
        assert_eq!(managed_by(&state, &manager), vec!["/Game/Shared"]);
        Ok(())
    }
}
