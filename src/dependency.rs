//! Dependency graph between asset identifiers.
//!
//! Nodes live in an arena addressed by [`NodeId`]. Every edge is created and
//! destroyed through [`DependencyGraph::connect`] and
//! [`DependencyGraph::disconnect`], which always touch both the dependency
//! set of the source and the referencer set of the target. Referencer sets do
//! not record a category: `A` is a referencer of `B` exactly while `A` holds at
//! least one edge of any category to `B`.

use bitflags::bitflags;
use std::collections::{BTreeSet, HashMap};

use crate::identifier::AssetIdentifier;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DependencyCategory: u8 {
        const HARD = 0x01;
        const SOFT = 0x02;
        const SEARCHABLE_NAME = 0x04;
        const MANAGE = 0x08;

        const PACKAGES = Self::HARD.bits() | Self::SOFT.bits();
        const ALL = Self::HARD.bits()
            | Self::SOFT.bits()
            | Self::SEARCHABLE_NAME.bits()
            | Self::MANAGE.bits();
    }
}

impl DependencyCategory {
    /// The four edge categories in serialization order.
    pub const ORDERED: [DependencyCategory; 4] = [
        DependencyCategory::HARD,
        DependencyCategory::SOFT,
        DependencyCategory::SEARCHABLE_NAME,
        DependencyCategory::MANAGE,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "hard" => Some(Self::HARD),
            "soft" => Some(Self::SOFT),
            "searchable" | "searchable_name" | "searchablename" => Some(Self::SEARCHABLE_NAME),
            "manage" => Some(Self::MANAGE),
            "packages" => Some(Self::PACKAGES),
            "all" => Some(Self::ALL),
            _ => None,
        }
    }

    fn slot(self) -> usize {
        match self {
            c if c == Self::HARD => 0,
            c if c == Self::SOFT => 1,
            c if c == Self::SEARCHABLE_NAME => 2,
            _ => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
pub struct DependencyNode {
    identifier: AssetIdentifier,
    dependencies: [BTreeSet<NodeId>; 4],
    referencers: BTreeSet<NodeId>,
}

impl DependencyNode {
    fn new(identifier: AssetIdentifier) -> Self {
        Self {
            identifier,
            dependencies: Default::default(),
            referencers: BTreeSet::new(),
        }
    }

    pub fn identifier(&self) -> &AssetIdentifier {
        &self.identifier
    }

    /// Outgoing edges restricted to `mask`, in category order.
    pub fn dependencies(
        &self,
        mask: DependencyCategory,
    ) -> impl Iterator<Item = (NodeId, DependencyCategory)> + '_ {
        DependencyCategory::ORDERED
            .into_iter()
            .filter(move |category| mask.contains(*category))
            .flat_map(move |category| {
                self.dependencies[category.slot()]
                    .iter()
                    .map(move |target| (*target, category))
            })
    }

    pub fn dependencies_of(&self, category: DependencyCategory) -> &BTreeSet<NodeId> {
        &self.dependencies[category.slot()]
    }

    pub fn referencers(&self) -> &BTreeSet<NodeId> {
        &self.referencers
    }

    pub fn connection_count(&self) -> usize {
        self.dependencies.iter().map(BTreeSet::len).sum::<usize>() + self.referencers.len()
    }

    fn has_any_edge_to(&self, target: NodeId) -> bool {
        self.dependencies.iter().any(|set| set.contains(&target))
    }
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<Option<DependencyNode>>,
    free: Vec<u32>,
    by_identifier: HashMap<AssetIdentifier, NodeId>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_identifier.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_identifier.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.by_identifier.clear();
    }

    pub fn reserve(&mut self, additional: usize) {
        self.nodes.reserve(additional);
        self.by_identifier.reserve(additional);
    }

    pub fn find(&self, identifier: &AssetIdentifier) -> Option<NodeId> {
        self.by_identifier.get(identifier).copied()
    }

    pub fn create_or_find(&mut self, identifier: &AssetIdentifier) -> NodeId {
        if let Some(id) = self.find(identifier) {
            return id;
        }
        let node = DependencyNode::new(identifier.clone());
        let id = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot as usize] = Some(node);
                NodeId(slot)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId((self.nodes.len() - 1) as u32)
            }
        };
        self.by_identifier.insert(identifier.clone(), id);
        id
    }

    pub fn node(&self, id: NodeId) -> Option<&DependencyNode> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut DependencyNode> {
        self.nodes.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub fn identifier(&self, id: NodeId) -> Option<&AssetIdentifier> {
        self.node(id).map(DependencyNode::identifier)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &DependencyNode)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|node| (NodeId(idx as u32), node)))
    }

    /// Adds `from -> to` for every category in `categories` and registers
    /// `from` as a referencer of `to`. Returns false when either node is gone.
    pub fn connect(&mut self, from: NodeId, to: NodeId, categories: DependencyCategory) -> bool {
        if self.node(from).is_none() || self.node(to).is_none() || categories.is_empty() {
            return false;
        }
        if let Some(source) = self.node_mut(from) {
            for category in DependencyCategory::ORDERED {
                if categories.contains(category) {
                    source.dependencies[category.slot()].insert(to);
                }
            }
        }
        if let Some(target) = self.node_mut(to) {
            target.referencers.insert(from);
        }
        true
    }

    /// Removes `from -> to` in `categories`. The referencer link is dropped
    /// once no category connects the pair any more.
    pub fn disconnect(&mut self, from: NodeId, to: NodeId, categories: DependencyCategory) -> bool {
        let Some(source) = self.node_mut(from) else {
            return false;
        };
        let mut removed = false;
        for category in DependencyCategory::ORDERED {
            if categories.contains(category) {
                removed |= source.dependencies[category.slot()].remove(&to);
            }
        }
        let still_connected = source.has_any_edge_to(to);
        if !still_connected && let Some(target) = self.node_mut(to) {
            target.referencers.remove(&from);
        }
        removed
    }

    /// Drops every outgoing edge of `from` in `categories`.
    pub fn clear_dependencies(&mut self, from: NodeId, categories: DependencyCategory) {
        let targets: Vec<(NodeId, DependencyCategory)> = match self.node(from) {
            Some(node) => node.dependencies(categories).collect(),
            None => return,
        };
        for (target, category) in targets {
            self.disconnect(from, target, category);
        }
    }

    /// Deletes the node for `identifier`, clearing it from the referencer set
    /// of every dependency and from every category of every referencer.
    pub fn remove(&mut self, identifier: &AssetIdentifier) -> bool {
        let Some(id) = self.by_identifier.remove(identifier) else {
            return false;
        };
        let Some(node) = self.nodes.get_mut(id.index()).and_then(Option::take) else {
            return false;
        };
        self.free.push(id.0);

        for set in node.dependencies.iter() {
            for target in set {
                if let Some(target) = self.node_mut(*target) {
                    target.referencers.remove(&id);
                }
            }
        }
        for referencer in node.referencers.iter() {
            if let Some(referencer) = self.node_mut(*referencer) {
                for set in referencer.dependencies.iter_mut() {
                    set.remove(&id);
                }
            }
        }
        true
    }

    /// Removes every incoming manage edge of `id`.
    pub fn remove_manage_references_to(&mut self, id: NodeId) {
        let referencers: Vec<NodeId> = match self.node(id) {
            Some(node) => node.referencers.iter().copied().collect(),
            None => return,
        };
        for referencer in referencers {
            self.disconnect(referencer, id, DependencyCategory::MANAGE);
        }
    }

    pub fn dependencies(&self, id: NodeId, mask: DependencyCategory) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = Vec::new();
        if let Some(node) = self.node(id) {
            for (target, _) in node.dependencies(mask) {
                if !out.contains(&target) {
                    out.push(target);
                }
            }
        }
        out
    }

    /// Referencers of `id` that still hold an edge in `mask` to it.
    pub fn referencers(&self, id: NodeId, mask: DependencyCategory) -> Vec<NodeId> {
        let Some(node) = self.node(id) else {
            return Vec::new();
        };
        if mask == DependencyCategory::ALL {
            return node.referencers.iter().copied().collect();
        }
        node.referencers
            .iter()
            .copied()
            .filter(|referencer| {
                self.node(*referencer).is_some_and(|source| {
                    DependencyCategory::ORDERED
                        .into_iter()
                        .filter(|category| mask.contains(*category))
                        .any(|category| source.dependencies_of(category).contains(&id))
                })
            })
            .collect()
    }

    pub fn has_edge(&self, from: NodeId, to: NodeId, category: DependencyCategory) -> bool {
        self.node(from)
            .is_some_and(|node| node.dependencies_of(category).contains(&to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(graph: &DependencyGraph, nodes: &[NodeId]) -> Vec<String> {
        nodes
            .iter()
            .filter_map(|n| graph.identifier(*n))
            .map(|i| i.to_string())
            .collect()
    }

    #[test]
    fn connect_registers_both_sides() {
        let mut graph = DependencyGraph::new();
        let a = graph.create_or_find(&"/Game/A".into());
        let b = graph.create_or_find(&"/Game/B".into());
        assert!(graph.connect(a, b, DependencyCategory::HARD));

        assert_eq!(ids(&graph, &graph.dependencies(a, DependencyCategory::HARD)), vec!["/Game/B"]);
        assert_eq!(ids(&graph, &graph.referencers(b, DependencyCategory::HARD)), vec!["/Game/A"]);
        assert!(graph.referencers(b, DependencyCategory::SOFT).is_empty());
    }

    #[test]
    fn referencer_survives_until_last_category_is_gone() {
        let mut graph = DependencyGraph::new();
        let a = graph.create_or_find(&"/Game/A".into());
        let b = graph.create_or_find(&"/Game/B".into());
        graph.connect(a, b, DependencyCategory::HARD | DependencyCategory::SOFT);

        graph.disconnect(a, b, DependencyCategory::HARD);
        assert!(graph.node(b).is_some_and(|n| n.referencers().contains(&a)));

        graph.disconnect(a, b, DependencyCategory::SOFT);
        assert!(graph.node(b).is_some_and(|n| n.referencers().is_empty()));
    }

    #[test]
    fn remove_clears_every_category_on_both_sides() {
        let mut graph = DependencyGraph::new();
        let a = graph.create_or_find(&"/Game/A".into());
        let b = graph.create_or_find(&"/Game/B".into());
        let c = graph.create_or_find(&"/Game/C".into());
        graph.connect(a, b, DependencyCategory::HARD);
        graph.connect(c, b, DependencyCategory::MANAGE);
        graph.connect(b, c, DependencyCategory::SEARCHABLE_NAME);

        assert!(graph.remove(&"/Game/B".into()));
        assert!(graph.find(&"/Game/B".into()).is_none());
        for (_, node) in graph.iter() {
            assert_eq!(node.connection_count(), 0, "{}", node.identifier());
        }
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut graph = DependencyGraph::new();
        let a = graph.create_or_find(&"/Game/A".into());
        graph.remove(&"/Game/A".into());
        let b = graph.create_or_find(&"/Game/B".into());
        assert_eq!(a, b);
        assert_eq!(graph.identifier(b).map(|i| i.to_string()).as_deref(), Some("/Game/B"));
    }

    #[test]
    fn self_edges_are_removed_cleanly() {
        let mut graph = DependencyGraph::new();
        let a = graph.create_or_find(&"/Game/A".into());
        graph.connect(a, a, DependencyCategory::SOFT);
        assert!(graph.remove(&"/Game/A".into()));
        assert!(graph.is_empty());
    }
}
