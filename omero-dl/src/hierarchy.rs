//! Arena-backed Project → Dataset → (Folder) → Image tree.
//!
//! Parents own their children through index lists; the parent link is a
//! plain handle used for upward walks only. Freed slots are reused; a
//! handle carries its tree's tag and the slot generation, so handles from
//! another tree or to a removed node resolve to nothing.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use omero_core::{DatasetId, ImageId, ProjectId};
use thiserror::Error;

static NEXT_TREE_TAG: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    tree: u32,
    index: u32,
    generation: u32,
}

impl NodeId {
    #[cfg(test)]
    pub(crate) fn test(raw: u32) -> Self {
        Self {
            tree: 0,
            index: raw,
            generation: 0,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Project,
    Dataset,
    Folder,
    Image,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Project => "project",
            NodeKind::Dataset => "dataset",
            NodeKind::Folder => "folder",
            NodeKind::Image => "image",
        }
    }

    fn accepts_child(parent: Option<NodeKind>, child: NodeKind) -> bool {
        matches!(
            (parent, child),
            (None, NodeKind::Project)
                | (Some(NodeKind::Project), NodeKind::Dataset)
                | (Some(NodeKind::Dataset), NodeKind::Folder | NodeKind::Image)
                | (Some(NodeKind::Folder), NodeKind::Image)
        )
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of a node: its kind plus the kind-scoped id.
///
/// Folders are keyed by their name since they have no remote counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Entity {
    Project(ProjectId),
    Dataset(DatasetId),
    Folder(String),
    Image(ImageId),
}

impl Entity {
    pub fn kind(&self) -> NodeKind {
        match self {
            Entity::Project(_) => NodeKind::Project,
            Entity::Dataset(_) => NodeKind::Dataset,
            Entity::Folder(_) => NodeKind::Folder,
            Entity::Image(_) => NodeKind::Image,
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Project(id) => write!(f, "project:{id}"),
            Entity::Dataset(id) => write!(f, "dataset:{id}"),
            Entity::Folder(name) => write!(f, "folder:{name}"),
            Entity::Image(id) => write!(f, "image:{id}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    entity: Entity,
    name: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl Node {
    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn kind(&self) -> NodeKind {
        self.entity.kind()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("node {0} is not part of this tree")]
    StaleNode(NodeId),
    #[error("tree cannot hold more nodes")]
    Full,
    #[error("a {child} cannot be placed under {}", .parent.map_or("the root", NodeKind::as_str))]
    InvalidNesting {
        parent: Option<NodeKind>,
        child: NodeKind,
    },
}

#[derive(Debug, Clone, Default)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

#[derive(Debug, Clone)]
pub struct Tree {
    tag: u32,
    slots: Vec<Slot>,
    free: Vec<u32>,
    roots: Vec<NodeId>,
    live: usize,
}

impl Default for Tree {
    fn default() -> Self {
        Self {
            tag: NEXT_TREE_TAG.fetch_add(1, Ordering::Relaxed),
            slots: Vec::new(),
            free: Vec::new(),
            roots: Vec::new(),
            live: 0,
        }
    }
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.slot(id)?.node.as_ref()
    }

    fn slot(&self, id: NodeId) -> Option<&Slot> {
        if id.tree != self.tag {
            return None;
        }
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
    }

    fn slot_mut(&mut self, id: NodeId) -> Option<&mut Slot> {
        if id.tree != self.tag {
            return None;
        }
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, TreeError> {
        self.get(id).ok_or(TreeError::StaleNode(id))
    }

    /// Children of `parent`, or the roots when `parent` is `None`.
    pub fn children_of(&self, parent: Option<NodeId>) -> &[NodeId] {
        match parent {
            None => &self.roots,
            Some(id) => self.get(id).map(Node::children).unwrap_or(&[]),
        }
    }

    pub fn find_child(&self, parent: Option<NodeId>, entity: &Entity) -> Option<NodeId> {
        self.children_of(parent)
            .iter()
            .copied()
            .find(|child| self.get(*child).is_some_and(|node| &node.entity == entity))
    }

    /// Returns the child of `parent` matching `entity`, appending a new one
    /// when none exists. The flag is true when the node was created.
    pub fn find_or_insert(
        &mut self,
        parent: Option<NodeId>,
        entity: Entity,
        name: impl Into<String>,
    ) -> Result<(NodeId, bool), TreeError> {
        let parent_kind = match parent {
            Some(id) => Some(self.node(id)?.kind()),
            None => None,
        };
        if !NodeKind::accepts_child(parent_kind, entity.kind()) {
            return Err(TreeError::InvalidNesting {
                parent: parent_kind,
                child: entity.kind(),
            });
        }
        if let Some(existing) = self.find_child(parent, &entity) {
            return Ok((existing, false));
        }

        let node = Node {
            entity,
            name: name.into(),
            parent,
            children: Vec::new(),
        };
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                NodeId {
                    tree: self.tag,
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = u32::try_from(self.slots.len()).map_err(|_| TreeError::Full)?;
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                NodeId {
                    tree: self.tag,
                    index,
                    generation: 0,
                }
            }
        };
        self.live += 1;
        match parent {
            None => self.roots.push(id),
            Some(parent) => {
                if let Some(node) = self.get_mut(parent) {
                    node.children.push(id);
                }
            }
        }
        Ok((id, true))
    }

    /// Detaches `id` and drops it together with all of its descendants.
    /// Returns the removed node and the number of nodes dropped.
    pub fn remove(&mut self, id: NodeId) -> Result<(Node, usize), TreeError> {
        let parent = self.node(id)?.parent;
        match parent {
            None => self.roots.retain(|root| *root != id),
            Some(parent) => {
                if let Some(node) = self.get_mut(parent) {
                    node.children.retain(|child| *child != id);
                }
            }
        }

        let mut removed = None;
        let mut count = 0;
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let taken = self.slot_mut(current).and_then(|slot| {
                let node = slot.node.take()?;
                slot.generation = slot.generation.wrapping_add(1);
                Some(node)
            });
            if let Some(node) = taken {
                self.free.push(current.index);
                stack.extend(node.children.iter().copied());
                count += 1;
                if current == id {
                    removed = Some(node);
                }
            }
        }
        self.live -= count;
        removed
            .map(|node| (node, count))
            .ok_or(TreeError::StaleNode(id))
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slot_mut(id)?.node.as_mut()
    }

    /// Drops every node. Outstanding handles become stale.
    pub fn clear(&mut self) {
        for (index, slot) in (0u32..).zip(self.slots.iter_mut()) {
            if slot.node.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index);
            }
        }
        self.roots.clear();
        self.live = 0;
    }

    /// Walks parent links from `id` (inclusive) up to its root.
    pub fn ancestors(&self, id: NodeId) -> Ancestors<'_> {
        Ancestors {
            tree: self,
            next: self.get(id).map(|_| id),
        }
    }

    pub fn ancestor_of_kind(&self, id: NodeId, kind: NodeKind) -> Option<NodeId> {
        self.ancestors(id)
            .find(|ancestor| self.get(*ancestor).is_some_and(|node| node.kind() == kind))
    }

    /// Pre-order listing of `id` and everything below it.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.get(current) else {
                continue;
            };
            out.push(current);
            stack.extend(node.children.iter().rev().copied());
        }
        out
    }

    /// Pre-order listing of the whole tree.
    pub fn walk(&self) -> Vec<NodeId> {
        self.roots
            .iter()
            .flat_map(|root| self.descendants(*root))
            .collect()
    }

    /// First node carrying `entity`, searching the whole tree in pre-order.
    pub fn find(&self, entity: &Entity) -> Option<NodeId> {
        self.walk()
            .into_iter()
            .find(|id| self.get(*id).is_some_and(|node| &node.entity == entity))
    }
}

pub struct Ancestors<'a> {
    tree: &'a Tree,
    next: Option<NodeId>,
}

impl Iterator for Ancestors<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let current = self.next?;
        self.next = self.tree.get(current).and_then(Node::parent);
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Tree, NodeId, NodeId, NodeId) {
        let mut tree = Tree::new();
        let (project, _) = tree
            .find_or_insert(None, Entity::Project(ProjectId(1)), "P1")
            .unwrap();
        let (dataset, _) = tree
            .find_or_insert(Some(project), Entity::Dataset(DatasetId(10)), "D1")
            .unwrap();
        let (image, _) = tree
            .find_or_insert(Some(dataset), Entity::Image(ImageId(100)), "I1")
            .unwrap();
        (tree, project, dataset, image)
    }

    #[test]
    fn find_or_insert_reuses_matching_child() {
        let (mut tree, project, dataset, _) = sample();
        let (again, created) = tree
            .find_or_insert(Some(project), Entity::Dataset(DatasetId(10)), "renamed")
            .unwrap();
        assert_eq!(again, dataset);
        assert!(!created);
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.node(dataset).unwrap().name(), "D1");
    }

    #[test]
    fn same_id_different_kind_is_a_different_node() {
        let mut tree = Tree::new();
        let (project, _) = tree
            .find_or_insert(None, Entity::Project(ProjectId(7)), "P")
            .unwrap();
        let (dataset, _) = tree
            .find_or_insert(Some(project), Entity::Dataset(DatasetId(7)), "D")
            .unwrap();
        let (image, created) = tree
            .find_or_insert(Some(dataset), Entity::Image(ImageId(7)), "I")
            .unwrap();
        assert!(created);
        assert_ne!(image, dataset);
    }

    #[test]
    fn rejects_invalid_nesting() {
        let (mut tree, project, _, _) = sample();
        let err = tree
            .find_or_insert(Some(project), Entity::Image(ImageId(5)), "x")
            .unwrap_err();
        assert_eq!(
            err,
            TreeError::InvalidNesting {
                parent: Some(NodeKind::Project),
                child: NodeKind::Image
            }
        );
        assert!(
            tree.find_or_insert(None, Entity::Dataset(DatasetId(1)), "d")
                .is_err()
        );
    }

    #[test]
    fn ancestors_walk_up_to_root() {
        let (tree, project, dataset, image) = sample();
        let chain: Vec<NodeId> = tree.ancestors(image).collect();
        assert_eq!(chain, vec![image, dataset, project]);
        assert_eq!(tree.ancestor_of_kind(image, NodeKind::Project), Some(project));
    }

    #[test]
    fn remove_drops_subtree_and_invalidates_handles() {
        let (mut tree, project, dataset, image) = sample();
        let (removed, count) = tree.remove(dataset).unwrap();
        assert_eq!(removed.entity(), &Entity::Dataset(DatasetId(10)));
        assert_eq!(count, 2);
        assert_eq!(tree.len(), 1);
        assert!(tree.node(project).unwrap().children().is_empty());
        assert_eq!(tree.node(image).unwrap_err(), TreeError::StaleNode(image));
        assert_eq!(tree.remove(dataset).unwrap_err(), TreeError::StaleNode(dataset));
    }

    #[test]
    fn handles_from_before_clear_stay_stale() {
        let (mut tree, project, _, _) = sample();
        tree.clear();
        assert!(tree.is_empty());
        let (fresh, _) = tree
            .find_or_insert(None, Entity::Project(ProjectId(2)), "P2")
            .unwrap();
        assert_ne!(fresh, project);
        assert!(tree.get(project).is_none());
    }

    #[test]
    fn handle_from_another_tree_is_stale() {
        let (explorer, explorer_project, _, _) = sample();
        let (mut queue, queue_project, _, _) = sample();
        assert!(explorer.get(explorer_project).is_some());

        assert_eq!(
            queue.remove(explorer_project).unwrap_err(),
            TreeError::StaleNode(explorer_project)
        );
        assert_eq!(queue.len(), 3);
        assert!(queue.get(queue_project).is_some());
    }

    #[test]
    fn removed_slots_are_reused_with_a_new_generation() {
        let (mut tree, project, dataset, _) = sample();
        for id in 0..50 {
            let (image, _) = tree
                .find_or_insert(Some(dataset), Entity::Image(ImageId(1000 + id)), "tmp")
                .unwrap();
            tree.remove(image).unwrap();
            assert!(tree.get(image).is_none());
        }
        assert_eq!(tree.slots.len(), 4);

        let (image, _) = tree
            .find_or_insert(Some(dataset), Entity::Image(ImageId(7)), "I7")
            .unwrap();
        assert_eq!(tree.node(image).unwrap().name(), "I7");
        assert_eq!(tree.walk().first(), Some(&project));
    }

    #[test]
    fn walk_is_preorder_in_insertion_order() {
        let (mut tree, project, dataset, image) = sample();
        let (second, _) = tree
            .find_or_insert(Some(dataset), Entity::Image(ImageId(101)), "I2")
            .unwrap();
        assert_eq!(tree.walk(), vec![project, dataset, image, second]);
        assert_eq!(tree.find(&Entity::Image(ImageId(101))), Some(second));
    }
}
