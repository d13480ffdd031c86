use bitflags::bitflags;
use glam::{Mat3, Vec3};

use super::arena::Arena;
use super::{BodyIndex, ColliderIndex, NodeIndex};

bitflags! {
    /// Pending work coalesced on a node; each node acts at most once per tick.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeActions: u32 {
        const READ_TRANSFORM = 1 << 0;
        const KINEMATIC_VELOCITY = 1 << 1;
        const OVERRIDE_OLD_TRANSFORM = 1 << 2;
        const MASS_UPDATE = 1 << 3;
        const BROADPHASE_INSERT = 1 << 4;
        const BROADPHASE_UPDATE = 1 << 5;
        const BROADPHASE_REMOVE = 1 << 6;
    }
}

/// World transform snapshot with the previous tick's values retained for
/// kinematic velocity derivation.
#[derive(Debug, Clone, Copy)]
pub struct WorldTransform {
    pub translation: Vec3,
    pub rotation: Mat3,
    pub scale: Vec3,
    pub old_translation: Vec3,
    pub old_rotation: Mat3,
}

impl Default for WorldTransform {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            rotation: Mat3::IDENTITY,
            scale: Vec3::ONE,
            old_translation: Vec3::ZERO,
            old_rotation: Mat3::IDENTITY,
        }
    }
}

/// One node per game object owning a collider or body; the tree mirrors the
/// scene hierarchy.
#[derive(Debug, Default)]
pub struct PhysicsNode {
    pub parent: Option<NodeIndex>,
    pub children: Vec<NodeIndex>,
    pub collider: Option<ColliderIndex>,
    pub body: Option<BodyIndex>,
    pub transform: WorldTransform,
    pending_translation: Option<Vec3>,
    pending_rotation: Option<Mat3>,
    pub actions: NodeActions,
}

impl PhysicsNode {
    /// Queues an externally driven transform change; applied at the next
    /// tick boundary, never mid-step.
    pub fn queue_transform(&mut self, translation: Option<Vec3>, rotation: Option<Mat3>) {
        if translation.is_some() {
            self.pending_translation = translation;
        }
        if rotation.is_some() {
            self.pending_rotation = rotation;
        }
        self.actions |= NodeActions::READ_TRANSFORM
            | NodeActions::KINEMATIC_VELOCITY
            | NodeActions::MASS_UPDATE
            | NodeActions::BROADPHASE_UPDATE;
    }

    /// Applies the queued transform, retaining the previous values.
    pub fn apply_pending(&mut self) -> bool {
        if !self.actions.contains(NodeActions::READ_TRANSFORM) {
            return false;
        }
        self.actions.remove(NodeActions::READ_TRANSFORM);
        self.transform.old_translation = self.transform.translation;
        self.transform.old_rotation = self.transform.rotation;
        if let Some(translation) = self.pending_translation.take() {
            self.transform.translation = translation;
        }
        if let Some(rotation) = self.pending_rotation.take() {
            self.transform.rotation = rotation;
        }
        true
    }

    /// Makes the old transform equal the current one so the next kinematic
    /// derivation does not register a teleport.
    pub fn override_old_transform(&mut self) {
        self.transform.old_translation = self.transform.translation;
        self.transform.old_rotation = self.transform.rotation;
        self.actions.remove(NodeActions::OVERRIDE_OLD_TRANSFORM);
    }
}

/// The arena-backed node tree owned by the space.
#[derive(Debug, Default)]
pub struct NodeTree {
    nodes: Arena<PhysicsNode>,
}

impl NodeTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, parent: Option<NodeIndex>) -> NodeIndex {
        let index = self.nodes.insert(PhysicsNode {
            parent,
            ..Default::default()
        });
        if let Some(parent) = parent {
            if let Some(node) = self.nodes.get_mut(parent) {
                node.children.push(index);
            }
        }
        index
    }

    /// Removes a node; children are re-parented to the removed node's parent
    /// so the tree stays connected.
    pub fn remove(&mut self, index: NodeIndex) -> Option<PhysicsNode> {
        let node = self.nodes.remove(index)?;
        if let Some(parent) = node.parent {
            if let Some(parent_node) = self.nodes.get_mut(parent) {
                parent_node.children.retain(|&child| child != index);
                parent_node.children.extend(node.children.iter().copied());
            }
        }
        for &child in &node.children {
            if let Some(child_node) = self.nodes.get_mut(child) {
                child_node.parent = node.parent;
            }
        }
        Some(node)
    }

    pub fn attach(&mut self, child: NodeIndex, parent: NodeIndex) {
        self.detach(child);
        if let Some(node) = self.nodes.get_mut(child) {
            node.parent = Some(parent);
        }
        if let Some(node) = self.nodes.get_mut(parent) {
            node.children.push(child);
        }
    }

    pub fn detach(&mut self, child: NodeIndex) {
        let Some(parent) = self.nodes.get(child).and_then(|node| node.parent) else {
            return;
        };
        if let Some(parent_node) = self.nodes.get_mut(parent) {
            parent_node.children.retain(|&c| c != child);
        }
        if let Some(node) = self.nodes.get_mut(child) {
            node.parent = None;
        }
    }

    pub fn get(&self, index: NodeIndex) -> Option<&PhysicsNode> {
        self.nodes.get(index)
    }

    pub fn get_mut(&mut self, index: NodeIndex) -> Option<&mut PhysicsNode> {
        self.nodes.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeIndex, &PhysicsNode)> {
        self.nodes.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (NodeIndex, &mut PhysicsNode)> {
        self.nodes.iter_mut()
    }

    pub fn indices(&self) -> Vec<NodeIndex> {
        self.nodes.indices()
    }

    /// Node indices with children before parents, the order transforms are
    /// published back to the scene.
    pub fn bottom_up(&self) -> Vec<NodeIndex> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let roots: Vec<NodeIndex> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.parent.is_none())
            .map(|(index, _)| index)
            .collect();
        for root in roots {
            self.post_order(root, &mut order);
        }
        order
    }

    fn post_order(&self, index: NodeIndex, order: &mut Vec<NodeIndex>) {
        let Some(node) = self.nodes.get(index) else {
            return;
        };
        for &child in &node.children {
            self.post_order(child, order);
        }
        order.push(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bottom_up_visits_children_first() {
        let mut tree = NodeTree::new();
        let root = tree.add(None);
        let child = tree.add(Some(root));
        let grandchild = tree.add(Some(child));

        let order = tree.bottom_up();
        let position = |index| order.iter().position(|&i| i == index).unwrap();
        assert!(position(grandchild) < position(child));
        assert!(position(child) < position(root));
    }

    #[test]
    fn removal_reparents_children() {
        let mut tree = NodeTree::new();
        let root = tree.add(None);
        let middle = tree.add(Some(root));
        let leaf = tree.add(Some(middle));

        tree.remove(middle);
        assert_eq!(tree.get(leaf).unwrap().parent, Some(root));
        assert!(tree.get(root).unwrap().children.contains(&leaf));
    }

    #[test]
    fn pending_transform_applies_once() {
        let mut node = PhysicsNode::default();
        node.queue_transform(Some(Vec3::X), None);
        assert!(node.apply_pending());
        assert_eq!(node.transform.translation, Vec3::X);
        assert_eq!(node.transform.old_translation, Vec3::ZERO);
        assert!(!node.apply_pending());
    }
}
