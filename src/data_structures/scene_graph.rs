//! Scene graph and hierarchical transform propagation.
//!
//! Nodes live in an arena ([`SceneGraph`]) and are addressed by [`NodeId`].
//! Every mutation recomputes the node's local matrix and pushes world and
//! normal matrices down to all descendants, so reads never recompute.

use cgmath::{Matrix3, Matrix4, SquareMatrix, Vector3};
use log::warn;

use crate::data_structures::instance::{Instance, normal_matrix};

/// Arena index of a node. Ids are handed out monotonically and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// A transformable node with cached matrices.
#[derive(Clone, Debug)]
pub struct TransformNode {
    pub id: NodeId,
    transform: Instance,
    local: Matrix4<f32>,
    world: Matrix4<f32>,
    normal: Matrix3<f32>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl TransformNode {
    fn new(id: NodeId) -> Self {
        Self {
            id,
            transform: Instance::new(),
            local: Matrix4::identity(),
            world: Matrix4::identity(),
            normal: Matrix3::identity(),
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn transform(&self) -> &Instance {
        &self.transform
    }

    pub fn local_matrix(&self) -> Matrix4<f32> {
        self.local
    }

    pub fn world_matrix(&self) -> Matrix4<f32> {
        self.world
    }

    pub fn normal_matrix(&self) -> Matrix3<f32> {
        self.normal
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

#[derive(Clone, Debug, Default)]
pub struct SceneGraph {
    nodes: Vec<TransformNode>,
}

impl SceneGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parentless node with identity transform.
    pub fn create_node(&mut self) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(TransformNode::new(id));
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&TransformNode> {
        self.nodes.get(id.0)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TransformNode> {
        self.nodes.iter()
    }

    pub fn set_position(&mut self, id: NodeId, position: Vector3<f32>) {
        self.update_transform(id, |t| t.position = position);
    }

    /// Euler angles in radians.
    pub fn set_rotation(&mut self, id: NodeId, rotation: Vector3<f32>) {
        self.update_transform(id, |t| t.rotation = rotation);
    }

    pub fn set_scale(&mut self, id: NodeId, scale: Vector3<f32>) {
        self.update_transform(id, |t| t.scale = scale);
    }

    pub fn set_transform(&mut self, id: NodeId, transform: Instance) {
        self.update_transform(id, |t| *t = transform);
    }

    fn update_transform(&mut self, id: NodeId, update: impl FnOnce(&mut Instance)) {
        let Some(node) = self.nodes.get_mut(id.0) else {
            warn!("Tried to transform unknown node {:?}", id);
            return;
        };
        update(&mut node.transform);
        node.local = node.transform.to_matrix();
        self.propagate(id);
    }

    /// Moves `id` under `parent` (appended last) or makes it a root.
    ///
    /// Parenting a node into its own subtree would create a cycle; callers
    /// must not do that and debug builds assert on it.
    pub fn set_parent(&mut self, id: NodeId, parent: Option<NodeId>) {
        if self.nodes.get(id.0).is_none() {
            warn!("Tried to reparent unknown node {:?}", id);
            return;
        }
        if let Some(p) = parent {
            if self.nodes.get(p.0).is_none() {
                warn!("Tried to attach {:?} to unknown parent {:?}", id, p);
                return;
            }
            debug_assert!(
                !self.is_ancestor_or_self(id, p),
                "reparenting {:?} under {:?} creates a cycle",
                id,
                p
            );
        }

        if let Some(old) = self.nodes[id.0].parent {
            self.nodes[old.0].children.retain(|child| *child != id);
        }
        self.nodes[id.0].parent = parent;
        if let Some(p) = parent {
            self.nodes[p.0].children.push(id);
        }
        self.propagate(id);
    }

    fn is_ancestor_or_self(&self, ancestor: NodeId, mut node: NodeId) -> bool {
        loop {
            if node == ancestor {
                return true;
            }
            match self.nodes[node.0].parent {
                Some(parent) => node = parent,
                None => return false,
            }
        }
    }

    /// Recomputes world and normal matrices of `root` and its subtree,
    /// parents before children.
    fn propagate(&mut self, root: NodeId) {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id.0];
            let world = match node.parent {
                Some(parent) => self.nodes[parent.0].world * node.local,
                None => node.local,
            };
            let node = &mut self.nodes[id.0];
            node.world = world;
            node.normal = normal_matrix(&world);
            // reversed so children are visited in insertion order
            stack.extend(node.children.iter().rev().copied());
        }
    }

    pub fn local_matrix(&self, id: NodeId) -> Option<Matrix4<f32>> {
        self.node(id).map(TransformNode::local_matrix)
    }

    pub fn world_matrix(&self, id: NodeId) -> Option<Matrix4<f32>> {
        self.node(id).map(TransformNode::world_matrix)
    }

    pub fn normal_matrix(&self, id: NodeId) -> Option<Matrix3<f32>> {
        self.node(id).map(TransformNode::normal_matrix)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).and_then(TransformNode::parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.node(id).map(TransformNode::children).unwrap_or(&[])
    }

    /// Ids of all parentless nodes in creation order.
    pub fn roots(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .filter(|node| node.parent.is_none())
            .map(|node| node.id)
    }
}
