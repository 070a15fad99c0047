//! Node arena for loaded assets.
//!
//! Nodes live in a flat `Vec` and reference each other by [`NodeId`]. Children
//! are index lists and the parent link is a plain lookup, so a tree can never
//! form a cycle and tearing it down is a single `clear`.

use crate::geometry::{Aabb, GeometryHandle, MaterialHandle};
use glam::{Mat4, Quat, Vec3};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Transform = Transform { translation: Vec3::ZERO, rotation: Quat::IDENTITY, scale: Vec3::ONE };

    pub fn from_translation(translation: Vec3) -> Self {
        Self { translation, ..Self::IDENTITY }
    }

    pub fn from_matrix(matrix: Mat4) -> Self {
        let (scale, rotation, translation) = matrix.to_scale_rotation_translation();
        Self { translation, rotation, scale }
    }

    pub fn uniform(scale: f32, translation: Vec3) -> Self {
        Self { translation, rotation: Quat::IDENTITY, scale: Vec3::splat(scale) }
    }

    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }
}

#[derive(Clone, Debug)]
pub struct SceneNode {
    pub name: Option<String>,
    pub transform: Transform,
    pub geometry: Option<GeometryHandle>,
    pub material: Option<MaterialHandle>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl SceneNode {
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn is_renderable(&self) -> bool {
        self.geometry.as_ref().is_some_and(|geometry| geometry.is_renderable())
    }
}

/// A renderable node flattened with its world matrix.
#[derive(Clone, Debug)]
pub struct DrawItem {
    pub node: NodeId,
    pub world: Mat4,
    pub geometry: GeometryHandle,
    pub material: MaterialHandle,
}

#[derive(Clone, Debug, Default)]
pub struct SceneArena {
    nodes: Vec<SceneNode>,
    roots: Vec<NodeId>,
}

impl SceneArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn node(&self, id: NodeId) -> Option<&SceneNode> {
        self.nodes.get(id.index())
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut SceneNode> {
        self.nodes.get_mut(id.index())
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &SceneNode)> {
        self.nodes.iter().enumerate().map(|(i, node)| (NodeId(i as u32), node))
    }

    /// Adds a node under `parent`, or as a new root when `parent` is `None`.
    /// An unknown parent id also makes the node a root.
    pub fn add_node(&mut self, parent: Option<NodeId>, name: Option<String>, transform: Transform) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        let parent = parent.filter(|p| p.index() < self.nodes.len());
        self.nodes.push(SceneNode { name, transform, geometry: None, material: None, parent, children: Vec::new() });
        match parent {
            Some(parent_id) => self.nodes[parent_id.index()].children.push(id),
            None => self.roots.push(id),
        }
        id
    }

    pub fn add_mesh_node(
        &mut self,
        parent: Option<NodeId>,
        name: Option<String>,
        transform: Transform,
        geometry: GeometryHandle,
        material: MaterialHandle,
    ) -> NodeId {
        let id = self.add_node(parent, name, transform);
        let node = &mut self.nodes[id.index()];
        node.geometry = Some(geometry);
        node.material = Some(material);
        id
    }

    /// Moves every current root under a fresh root node carrying `transform`.
    /// Returns the new root. Leaf geometry is left untouched.
    pub fn wrap_roots(&mut self, name: impl Into<String>, transform: Transform) -> NodeId {
        let previous_roots = std::mem::take(&mut self.roots);
        let wrapper = self.add_node(None, Some(name.into()), transform);
        for root in &previous_roots {
            self.nodes[root.index()].parent = Some(wrapper);
        }
        self.nodes[wrapper.index()].children = previous_roots;
        wrapper
    }

    /// Depth-first walk with accumulated world matrices, parents before children.
    pub fn visit_world(&self, mut visit: impl FnMut(NodeId, &SceneNode, Mat4)) {
        let mut stack: Vec<(NodeId, Mat4)> = self.roots.iter().rev().map(|id| (*id, Mat4::IDENTITY)).collect();
        while let Some((id, parent_world)) = stack.pop() {
            let Some(node) = self.nodes.get(id.index()) else {
                continue;
            };
            let world = parent_world * node.transform.matrix();
            visit(id, node, world);
            for child in node.children.iter().rev() {
                stack.push((*child, world));
            }
        }
    }

    pub fn world_matrix(&self, id: NodeId) -> Option<Mat4> {
        let mut matrix = self.node(id)?.transform.matrix();
        let mut cursor = self.node(id)?.parent;
        while let Some(parent) = cursor {
            let node = self.node(parent)?;
            matrix = node.transform.matrix() * matrix;
            cursor = node.parent;
        }
        Some(matrix)
    }

    /// World-space bounds over every geometry in the tree.
    pub fn aggregate_bounds(&self) -> Aabb {
        let mut bounds = Aabb::EMPTY;
        self.visit_world(|_, node, world| {
            if let Some(geometry) = node.geometry.as_ref() {
                let local = geometry.bounds();
                if local.is_empty() {
                    return;
                }
                if is_axis_aligned(world) {
                    for corner in local.corners() {
                        bounds.include_point(world.transform_point3(corner));
                    }
                } else {
                    for position in geometry.positions() {
                        bounds.include_point(world.transform_point3(position));
                    }
                }
            }
        });
        bounds
    }

    pub fn draw_items(&self) -> Vec<DrawItem> {
        let mut items = Vec::new();
        self.visit_world(|id, node, world| {
            if let (Some(geometry), Some(material)) = (node.geometry.as_ref(), node.material.as_ref()) {
                if geometry.is_renderable() {
                    items.push(DrawItem { node: id, world, geometry: geometry.clone(), material: material.clone() });
                }
            }
        });
        items
    }

    pub fn renderable_count(&self) -> usize {
        self.nodes.iter().filter(|node| node.is_renderable()).count()
    }

    pub fn vertex_count(&self) -> usize {
        self.nodes.iter().filter_map(|node| node.geometry.as_ref()).map(|g| g.vertex_count()).sum()
    }

    pub fn index_count(&self) -> usize {
        self.nodes.iter().filter_map(|node| node.geometry.as_ref()).map(|g| g.index_count()).sum()
    }

    /// Distinct materials referenced by the tree.
    pub fn materials(&self) -> Vec<MaterialHandle> {
        let mut seen = std::collections::HashSet::new();
        self.nodes
            .iter()
            .filter_map(|node| node.material.as_ref())
            .filter(|material| seen.insert(material.id()))
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.roots.clear();
    }
}

/// Axis-aligned transforms map a box's corners onto the transformed box, so
/// corners suffice; anything with rotation needs every vertex.
fn is_axis_aligned(matrix: Mat4) -> bool {
    let cols = [matrix.x_axis, matrix.y_axis, matrix.z_axis];
    cols.iter().all(|col| {
        let nonzero = [col.x, col.y, col.z].iter().filter(|v| v.abs() > 1e-7).count();
        nonzero <= 1
    })
}
