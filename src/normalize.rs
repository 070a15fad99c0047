use crate::geometry::Aabb;
use crate::scene::{NodeId, SceneArena, Transform};
use glam::Vec3;

/// Extents below this are treated as a point: only centering applies.
pub const MIN_EXTENT: f32 = 1e-6;

pub const NORMALIZED_ROOT_NAME: &str = "normalized_root";

/// Uniform scale plus centering offset derived from an aggregate bounding box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NormalizationTransform {
    pub scale_factor: f32,
    pub center_offset: Vec3,
}

impl NormalizationTransform {
    pub const IDENTITY: NormalizationTransform =
        NormalizationTransform { scale_factor: 1.0, center_offset: Vec3::ZERO };

    /// `scale = target / max_extent`, `offset = -center * scale`.
    pub fn from_bounds(bounds: &Aabb, target_size: f32) -> Self {
        if bounds.is_empty() {
            return Self::IDENTITY;
        }
        let max_extent = bounds.size().max_element();
        let scale_factor = if max_extent > MIN_EXTENT { target_size / max_extent } else { 1.0 };
        let center_offset = -bounds.center() * scale_factor;
        Self { scale_factor, center_offset }
    }

    pub fn as_transform(&self) -> Transform {
        Transform::uniform(self.scale_factor, self.center_offset)
    }
}

/// Computes the transform over the whole tree, every submesh included.
pub fn normalize(tree: &SceneArena, target_size: f32) -> NormalizationTransform {
    NormalizationTransform::from_bounds(&tree.aggregate_bounds(), target_size)
}

/// Wraps the tree's roots in a single node carrying the normalization.
/// The loaded nodes keep their own transforms, so the wrapper can be dropped
/// and recomputed later without reparsing.
pub fn apply_normalization(tree: &mut SceneArena, transform: &NormalizationTransform) -> NodeId {
    tree.wrap_roots(NORMALIZED_ROOT_NAME, transform.as_transform())
}
