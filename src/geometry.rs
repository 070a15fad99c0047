use glam::{Vec2, Vec3};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Used for STL meshes, which never carry usable color data.
pub const STL_DEFAULT_COLOR: [f32; 4] = [0.55, 0.62, 0.78, 1.0];
pub const PLACEHOLDER_COLOR: [f32; 4] = [0.62, 0.62, 0.66, 1.0];

static NEXT_GEOMETRY_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_MATERIAL_ID: AtomicU64 = AtomicU64::new(1);

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MeshVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

impl MeshVertex {
    pub fn new(position: Vec3, normal: Vec3, uv: Vec2) -> Self {
        Self { position: position.to_array(), normal: normal.to_array(), uv: uv.to_array() }
    }

    pub fn layout<'a>() -> wgpu::VertexBufferLayout<'a> {
        const ATTRIBUTES: [wgpu::VertexAttribute; 3] =
            wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x3, 2 => Float32x2];
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<MeshVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &ATTRIBUTES,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeometryId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialId(u64);

impl GeometryId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl MaterialId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Axis-aligned bounds. An empty box has `min > max` on every axis.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub const EMPTY: Aabb = Aabb { min: Vec3::splat(f32::INFINITY), max: Vec3::splat(f32::NEG_INFINITY) };

    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        let mut aabb = Aabb::EMPTY;
        for point in points {
            aabb.include_point(point);
        }
        aabb
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    pub fn include_point(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb { min: self.min.min(other.min), max: self.max.max(other.max) }
    }

    pub fn size(&self) -> Vec3 {
        if self.is_empty() {
            Vec3::ZERO
        } else {
            self.max - self.min
        }
    }

    pub fn center(&self) -> Vec3 {
        if self.is_empty() {
            Vec3::ZERO
        } else {
            (self.min + self.max) * 0.5
        }
    }

    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(a.x, b.y, b.z),
            Vec3::new(b.x, b.y, b.z),
        ]
    }
}

/// Immutable vertex/index data. Shared between nodes through [`GeometryHandle`].
#[derive(Debug)]
pub struct Geometry {
    id: GeometryId,
    vertices: Vec<MeshVertex>,
    indices: Vec<u32>,
    bounds: Aabb,
}

pub type GeometryHandle = Arc<Geometry>;

impl Geometry {
    /// Builds a triangle list. Missing normals (`None` or wrong length) are
    /// recomputed from the faces; missing UVs default to zero.
    pub fn new(
        positions: Vec<Vec3>,
        normals: Option<Vec<Vec3>>,
        uvs: Option<Vec<Vec2>>,
        indices: Vec<u32>,
    ) -> Self {
        let normals = match normals {
            Some(normals)
                if normals.len() == positions.len() && normals.iter().any(|n| n.length_squared() > 0.0) =>
            {
                normals
            }
            _ => compute_normals(&positions, &indices),
        };
        let uvs = uvs.filter(|uvs| uvs.len() == positions.len());
        let vertices = positions
            .iter()
            .enumerate()
            .map(|(i, pos)| {
                let normal = normals.get(i).copied().unwrap_or(Vec3::Y).normalize_or_zero();
                let uv = uvs.as_ref().and_then(|uvs| uvs.get(i)).copied().unwrap_or(Vec2::ZERO);
                MeshVertex::new(*pos, normal, uv)
            })
            .collect();
        let bounds = Aabb::from_points(positions.iter().copied());
        Self { id: GeometryId(NEXT_GEOMETRY_ID.fetch_add(1, Ordering::Relaxed)), vertices, indices, bounds }
    }

    pub fn into_handle(self) -> GeometryHandle {
        Arc::new(self)
    }

    pub fn id(&self) -> GeometryId {
        self.id
    }

    pub fn vertices(&self) -> &[MeshVertex] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn positions(&self) -> impl Iterator<Item = Vec3> + '_ {
        self.vertices.iter().map(|v| Vec3::from_array(v.position))
    }

    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    pub fn is_renderable(&self) -> bool {
        !self.vertices.is_empty() && self.indices.len() >= 3
    }

    /// Edge list for wireframe drawing; each triangle contributes its three edges.
    pub fn wireframe_indices(&self) -> Vec<u32> {
        let mut lines = Vec::with_capacity(self.indices.len() * 2);
        for tri in self.indices.chunks_exact(3) {
            lines.extend_from_slice(&[tri[0], tri[1], tri[1], tri[2], tri[2], tri[0]]);
        }
        lines
    }

    /// Axis-aligned cube centered on the origin; used for placeholder glyphs.
    pub fn cube(size: f32) -> Self {
        let hs = size * 0.5;
        let corners = [
            Vec3::new(-hs, -hs, -hs),
            Vec3::new(hs, -hs, -hs),
            Vec3::new(hs, hs, -hs),
            Vec3::new(-hs, hs, -hs),
            Vec3::new(-hs, -hs, hs),
            Vec3::new(hs, -hs, hs),
            Vec3::new(hs, hs, hs),
            Vec3::new(-hs, hs, hs),
        ];
        let faces: [([usize; 4], Vec3); 6] = [
            ([0, 3, 2, 1], Vec3::NEG_Z),
            ([4, 5, 6, 7], Vec3::Z),
            ([0, 4, 7, 3], Vec3::NEG_X),
            ([1, 2, 6, 5], Vec3::X),
            ([3, 7, 6, 2], Vec3::Y),
            ([0, 1, 5, 4], Vec3::NEG_Y),
        ];
        let quad_uv = [Vec2::new(0.0, 0.0), Vec2::new(1.0, 0.0), Vec2::new(1.0, 1.0), Vec2::new(0.0, 1.0)];
        let mut positions = Vec::with_capacity(24);
        let mut normals = Vec::with_capacity(24);
        let mut uvs = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (face, normal) in faces {
            let base = positions.len() as u32;
            for (corner, uv) in face.iter().zip(quad_uv) {
                positions.push(corners[*corner]);
                normals.push(normal);
                uvs.push(uv);
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        Self::new(positions, Some(normals), Some(uvs), indices)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Material {
    pub label: String,
    pub base_color: [f32; 4],
    pub double_sided: bool,
    wireframe: bool,
    dirty: bool,
}

impl Material {
    pub fn new(label: impl Into<String>, base_color: [f32; 4]) -> Self {
        Self { label: label.into(), base_color, double_sided: false, wireframe: false, dirty: true }
    }

    pub fn double_sided(mut self, enabled: bool) -> Self {
        self.double_sided = enabled;
        self
    }

    pub fn wireframe(&self) -> bool {
        self.wireframe
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Shared, mutable material. Cloning the handle shares the same material.
#[derive(Clone, Debug)]
pub struct MaterialHandle {
    id: MaterialId,
    inner: Arc<RwLock<Material>>,
}

impl MaterialHandle {
    pub fn new(material: Material) -> Self {
        Self {
            id: MaterialId(NEXT_MATERIAL_ID.fetch_add(1, Ordering::Relaxed)),
            inner: Arc::new(RwLock::new(material)),
        }
    }

    pub fn id(&self) -> MaterialId {
        self.id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Material> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Material> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn wireframe(&self) -> bool {
        self.read().wireframe
    }

    /// Sets the wireframe flag in place and marks the material for GPU re-sync.
    pub fn set_wireframe(&self, enabled: bool) {
        let mut material = self.write();
        if material.wireframe != enabled {
            material.wireframe = enabled;
            material.dirty = true;
        }
    }

    pub fn set_base_color(&self, color: [f32; 4]) {
        let mut material = self.write();
        material.base_color = color;
        material.dirty = true;
    }

    /// Returns a snapshot if the material changed since the last call.
    pub fn take_dirty(&self) -> Option<Material> {
        let mut material = self.write();
        if !material.dirty {
            return None;
        }
        material.dirty = false;
        Some(material.clone())
    }

    pub fn mark_dirty(&self) {
        self.write().dirty = true;
    }

    pub fn snapshot(&self) -> Material {
        self.read().clone()
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

/// Deterministic color for sources without color data. The same load sequence
/// and slot always map to the same color.
pub fn default_base_color(load_sequence: u64, slot: u32) -> [f32; 4] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&load_sequence.to_le_bytes());
    hasher.update(&slot.to_le_bytes());
    let digest = hasher.finalize();
    let bytes = digest.as_bytes();
    let hue = u16::from_le_bytes([bytes[0], bytes[1]]) as f32 / u16::MAX as f32;
    let saturation = 0.35 + (bytes[2] as f32 / 255.0) * 0.2;
    let value = 0.75 + (bytes[3] as f32 / 255.0) * 0.15;
    let [r, g, b] = hsv_to_rgb(hue, saturation, value);
    [r, g, b, 1.0]
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> [f32; 3] {
    let h6 = (h.fract() * 6.0).max(0.0);
    let sector = h6.floor() as u32 % 6;
    let f = h6 - h6.floor();
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    match sector {
        0 => [v, t, p],
        1 => [q, v, p],
        2 => [p, v, t],
        3 => [p, q, v],
        4 => [t, p, v],
        _ => [v, p, q],
    }
}

pub(crate) fn compute_normals(positions: &[Vec3], indices: &[u32]) -> Vec<Vec3> {
    let mut normals = vec![Vec3::ZERO; positions.len()];
    for tri in indices.chunks_exact(3) {
        let (i0, i1, i2) = (tri[0] as usize, tri[1] as usize, tri[2] as usize);
        if i0 >= positions.len() || i1 >= positions.len() || i2 >= positions.len() {
            continue;
        }
        let normal = (positions[i1] - positions[i0]).cross(positions[i2] - positions[i0]);
        if normal.length_squared() > 0.0 {
            normals[i0] += normal;
            normals[i1] += normal;
            normals[i2] += normal;
        }
    }
    for normal in &mut normals {
        *normal = if normal.length_squared() > 0.0 { normal.normalize() } else { Vec3::Y };
    }
    normals
}
