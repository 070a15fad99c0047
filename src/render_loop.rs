//! Per-session frame driver. The loop only draws while it holds a
//! [`FrameRegistration`]; dropping the registration is how a session stops
//! producing frames before its GPU resources go away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use glam::{Mat4, Vec3};
use winit::dpi::PhysicalSize;

use crate::camera::OrbitController;
use crate::error::ViewerResult;
use crate::geometry::{GeometryId, MaterialId};
use crate::scene::DrawItem;

static NEXT_REGISTRATION: AtomicU64 = AtomicU64::new(1);
/// Longest frame delta fed to the camera; a stalled window should not fling it.
const MAX_FRAME_SECONDS: f32 = 0.1;

/// Proof that a session owns a frame callback. Not `Clone`: there is exactly
/// one per session.
#[derive(Debug, PartialEq, Eq)]
pub struct FrameRegistration {
    id: u64,
}

impl FrameRegistration {
    fn new() -> Self {
        Self { id: NEXT_REGISTRATION.fetch_add(1, Ordering::Relaxed) }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Ambient plus a key and a fill directional light. Fixed for every asset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightingRig {
    pub ambient: [f32; 3],
    pub key_direction: Vec3,
    pub key_color: [f32; 3],
    pub fill_direction: Vec3,
    pub fill_color: [f32; 3],
}

impl Default for LightingRig {
    fn default() -> Self {
        Self {
            ambient: [0.28, 0.28, 0.32],
            key_direction: Vec3::new(-0.5, -1.0, -0.6).normalize(),
            key_color: [0.95, 0.92, 0.86],
            fill_direction: Vec3::new(0.7, -0.3, 0.8).normalize(),
            fill_color: [0.30, 0.34, 0.42],
        }
    }
}

pub struct FrameInput<'a> {
    pub view_proj: Mat4,
    pub camera_position: Vec3,
    pub items: &'a [DrawItem],
    pub background: [f32; 4],
    pub lighting: LightingRig,
}

/// What the render loop draws with. The wgpu renderer is one implementation;
/// [`RecordingBackend`] is another that needs no GPU.
pub trait DrawBackend {
    /// Issues one frame. Buffers for new geometry are uploaded lazily and
    /// dirty materials are re-synced before drawing.
    fn draw_frame(&mut self, frame: &FrameInput<'_>) -> ViewerResult<()>;
    fn release_geometry(&mut self, geometry: GeometryId);
    fn release_material(&mut self, material: MaterialId);
    fn resize(&mut self, size: PhysicalSize<u32>);
    /// Re-creates the drawing context after `RenderContextLost`. Every cached
    /// GPU resource is gone afterwards.
    fn reacquire(&mut self) -> ViewerResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// No registration; nothing ran.
    Skipped,
    Drawn { items: usize },
}

#[derive(Debug, Default)]
pub struct FrameClock {
    last: Option<Instant>,
}

impl FrameClock {
    /// Seconds since the previous call, clamped; zero on the first call.
    pub fn delta_seconds(&mut self) -> f32 {
        let now = Instant::now();
        let delta = self.last.map(|last| now.duration_since(last).as_secs_f32()).unwrap_or(0.0);
        self.last = Some(now);
        delta.min(MAX_FRAME_SECONDS)
    }
}

pub struct RenderLoop {
    registration: Option<FrameRegistration>,
    size: PhysicalSize<u32>,
    frames_drawn: u64,
}

impl RenderLoop {
    pub fn register(size: PhysicalSize<u32>) -> Self {
        let registration = FrameRegistration::new();
        log::debug!("[render] frame callback #{} registered", registration.id());
        Self { registration: Some(registration), size, frames_drawn: 0 }
    }

    pub fn is_registered(&self) -> bool {
        self.registration.is_some()
    }

    pub fn frames_drawn(&self) -> u64 {
        self.frames_drawn
    }

    pub fn size(&self) -> PhysicalSize<u32> {
        self.size
    }

    /// Returns the registration the first time; later calls return `None`.
    pub fn deregister(&mut self) -> Option<FrameRegistration> {
        let registration = self.registration.take();
        if let Some(registration) = &registration {
            log::debug!("[render] frame callback #{} deregistered", registration.id());
        }
        registration
    }

    /// One iteration: advance the camera, then issue one draw.
    pub fn tick<B: DrawBackend + ?Sized>(
        &mut self,
        dt_seconds: f32,
        camera: &mut OrbitController,
        items: &[DrawItem],
        background: [f32; 4],
        backend: &mut B,
    ) -> ViewerResult<FrameOutcome> {
        if self.registration.is_none() {
            return Ok(FrameOutcome::Skipped);
        }
        camera.update(dt_seconds.clamp(0.0, MAX_FRAME_SECONDS));
        let frame = FrameInput {
            view_proj: camera.view_projection(),
            camera_position: camera.camera().position,
            items,
            background,
            lighting: LightingRig::default(),
        };
        backend.draw_frame(&frame)?;
        self.frames_drawn += 1;
        Ok(FrameOutcome::Drawn { items: items.len() })
    }

    /// Projection follows the new size immediately; the loop keeps running.
    pub fn resize<B: DrawBackend + ?Sized>(
        &mut self,
        size: PhysicalSize<u32>,
        camera: &mut OrbitController,
        backend: &mut B,
    ) {
        if size.width == 0 || size.height == 0 {
            return;
        }
        self.size = size;
        camera.resize(size);
        backend.resize(size);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Draw { items: usize, wireframe_items: usize },
    ReleaseGeometry(GeometryId),
    ReleaseMaterial(MaterialId),
    Resize(PhysicalSize<u32>),
    Reacquire,
}

/// Records every call instead of touching a GPU. Mirrors the wgpu backend's
/// bookkeeping: geometry becomes resident on first draw and is released once.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    pub calls: Vec<BackendCall>,
    resident: HashMap<GeometryId, usize>,
    material_syncs: HashMap<MaterialId, usize>,
    /// Makes the next `draw_frame` fail with `RenderContextLost`.
    pub lose_context_next_frame: bool,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn draw_count(&self) -> usize {
        self.calls.iter().filter(|c| matches!(c, BackendCall::Draw { .. })).count()
    }

    pub fn last_draw(&self) -> Option<&BackendCall> {
        self.calls.iter().rev().find(|c| matches!(c, BackendCall::Draw { .. }))
    }

    pub fn geometry_release_count(&self, id: GeometryId) -> usize {
        self.calls.iter().filter(|c| **c == BackendCall::ReleaseGeometry(id)).count()
    }

    pub fn released_geometry(&self) -> Vec<GeometryId> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                BackendCall::ReleaseGeometry(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn resident_geometry(&self) -> usize {
        self.resident.len()
    }

    /// How often a material's uniform was re-synced.
    pub fn material_sync_count(&self, id: MaterialId) -> usize {
        self.material_syncs.get(&id).copied().unwrap_or(0)
    }
}

impl DrawBackend for RecordingBackend {
    fn draw_frame(&mut self, frame: &FrameInput<'_>) -> ViewerResult<()> {
        if std::mem::take(&mut self.lose_context_next_frame) {
            self.resident.clear();
            return Err(crate::error::ViewerError::RenderContextLost("surface lost".into()));
        }
        let mut wireframe_items = 0;
        for item in frame.items {
            *self.resident.entry(item.geometry.id()).or_default() += 1;
            if item.material.take_dirty().is_some() {
                *self.material_syncs.entry(item.material.id()).or_default() += 1;
            }
            if item.material.wireframe() {
                wireframe_items += 1;
            }
        }
        self.calls.push(BackendCall::Draw { items: frame.items.len(), wireframe_items });
        Ok(())
    }

    fn release_geometry(&mut self, geometry: GeometryId) {
        self.resident.remove(&geometry);
        self.calls.push(BackendCall::ReleaseGeometry(geometry));
    }

    fn release_material(&mut self, material: MaterialId) {
        self.calls.push(BackendCall::ReleaseMaterial(material));
    }

    fn resize(&mut self, size: PhysicalSize<u32>) {
        self.calls.push(BackendCall::Resize(size));
    }

    fn reacquire(&mut self) -> ViewerResult<()> {
        self.resident.clear();
        self.calls.push(BackendCall::Reacquire);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CameraConfig;
    use crate::geometry::{Geometry, Material, MaterialHandle};
    use crate::scene::{SceneArena, Transform};

    fn one_item() -> Vec<DrawItem> {
        let mut tree = SceneArena::new();
        let geometry = Geometry::cube(1.0).into_handle();
        let material = MaterialHandle::new(Material::new("m", [1.0; 4]));
        tree.add_mesh_node(None, None, Transform::IDENTITY, geometry, material);
        tree.draw_items()
    }

    #[test]
    fn deregistered_loop_never_draws() {
        let mut render_loop = RenderLoop::register(PhysicalSize::new(640, 480));
        let mut camera = OrbitController::new(&CameraConfig::default(), false);
        let mut backend = RecordingBackend::new();
        let items = one_item();
        let outcome = render_loop.tick(0.016, &mut camera, &items, [0.0; 4], &mut backend).expect("frame");
        assert_eq!(outcome, FrameOutcome::Drawn { items: 1 });
        assert!(render_loop.deregister().is_some());
        assert!(render_loop.deregister().is_none());
        let outcome = render_loop.tick(0.016, &mut camera, &items, [0.0; 4], &mut backend).expect("frame");
        assert_eq!(outcome, FrameOutcome::Skipped);
        assert_eq!(backend.draw_count(), 1);
    }

    #[test]
    fn resize_updates_projection_without_stopping() {
        let mut render_loop = RenderLoop::register(PhysicalSize::new(640, 480));
        let mut camera = OrbitController::new(&CameraConfig::default(), false);
        let mut backend = RecordingBackend::new();
        render_loop.resize(PhysicalSize::new(1600, 400), &mut camera, &mut backend);
        assert!((camera.aspect() - 4.0).abs() < 1e-6);
        assert!(render_loop.is_registered());
        render_loop.resize(PhysicalSize::new(0, 0), &mut camera, &mut backend);
        assert_eq!(render_loop.size(), PhysicalSize::new(1600, 400));
        assert_eq!(backend.calls, vec![BackendCall::Resize(PhysicalSize::new(1600, 400))]);
    }

    #[test]
    fn dirty_material_is_synced_once() {
        let mut render_loop = RenderLoop::register(PhysicalSize::new(640, 480));
        let mut camera = OrbitController::new(&CameraConfig::default(), false);
        let mut backend = RecordingBackend::new();
        let items = one_item();
        let id = items[0].material.id();
        for _ in 0..3 {
            render_loop.tick(0.016, &mut camera, &items, [0.0; 4], &mut backend).expect("frame");
        }
        assert_eq!(backend.material_sync_count(id), 1);
        items[0].material.set_wireframe(true);
        render_loop.tick(0.016, &mut camera, &items, [0.0; 4], &mut backend).expect("frame");
        assert_eq!(backend.material_sync_count(id), 2);
        assert_eq!(backend.last_draw(), Some(&BackendCall::Draw { items: 1, wireframe_items: 1 }));
    }
}
