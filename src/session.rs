//! One mounted viewer: load state machine, scene composition, input and
//! teardown. Everything here runs on the frame thread; the only concurrency is
//! the load worker, whose results are matched against the active token before
//! they touch the scene.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context};
use glam::Vec2;
use winit::dpi::PhysicalSize;

use crate::camera::OrbitController;
use crate::config::{AppConfig, NormalizeConfig, ViewerOptions};
use crate::error::{ViewerError, ViewerResult};
use crate::format;
use crate::geometry::{Aabb, GeometryId, MaterialId};
use crate::load_worker::{LoadJob, LoadMessage, LoadWorker};
use crate::loaders::{LoadError, LoadToken, LoadedAsset};
use crate::normalize::{apply_normalization, normalize, NormalizationTransform};
use crate::render_loop::{DrawBackend, FrameClock, FrameOutcome, RenderLoop};
use crate::scene::{DrawItem, SceneArena};
use crate::source::AssetLocator;

/// What the caller asked to view. Superseded, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetDescriptor {
    pub source_locator: String,
    pub format_hint: Option<String>,
    pub display_name: String,
}

impl AssetDescriptor {
    /// Display name defaults to the last path segment of the locator.
    pub fn new(source_locator: impl Into<String>) -> Self {
        let source_locator = source_locator.into();
        let path = source_locator.split(['?', '#']).next().unwrap_or(&source_locator);
        let display_name = path.rsplit(['/', '\\']).next().unwrap_or(path).to_string();
        Self { source_locator, format_hint: None, display_name }
    }

    pub fn with_format_hint(mut self, hint: impl Into<String>) -> Self {
        self.format_hint = Some(hint.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadStatus {
    Idle,
    Loading(f32),
    Ready,
    Error(String),
    Disposed,
}

impl LoadStatus {
    fn is_stable(&self) -> bool {
        matches!(self, LoadStatus::Idle | LoadStatus::Ready)
    }
}

/// Events on the status stream handed to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewerStatus {
    /// Nothing is shown; emitted when an abandoned first load falls back.
    Idle,
    Loading(f32),
    Ready,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionEvent {
    /// Double-click or other activation gesture on the viewport.
    Activated,
    WireframeToggled { enabled: bool },
    AutoRotateToggled { enabled: bool },
    ViewReset,
}

pub type InteractionHandler = Box<dyn FnMut(InteractionEvent)>;

struct ActiveLoad {
    token: LoadToken,
    descriptor: AssetDescriptor,
}

/// The parsed tree of the current asset, kept un-normalized so the scene can
/// be recomposed without fetching again.
struct CommittedAsset {
    descriptor: AssetDescriptor,
    asset: LoadedAsset,
    normalization: NormalizationTransform,
}

pub struct ViewerSession<B: DrawBackend> {
    options: ViewerOptions,
    normalize: NormalizeConfig,
    backend: B,
    worker: LoadWorker,
    camera: OrbitController,
    render_loop: RenderLoop,
    clock: FrameClock,
    scene: SceneArena,
    draw_list: Vec<DrawItem>,
    committed: Option<CommittedAsset>,
    active: Option<ActiveLoad>,
    status: LoadStatus,
    last_stable: LoadStatus,
    status_events: VecDeque<ViewerStatus>,
    next_generation: u64,
    wireframe: bool,
    interaction: Option<InteractionHandler>,
}

impl<B: DrawBackend> fmt::Debug for ViewerSession<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewerSession")
            .field("status", &self.status)
            .field("nodes", &self.scene.len())
            .field("wireframe", &self.wireframe)
            .finish()
    }
}

impl<B: DrawBackend> ViewerSession<B> {
    pub fn new(config: &AppConfig, backend: B, worker: LoadWorker) -> Self {
        let (width, height) = config.surface_size();
        let size = PhysicalSize::new(width, height);
        let mut camera = OrbitController::new(&config.camera, config.viewer.auto_rotate);
        camera.resize(size);
        Self {
            options: config.viewer.clone(),
            normalize: config.normalize.clone(),
            backend,
            worker,
            camera,
            render_loop: RenderLoop::register(size),
            clock: FrameClock::default(),
            scene: SceneArena::new(),
            draw_list: Vec::new(),
            committed: None,
            active: None,
            status: LoadStatus::Idle,
            last_stable: LoadStatus::Idle,
            status_events: VecDeque::new(),
            next_generation: 1,
            wireframe: false,
            interaction: None,
        }
    }

    pub fn status(&self) -> &LoadStatus {
        &self.status
    }

    pub fn is_disposed(&self) -> bool {
        self.status == LoadStatus::Disposed
    }

    pub fn drain_status(&mut self) -> Vec<ViewerStatus> {
        self.status_events.drain(..).collect()
    }

    pub fn options(&self) -> &ViewerOptions {
        &self.options
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn camera(&self) -> &OrbitController {
        &self.camera
    }

    pub fn scene(&self) -> &SceneArena {
        &self.scene
    }

    pub fn render_loop(&self) -> &RenderLoop {
        &self.render_loop
    }

    pub fn active_generation(&self) -> Option<u64> {
        self.active.as_ref().map(|active| active.token.generation())
    }

    pub fn current_asset(&self) -> Option<&AssetDescriptor> {
        self.committed.as_ref().map(|committed| &committed.descriptor)
    }

    pub fn loaded_asset(&self) -> Option<&LoadedAsset> {
        self.committed.as_ref().map(|committed| &committed.asset)
    }

    pub fn normalization(&self) -> Option<NormalizationTransform> {
        self.committed.as_ref().map(|committed| committed.normalization)
    }

    /// World-space bounds of the composed scene.
    pub fn scene_bounds(&self) -> Aabb {
        self.scene.aggregate_bounds()
    }

    pub fn wireframe(&self) -> bool {
        self.wireframe
    }

    pub fn set_interaction_handler(&mut self, handler: impl FnMut(InteractionEvent) + 'static) {
        self.interaction = Some(Box::new(handler));
    }

    /// Starts loading `descriptor`, superseding any load in flight. Format
    /// dispatch happens first, so an unknown format fails before any I/O.
    pub fn request_asset(&mut self, descriptor: AssetDescriptor) -> ViewerResult<()> {
        if self.is_disposed() {
            log::debug!("[session] request for {} ignored: {}", descriptor.source_locator, ViewerError::DisposalRace);
            return Ok(());
        }
        self.cancel_active();
        let dispatched = format::dispatch(descriptor.format_hint.as_deref(), &descriptor.source_locator);
        let (format, loader) = match dispatched {
            Ok(dispatched) => dispatched,
            Err(err) => {
                log::warn!("[session] {} rejected: {err}", descriptor.source_locator);
                self.fail_request(&err);
                return Err(err);
            }
        };

        let generation = self.next_generation;
        self.next_generation += 1;
        let token = LoadToken::new(generation);
        log::info!(
            "[session] loading '{}' as {} (load #{generation})",
            descriptor.display_name,
            format.label()
        );
        self.set_status(LoadStatus::Loading(0.0));
        self.active = Some(ActiveLoad { token: token.clone(), descriptor: descriptor.clone() });

        let job = LoadJob {
            locator: AssetLocator::parse(&descriptor.source_locator),
            format,
            loader,
            token,
            load_sequence: generation,
        };
        if self.worker.submit(job).is_err() {
            let err = ViewerError::network(&descriptor.source_locator, "load worker unavailable");
            self.active = None;
            self.fail_request(&err);
            return Err(err);
        }
        Ok(())
    }

    /// Convenience for `request_asset` with an optional explicit hint.
    pub fn request(&mut self, locator: &str, format_hint: Option<&str>) -> ViewerResult<()> {
        let mut descriptor = AssetDescriptor::new(locator);
        descriptor.format_hint = format_hint.map(str::to_string);
        self.request_asset(descriptor)
    }

    /// Abandons the active load. Status falls back to the last stable value.
    pub fn cancel_load(&mut self) {
        if self.active.is_none() {
            return;
        }
        self.cancel_active();
        self.restore_stable_status();
    }

    /// Applies finished loads and progress from the worker. Anything tagged
    /// with a token other than the active one is dropped.
    pub fn poll(&mut self) {
        for message in self.worker.drain() {
            if self.is_disposed() {
                log::debug!("[session] load #{} result after dispose dropped", message.generation());
                continue;
            }
            let is_active = self
                .active
                .as_ref()
                .is_some_and(|active| active.token.generation() == message.generation() && !active.token.is_cancelled());
            if !is_active {
                log::debug!("[session] stale message for load #{} dropped", message.generation());
                continue;
            }
            match message {
                LoadMessage::Progress { fraction, .. } => {
                    if let LoadStatus::Loading(current) = self.status {
                        if fraction > current {
                            self.set_status(LoadStatus::Loading(fraction));
                        }
                    }
                }
                LoadMessage::Finished { result, .. } => {
                    let Some(active) = self.active.take() else {
                        continue;
                    };
                    match result {
                        Ok(asset) => self.commit(active.descriptor, asset),
                        Err(LoadError::Cancelled) => self.restore_stable_status(),
                        Err(LoadError::Failed(err)) => self.fail_request(&err),
                    }
                }
            }
        }
    }

    fn commit(&mut self, descriptor: AssetDescriptor, asset: LoadedAsset) {
        if !asset.skipped.is_empty() {
            log::warn!("[session] '{}' loaded with {} part(s) skipped", descriptor.display_name, asset.skipped.len());
        }
        self.install(descriptor, asset);
        self.camera.reset();
        self.set_status(LoadStatus::Ready);
    }

    /// Normalizes and composes a parsed tree. Status and camera are untouched.
    fn install(&mut self, descriptor: AssetDescriptor, asset: LoadedAsset) {
        let normalization = normalize(&asset.tree, self.normalize.target_size);
        let mut tree = asset.tree.clone();
        apply_normalization(&mut tree, &normalization);
        log::info!(
            "[session] '{}' ready: scale {:.4}, offset {:?}",
            descriptor.display_name,
            normalization.scale_factor,
            normalization.center_offset
        );
        self.compose(tree);
        self.committed = Some(CommittedAsset { descriptor, asset, normalization });
    }

    /// Swaps the scene in one step and releases whatever the old scene held
    /// that the new one does not share.
    fn compose(&mut self, tree: SceneArena) {
        for material in tree.materials() {
            material.set_wireframe(self.wireframe);
            material.mark_dirty();
        }
        let draw_list = tree.draw_items();
        let old = std::mem::replace(&mut self.scene, tree);
        self.draw_list = draw_list;

        let (keep_geometry, keep_materials) = resource_ids(&self.scene);
        let (old_geometry, old_materials) = resource_ids(&old);
        for id in old_geometry.difference(&keep_geometry) {
            self.backend.release_geometry(*id);
        }
        for id in old_materials.difference(&keep_materials) {
            self.backend.release_material(*id);
        }
    }

    /// Draws one frame with the wall-clock delta.
    pub fn frame(&mut self) -> ViewerResult<FrameOutcome> {
        let dt = self.clock.delta_seconds();
        self.advance(dt)
    }

    /// Draws one frame with an explicit delta. While loading the previous
    /// scene stays up; after an error only the background is drawn.
    pub fn advance(&mut self, dt_seconds: f32) -> ViewerResult<FrameOutcome> {
        if self.is_disposed() {
            return Ok(FrameOutcome::Skipped);
        }
        let items: &[DrawItem] = match self.status {
            LoadStatus::Ready | LoadStatus::Loading(_) => &self.draw_list,
            _ => &[],
        };
        let result =
            self.render_loop.tick(dt_seconds, &mut self.camera, items, self.options.background_color, &mut self.backend);
        if let Err(err) = &result {
            log::warn!("[session] frame failed: {err}");
        }
        result
    }

    pub fn resize(&mut self, size: PhysicalSize<u32>) {
        if self.is_disposed() {
            return;
        }
        self.render_loop.resize(size, &mut self.camera, &mut self.backend);
    }

    /// Re-acquires the drawing context, then rebuilds the scene from the
    /// already-parsed tree. Status is left as it was, so a load in flight
    /// keeps its progress and a failed request stays failed.
    pub fn recover_render_context(&mut self) -> ViewerResult<()> {
        if self.is_disposed() {
            log::debug!("[session] recovery skipped: {}", ViewerError::DisposalRace);
            return Ok(());
        }
        if let Err(err) = self.backend.reacquire() {
            self.set_error(&err);
            return Err(err);
        }
        if matches!(self.status, LoadStatus::Error(_)) {
            return Ok(());
        }
        let Some(committed) = self.committed.take() else {
            return Ok(());
        };
        log::info!("[session] render context recovered; recomposing '{}'", committed.descriptor.display_name);
        self.install(committed.descriptor, committed.asset);
        Ok(())
    }

    pub fn set_wireframe(&mut self, enabled: bool) {
        if self.is_disposed() {
            return;
        }
        self.wireframe = enabled;
        for material in self.scene.materials() {
            material.set_wireframe(enabled);
        }
    }

    pub fn toggle_wireframe(&mut self) -> bool {
        let enabled = !self.wireframe;
        self.set_wireframe(enabled);
        self.emit(InteractionEvent::WireframeToggled { enabled });
        enabled
    }

    pub fn set_auto_rotate(&mut self, enabled: bool) {
        self.camera.auto_rotate = enabled;
    }

    pub fn toggle_auto_rotate(&mut self) -> bool {
        let enabled = !self.camera.auto_rotate;
        self.set_auto_rotate(enabled);
        self.emit(InteractionEvent::AutoRotateToggled { enabled });
        enabled
    }

    pub fn pointer_drag(&mut self, delta: Vec2) {
        self.camera.pointer_drag(delta);
    }

    pub fn scroll(&mut self, delta: f32) {
        self.camera.scroll(delta);
    }

    pub fn reset_view(&mut self) {
        self.camera.reset();
        self.emit(InteractionEvent::ViewReset);
    }

    pub fn activate(&mut self) {
        self.emit(InteractionEvent::Activated);
    }

    fn emit(&mut self, event: InteractionEvent) {
        if self.is_disposed() {
            return;
        }
        if let Some(handler) = self.interaction.as_mut() {
            handler(event);
        }
    }

    /// Writes the original bytes of the current asset to `dest`.
    pub fn export_source(&self, dest: impl AsRef<Path>) -> anyhow::Result<()> {
        if self.options.prevent_download {
            bail!("downloads are disabled for this viewer");
        }
        let committed = self.committed.as_ref().context("no asset loaded")?;
        let bytes = committed.asset.source_bytes.as_deref().context("asset has no source bytes to export")?;
        let dest = dest.as_ref();
        fs::write(dest, bytes).with_context(|| format!("failed to write {}", dest.display()))?;
        log::info!("[session] exported '{}' to {}", committed.descriptor.display_name, dest.display());
        Ok(())
    }

    /// Tears the session down: cancel the load, stop frames, then release GPU
    /// resources. A second call does nothing.
    pub fn dispose(&mut self) {
        if self.is_disposed() {
            log::debug!("[session] dispose: {}", ViewerError::DisposalRace);
            return;
        }
        self.cancel_active();
        self.render_loop.deregister();
        let (geometry, materials) = resource_ids(&self.scene);
        for id in geometry {
            self.backend.release_geometry(id);
        }
        for id in materials {
            self.backend.release_material(id);
        }
        self.draw_list.clear();
        self.scene.clear();
        self.committed = None;
        self.interaction = None;
        self.status_events.clear();
        self.status = LoadStatus::Disposed;
        log::info!("[session] disposed");
    }

    fn cancel_active(&mut self) {
        if let Some(active) = self.active.take() {
            active.token.cancel();
            log::debug!(
                "[session] load #{} for {} cancelled",
                active.token.generation(),
                active.descriptor.source_locator
            );
        }
    }

    fn restore_stable_status(&mut self) {
        let stable = self.last_stable.clone();
        self.status = stable.clone();
        match stable {
            LoadStatus::Ready => self.status_events.push_back(ViewerStatus::Ready),
            LoadStatus::Idle => self.status_events.push_back(ViewerStatus::Idle),
            _ => {}
        }
    }

    /// A request that fails supersedes whatever was shown before it.
    fn fail_request(&mut self, err: &ViewerError) {
        self.committed = None;
        self.set_error(err);
    }

    fn set_error(&mut self, err: &ViewerError) {
        self.set_status(LoadStatus::Error(err.to_string()));
    }

    fn set_status(&mut self, status: LoadStatus) {
        let event = match &status {
            LoadStatus::Loading(fraction) => Some(ViewerStatus::Loading(*fraction)),
            LoadStatus::Ready => Some(ViewerStatus::Ready),
            LoadStatus::Error(message) => Some(ViewerStatus::Error(message.clone())),
            LoadStatus::Idle | LoadStatus::Disposed => None,
        };
        if status.is_stable() {
            self.last_stable = status.clone();
        }
        if let LoadStatus::Error(_) = status {
            // An error leaves nothing to fall back to.
            self.last_stable = LoadStatus::Idle;
        }
        self.status = status;
        if let Some(event) = event {
            self.status_events.push_back(event);
        }
    }
}

impl<B: DrawBackend> Drop for ViewerSession<B> {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn resource_ids(scene: &SceneArena) -> (HashSet<GeometryId>, HashSet<MaterialId>) {
    let geometry = scene.nodes().filter_map(|(_, node)| node.geometry.as_ref()).map(|g| g.id()).collect();
    let materials = scene.materials().iter().map(|m| m.id()).collect();
    (geometry, materials)
}
