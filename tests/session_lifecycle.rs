mod common;

use asset_viewer::config::AppConfig;
use asset_viewer::error::ViewerError;
use asset_viewer::load_worker::LoadWorker;
use asset_viewer::loaders::{LoadError, LoadToken};
use asset_viewer::render_loop::{BackendCall, FrameOutcome, RecordingBackend};
use asset_viewer::session::{LoadStatus, ViewerSession, ViewerStatus};
use asset_viewer::source::{AssetLocator, ByteSource, MemoryByteSource};
use common::{binary_stl, inline_session, poll_until_settled, source_with};
use glam::Vec3;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

fn small_triangle() -> Vec<u8> {
    binary_stl(&[[[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]])
}

fn large_triangle() -> Vec<u8> {
    binary_stl(&[[[0.0; 3], [30.0, 0.0, 0.0], [0.0, 0.0, 30.0]]])
}

/// Holds fetches of one locator until released.
struct GatedSource {
    inner: MemoryByteSource,
    gated: AssetLocator,
    open: Mutex<bool>,
    signal: Condvar,
}

impl GatedSource {
    fn new(gated: &str, entries: &[(&str, Vec<u8>)]) -> Arc<Self> {
        let inner = MemoryByteSource::new();
        for (locator, bytes) in entries {
            inner.insert(AssetLocator::parse(locator), bytes.clone());
        }
        Arc::new(Self { inner, gated: AssetLocator::parse(gated), open: Mutex::new(false), signal: Condvar::new() })
    }

    fn release(&self) {
        *self.open.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.signal.notify_all();
    }
}

impl ByteSource for GatedSource {
    fn fetch(
        &self,
        locator: &AssetLocator,
        token: &LoadToken,
        progress: &mut dyn FnMut(f32),
    ) -> Result<Vec<u8>, LoadError> {
        if *locator == self.gated {
            let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
            while !*open {
                open = self.signal.wait(open).unwrap_or_else(PoisonError::into_inner);
            }
        }
        self.inner.fetch(locator, token, progress)
    }
}

fn threaded_session(source: Arc<GatedSource>) -> ViewerSession<RecordingBackend> {
    let worker = LoadWorker::spawn(source).expect("spawn worker");
    ViewerSession::new(&AppConfig::default(), RecordingBackend::new(), worker)
}

fn raw_bounds_size(session: &ViewerSession<RecordingBackend>) -> Vec3 {
    session.loaded_asset().expect("asset committed").tree.aggregate_bounds().size()
}

#[test]
fn later_request_wins_when_earlier_fetch_finishes_last() {
    let source = GatedSource::new("a.stl", &[("a.stl", small_triangle()), ("b.stl", large_triangle())]);
    let mut session = threaded_session(source.clone());
    session.request("a.stl", None).expect("request a");
    session.request("b.stl", None).expect("request b");
    source.release();
    poll_until_settled(&mut session);
    assert_eq!(session.status(), &LoadStatus::Ready);
    assert_eq!(session.current_asset().map(|a| a.display_name.as_str()), Some("b.stl"));
    assert!((raw_bounds_size(&session).x - 30.0).abs() < 1e-4, "only b's geometry is composed");
    assert_eq!(session.scene().renderable_count(), 1);
}

#[test]
fn later_request_wins_when_earlier_result_is_already_queued() {
    let source = source_with(&[("a.stl", small_triangle()), ("b.stl", large_triangle())]);
    let mut session = inline_session(source);
    // The inline worker finishes each job on submit, so A's result is
    // waiting in the channel when B is requested.
    session.request("a.stl", None).expect("request a");
    session.request("b.stl", None).expect("request b");
    session.poll();
    assert_eq!(session.status(), &LoadStatus::Ready);
    assert!((raw_bounds_size(&session).x - 30.0).abs() < 1e-4);
    assert_eq!(session.backend().resident_geometry(), 0, "nothing drawn yet");
    session.advance(0.016).expect("frame");
    assert_eq!(session.backend().last_draw(), Some(&BackendCall::Draw { items: 1, wireframe_items: 0 }));
}

#[test]
fn aborted_first_load_returns_to_idle() {
    let source = GatedSource::new("a.stl", &[("a.stl", small_triangle())]);
    let mut session = threaded_session(source.clone());
    session.request("a.stl", None).expect("request a");
    assert!(matches!(session.status(), LoadStatus::Loading(_)));
    session.cancel_load();
    assert_eq!(session.status(), &LoadStatus::Idle);
    assert_eq!(session.drain_status().last(), Some(&ViewerStatus::Idle));
    source.release();
    std::thread::sleep(std::time::Duration::from_millis(50));
    session.poll();
    assert_eq!(session.status(), &LoadStatus::Idle);
    assert!(session.scene().is_empty(), "no partial scene");
}

#[test]
fn aborted_replacement_keeps_previous_ready_scene() {
    let source = source_with(&[("a.stl", small_triangle()), ("b.stl", large_triangle())]);
    let mut session = inline_session(source);
    session.request("a.stl", None).expect("request a");
    session.poll();
    let before = session.scene_bounds();
    session.request("b.stl", None).expect("request b");
    session.cancel_load();
    session.poll();
    assert_eq!(session.status(), &LoadStatus::Ready);
    assert_eq!(session.current_asset().map(|a| a.display_name.as_str()), Some("a.stl"));
    assert_eq!(session.scene_bounds(), before);
}

#[test]
fn swapping_assets_releases_the_old_geometry_once() {
    let source = source_with(&[("a.stl", small_triangle()), ("b.stl", large_triangle())]);
    let mut session = inline_session(source);
    session.request("a.stl", None).expect("request a");
    session.poll();
    session.advance(0.016).expect("frame");
    let old_ids: Vec<_> = session.scene().draw_items().iter().map(|item| item.geometry.id()).collect();
    session.request("b.stl", None).expect("request b");
    session.poll();
    for id in old_ids {
        assert_eq!(session.backend().geometry_release_count(id), 1);
    }
}

#[test]
fn double_dispose_releases_each_resource_once() {
    let source = source_with(&[("pair.obj", common::obj_two_groups())]);
    let mut session = inline_session(source);
    session.request("pair.obj", None).expect("request");
    session.poll();
    session.advance(0.016).expect("frame");
    let ids: Vec<_> = session.scene().draw_items().iter().map(|item| item.geometry.id()).collect();
    assert_eq!(ids.len(), 2);

    session.dispose();
    session.dispose();
    assert_eq!(session.status(), &LoadStatus::Disposed);
    assert!(!session.render_loop().is_registered());
    for id in &ids {
        assert_eq!(session.backend().geometry_release_count(*id), 1);
    }
    let draws = session.backend().draw_count();
    assert_eq!(session.advance(0.016).expect("no-op"), FrameOutcome::Skipped);
    assert_eq!(session.backend().draw_count(), draws);
}

#[test]
fn wireframe_toggle_changes_only_the_flag() {
    let source = source_with(&[("pair.obj", common::obj_two_groups())]);
    let mut session = inline_session(source);
    session.request("pair.obj", None).expect("request");
    session.poll();
    let vertices = session.scene().vertex_count();
    let indices = session.scene().index_count();
    let bounds = session.scene_bounds();

    assert!(session.toggle_wireframe());
    assert_eq!(session.scene().vertex_count(), vertices);
    assert_eq!(session.scene().index_count(), indices);
    assert_eq!(session.scene_bounds(), bounds);
    assert!(session.scene().materials().iter().all(|m| m.wireframe()));
    session.advance(0.016).expect("frame");
    assert_eq!(session.backend().last_draw(), Some(&BackendCall::Draw { items: 2, wireframe_items: 2 }));

    assert!(!session.toggle_wireframe());
    assert!(session.scene().materials().iter().all(|m| !m.wireframe()));
}

#[test]
fn wireframe_survives_asset_swap() {
    let source = source_with(&[("a.stl", small_triangle()), ("b.stl", large_triangle())]);
    let mut session = inline_session(source);
    session.set_wireframe(true);
    session.request("a.stl", None).expect("request a");
    session.poll();
    session.request("b.stl", None).expect("request b");
    session.poll();
    assert!(session.scene().materials().iter().all(|m| m.wireframe()));
}

#[test]
fn context_loss_recovers_without_refetching() {
    let source = source_with(&[("a.stl", small_triangle())]);
    let mut session = inline_session(source.clone());
    session.request("a.stl", None).expect("request");
    session.poll();
    let bounds = session.scene_bounds();
    session.backend_mut().lose_context_next_frame = true;
    let err = session.advance(0.016).expect_err("context lost");
    assert!(matches!(err, ViewerError::RenderContextLost(_)));

    session.recover_render_context().expect("recover");
    assert_eq!(source.fetch_count(), 1, "no second fetch");
    assert_eq!(session.status(), &LoadStatus::Ready);
    assert_eq!(session.scene_bounds(), bounds);
    assert_eq!(session.advance(0.016).expect("frame"), FrameOutcome::Drawn { items: 1 });
    assert!(session.backend().calls.contains(&BackendCall::Reacquire));
}

#[test]
fn export_writes_source_bytes_unless_prevented() {
    let bytes = small_triangle();
    let dir = tempfile::tempdir().expect("temp dir");
    let dest = dir.path().join("copy.stl");

    let mut session = inline_session(source_with(&[("a.stl", bytes.clone())]));
    session.request("a.stl", None).expect("request");
    session.poll();
    session.export_source(&dest).expect("export");
    assert_eq!(std::fs::read(&dest).expect("read back"), bytes);

    let mut config = AppConfig::default();
    config.viewer.prevent_download = true;
    let worker = LoadWorker::inline(source_with(&[("a.stl", bytes)]));
    let mut locked = ViewerSession::new(&config, RecordingBackend::new(), worker);
    locked.request("a.stl", None).expect("request");
    locked.poll();
    let err = locked.export_source(dir.path().join("blocked.stl")).expect_err("download prevented");
    assert!(err.to_string().contains("disabled"));
    assert!(!dir.path().join("blocked.stl").exists());
}

#[test]
fn progress_is_monotonic_and_ends_ready() {
    let mut session = inline_session(source_with(&[("a.stl", small_triangle())]));
    session.request("a.stl", None).expect("request");
    session.poll();
    let fractions: Vec<f32> = session
        .drain_status()
        .into_iter()
        .filter_map(|status| match status {
            ViewerStatus::Loading(p) => Some(p),
            _ => None,
        })
        .collect();
    assert!(!fractions.is_empty());
    assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
    assert!(fractions.iter().all(|p| (0.0..=1.0).contains(p)));
}

#[test]
fn cube_bounds_normalize_to_target_size() {
    let bytes = binary_stl(&[[[0.0; 3], [2.0, 0.0, 2.0], [0.0, 2.0, 0.0]]]);
    let mut session = inline_session(source_with(&[("cube.stl", bytes)]));
    session.request("cube.stl", None).expect("request");
    session.poll();
    let normalization = session.normalization().expect("normalized");
    assert!((normalization.scale_factor - 2.5).abs() < 1e-5);
    assert!(normalization.center_offset.abs_diff_eq(Vec3::splat(-2.5), 1e-5));
    let bounds = session.scene_bounds();
    assert!(bounds.min.abs_diff_eq(Vec3::splat(-2.5), 1e-4));
    assert!(bounds.max.abs_diff_eq(Vec3::splat(2.5), 1e-4));
}

#[test]
fn recovery_after_failed_request_stays_in_error() {
    let mut session = inline_session(source_with(&[("a.stl", small_triangle())]));
    session.request("a.stl", None).expect("request a");
    session.poll();
    assert_eq!(session.status(), &LoadStatus::Ready);
    session.request("missing.stl", None).expect("request missing");
    session.poll();
    assert!(matches!(session.status(), LoadStatus::Error(_)));
    assert!(session.current_asset().is_none());

    session.backend_mut().lose_context_next_frame = true;
    session.advance(0.016).expect_err("context lost");
    session.recover_render_context().expect("recover");
    assert!(matches!(session.status(), LoadStatus::Error(_)));
    assert!(session.current_asset().is_none());
    assert!(session.loaded_asset().is_none());
    assert_eq!(session.advance(0.016).expect("frame"), FrameOutcome::Drawn { items: 0 });
}

#[test]
fn recovery_during_a_load_keeps_progress() {
    let source = GatedSource::new("b.stl", &[("a.stl", small_triangle()), ("b.stl", large_triangle())]);
    let mut session = threaded_session(source.clone());
    session.request("a.stl", None).expect("request a");
    poll_until_settled(&mut session);
    session.request("b.stl", None).expect("request b");
    session.poll();
    let LoadStatus::Loading(before) = *session.status() else {
        panic!("expected loading, got {:?}", session.status());
    };
    session.drain_status();

    session.backend_mut().lose_context_next_frame = true;
    session.advance(0.016).expect_err("context lost");
    session.recover_render_context().expect("recover");
    match session.status() {
        LoadStatus::Loading(after) => assert!(*after >= before),
        other => panic!("expected loading after recovery, got {other:?}"),
    }
    assert!(!session.drain_status().contains(&ViewerStatus::Ready));
    assert_eq!(session.current_asset().map(|a| a.display_name.as_str()), Some("a.stl"));

    source.release();
    poll_until_settled(&mut session);
    assert_eq!(session.current_asset().map(|a| a.display_name.as_str()), Some("b.stl"));
}

#[test]
fn dispose_during_threaded_load_composes_nothing() {
    let source = GatedSource::new("a.stl", &[("a.stl", small_triangle())]);
    let mut session = threaded_session(source.clone());
    session.request("a.stl", None).expect("request a");
    assert_eq!(session.active_generation(), Some(1));

    session.dispose();
    assert_eq!(session.active_generation(), None);
    source.release();
    std::thread::sleep(std::time::Duration::from_millis(50));
    session.poll();

    assert_eq!(session.status(), &LoadStatus::Disposed);
    assert!(session.scene().is_empty());
    assert!(session.loaded_asset().is_none());
    assert_eq!(session.advance(0.016).expect("no-op"), FrameOutcome::Skipped);
    assert_eq!(session.backend().draw_count(), 0);
    assert!(session.backend().released_geometry().is_empty(), "nothing was ever composed");
}

#[test]
fn partially_skipped_asset_still_reaches_ready() {
    let obj = b"v 0 0 0\nv 1 0 0\nv 1 1 0\nf 1 2 3\nf 1 2\n".to_vec();
    let mut session = inline_session(source_with(&[("part.obj", obj)]));
    session.request("part.obj", None).expect("request");
    session.poll();
    assert_eq!(session.status(), &LoadStatus::Ready);
    let asset = session.loaded_asset().expect("asset committed");
    assert_eq!(asset.skipped.len(), 1);
    assert!(asset.skipped[0].contains("2 corners"), "{:?}", asset.skipped);
    assert_eq!(session.scene().renderable_count(), 1);
    assert_eq!(session.drain_status().last(), Some(&ViewerStatus::Ready));
}
