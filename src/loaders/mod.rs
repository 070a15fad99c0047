//! Per-format asset loaders and the cancellation token they share.

pub mod fbx;
pub mod gltf;
pub mod obj;
pub mod placeholder;
pub mod ply;
pub mod stl;

use crate::error::ViewerError;
use crate::format::AssetFormat;
use crate::scene::SceneArena;
use crate::source::{AssetLocator, ByteSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Fraction of the progress bar given to the fetch; parsing fills the rest.
pub const FETCH_PROGRESS_SHARE: f32 = 0.9;

/// Identifies one load request. Cloned into the worker; cancelling any clone
/// cancels them all.
#[derive(Clone, Debug)]
pub struct LoadToken {
    generation: u64,
    cancelled: Arc<AtomicBool>,
}

impl LoadToken {
    pub fn new(generation: u64) -> Self {
        Self { generation, cancelled: Arc::new(AtomicBool::new(false)) }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), LoadError> {
        if self.is_cancelled() {
            Err(LoadError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadError {
    Cancelled,
    Failed(ViewerError),
}

impl From<ViewerError> for LoadError {
    fn from(err: ViewerError) -> Self {
        LoadError::Failed(err)
    }
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Cancelled => f.write_str("load cancelled"),
            LoadError::Failed(err) => err.fmt(f),
        }
    }
}

/// What a loader knows about the request besides the bytes.
pub struct ParseContext<'a> {
    pub locator: &'a AssetLocator,
    pub format: AssetFormat,
    /// Monotonic per session; seeds deterministic default colors.
    pub load_sequence: u64,
    pub source: &'a dyn ByteSource,
    pub token: &'a LoadToken,
}

impl ParseContext<'_> {
    /// Fetches a file referenced by the asset (external buffers and the like).
    pub fn fetch_sibling(&self, relative: &str) -> Result<Vec<u8>, LoadError> {
        let locator = self.locator.join(relative);
        self.source.fetch(&locator, self.token, &mut |_| {})
    }
}

/// A parsed scene tree, not yet normalized.
#[derive(Clone, Debug)]
pub struct LoadedAsset {
    pub format: AssetFormat,
    pub tree: SceneArena,
    /// Sub-features that were skipped, one human-readable reason each.
    pub skipped: Vec<String>,
    pub source_bytes: Option<Arc<[u8]>>,
    pub placeholder: bool,
}

impl LoadedAsset {
    pub fn new(format: AssetFormat, tree: SceneArena) -> Self {
        Self { format, tree, skipped: Vec::new(), source_bytes: None, placeholder: false }
    }

    pub fn skip(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        log::warn!("[loader] {} sub-feature skipped: {reason}", self.format.label());
        self.skipped.push(reason);
    }
}

pub trait AssetLoader: Send {
    /// Short name used in log lines.
    fn name(&self) -> &'static str;

    /// Turns raw bytes into a scene tree. Errors carry the parser's message.
    fn parse(&self, bytes: &[u8], ctx: &ParseContext<'_>) -> anyhow::Result<LoadedAsset>;

    /// Fetch, then parse, checking `token` around both steps.
    fn load(
        &self,
        ctx: &ParseContext<'_>,
        progress: &mut dyn FnMut(f32),
    ) -> Result<LoadedAsset, LoadError> {
        ctx.token.check()?;
        let mut fetch_progress = |fraction: f32| progress(fraction.clamp(0.0, 1.0) * FETCH_PROGRESS_SHARE);
        let bytes = ctx.source.fetch(ctx.locator, ctx.token, &mut fetch_progress)?;
        ctx.token.check()?;
        let parsed = self.parse(&bytes, ctx);
        ctx.token.check()?;
        let mut asset = parsed.map_err(ViewerError::malformed)?;
        if asset.tree.renderable_count() == 0 {
            return Err(ViewerError::MalformedAsset("asset contains no renderable geometry".into()).into());
        }
        asset.source_bytes = Some(Arc::from(bytes));
        progress(1.0);
        Ok(asset)
    }
}

/// Monotonic progress forwarding; late smaller fractions are dropped.
pub(crate) struct ProgressGate<F: FnMut(f32)> {
    last: f32,
    sink: F,
}

impl<F: FnMut(f32)> ProgressGate<F> {
    pub(crate) fn new(sink: F) -> Self {
        Self { last: 0.0, sink }
    }

    pub(crate) fn report(&mut self, fraction: f32) {
        let fraction = fraction.clamp(0.0, 1.0);
        if fraction > self.last {
            self.last = fraction;
            (self.sink)(fraction);
        }
    }
}
