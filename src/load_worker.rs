//! Background fetch-and-parse. Jobs go out over one channel, progress and
//! results come back over another and are drained on the frame thread.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};

use crate::format::AssetFormat;
use crate::loaders::{AssetLoader, LoadError, LoadToken, LoadedAsset, ParseContext, ProgressGate};
use crate::source::{AssetLocator, ByteSource};

pub struct LoadJob {
    pub locator: AssetLocator,
    pub format: AssetFormat,
    pub loader: Box<dyn AssetLoader>,
    pub token: LoadToken,
    pub load_sequence: u64,
}

pub enum LoadMessage {
    Progress { generation: u64, fraction: f32 },
    Finished { generation: u64, result: Result<LoadedAsset, LoadError> },
}

impl LoadMessage {
    pub fn generation(&self) -> u64 {
        match self {
            LoadMessage::Progress { generation, .. } | LoadMessage::Finished { generation, .. } => *generation,
        }
    }
}

enum Mode {
    Thread(mpsc::Sender<LoadJob>),
    /// Runs each job on the submitting thread; results still arrive through
    /// `drain`, so callers observe the same ordering as the threaded mode.
    Inline(Arc<dyn ByteSource>, mpsc::Sender<LoadMessage>),
}

pub struct LoadWorker {
    mode: Mode,
    rx: mpsc::Receiver<LoadMessage>,
}

impl LoadWorker {
    pub fn spawn(source: Arc<dyn ByteSource>) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<LoadJob>();
        let (result_tx, result_rx) = mpsc::channel();
        thread::Builder::new()
            .name("asset-load".to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    if !run_load_job(job, source.as_ref(), &result_tx) {
                        break;
                    }
                }
                log::debug!("[loader] load worker exiting");
            })
            .context("failed to spawn asset load worker")?;
        Ok(Self { mode: Mode::Thread(tx), rx: result_rx })
    }

    pub fn inline(source: Arc<dyn ByteSource>) -> Self {
        let (tx, rx) = mpsc::channel();
        Self { mode: Mode::Inline(source, tx), rx }
    }

    pub fn submit(&self, job: LoadJob) -> std::result::Result<(), LoadJob> {
        match &self.mode {
            Mode::Thread(tx) => tx.send(job).map_err(|err| err.0),
            Mode::Inline(source, tx) => {
                run_load_job(job, source.as_ref(), tx);
                Ok(())
            }
        }
    }

    pub fn drain(&self) -> Vec<LoadMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            messages.push(message);
        }
        messages
    }
}

/// Returns false once the receiving side is gone.
fn run_load_job(job: LoadJob, source: &dyn ByteSource, tx: &mpsc::Sender<LoadMessage>) -> bool {
    let LoadJob { locator, format, loader, token, load_sequence } = job;
    let generation = token.generation();
    let started = Instant::now();
    log::debug!("[loader] {} load #{generation} starting for {locator}", loader.name());

    let ctx = ParseContext { locator: &locator, format, load_sequence, source, token: &token };
    let result = {
        let mut gate = ProgressGate::new(|fraction| {
            let _ = tx.send(LoadMessage::Progress { generation, fraction });
        });
        loader.load(&ctx, &mut |fraction| gate.report(fraction))
    };

    match &result {
        Ok(asset) => log::info!(
            "[loader] {} loaded {locator} in {:.1} ms ({} renderable nodes, {} skipped features)",
            format.label(),
            started.elapsed().as_secs_f64() * 1000.0,
            asset.tree.renderable_count(),
            asset.skipped.len()
        ),
        Err(LoadError::Cancelled) => log::debug!("[loader] load #{generation} for {locator} cancelled"),
        Err(LoadError::Failed(err)) => log::warn!("[loader] load #{generation} for {locator} failed: {err}"),
    }
    tx.send(LoadMessage::Finished { generation, result }).is_ok()
}
