//! Byte-stream providers behind an asset locator.

use crate::error::ViewerError;
use crate::loaders::{LoadError, LoadToken};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

const READ_CHUNK: usize = 64 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AssetLocator {
    File(PathBuf),
    Url(String),
}

impl AssetLocator {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            AssetLocator::Url(trimmed.to_string())
        } else if let Some(path) = trimmed.strip_prefix("file://") {
            AssetLocator::File(PathBuf::from(path))
        } else {
            AssetLocator::File(PathBuf::from(trimmed))
        }
    }

    /// Resolves a relative reference (an external glTF buffer, say) against
    /// this locator's directory.
    pub fn join(&self, relative: &str) -> AssetLocator {
        match self {
            AssetLocator::File(path) => {
                let base = path.parent().unwrap_or_else(|| Path::new(""));
                AssetLocator::File(base.join(relative))
            }
            AssetLocator::Url(url) => {
                let without_query = url.split(['?', '#']).next().unwrap_or(url);
                let base = match without_query.rfind('/') {
                    Some(idx) => &without_query[..=idx],
                    None => without_query,
                };
                AssetLocator::Url(format!("{base}{relative}"))
            }
        }
    }
}

impl fmt::Display for AssetLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetLocator::File(path) => write!(f, "{}", path.display()),
            AssetLocator::Url(url) => f.write_str(url),
        }
    }
}

/// Supplies raw asset bytes. Implementations should poll `token` between
/// chunks; the caller re-checks it before committing anyway.
pub trait ByteSource: Send + Sync {
    fn fetch(
        &self,
        locator: &AssetLocator,
        token: &LoadToken,
        progress: &mut dyn FnMut(f32),
    ) -> Result<Vec<u8>, LoadError>;
}

/// Local files through `std::fs`, URLs through `ureq`.
pub struct DefaultByteSource {
    agent: ureq::Agent,
}

impl DefaultByteSource {
    pub fn new(timeout: Duration) -> Self {
        Self { agent: ureq::AgentBuilder::new().timeout(timeout).build() }
    }

    fn fetch_file(
        &self,
        locator: &AssetLocator,
        path: &Path,
        token: &LoadToken,
        progress: &mut dyn FnMut(f32),
    ) -> Result<Vec<u8>, LoadError> {
        let file = File::open(path).map_err(|err| ViewerError::network(locator, err))?;
        let total = file.metadata().map(|meta| meta.len() as usize).ok();
        read_chunked(locator, file, total, token, progress)
    }

    fn fetch_url(
        &self,
        locator: &AssetLocator,
        url: &str,
        token: &LoadToken,
        progress: &mut dyn FnMut(f32),
    ) -> Result<Vec<u8>, LoadError> {
        let response = self.agent.get(url).call().map_err(|err| ViewerError::network(locator, err))?;
        let total = response.header("Content-Length").and_then(|value| value.parse::<usize>().ok());
        read_chunked(locator, response.into_reader(), total, token, progress)
    }
}

impl Default for DefaultByteSource {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl ByteSource for DefaultByteSource {
    fn fetch(
        &self,
        locator: &AssetLocator,
        token: &LoadToken,
        progress: &mut dyn FnMut(f32),
    ) -> Result<Vec<u8>, LoadError> {
        token.check()?;
        match locator {
            AssetLocator::File(path) => self.fetch_file(locator, path, token, progress),
            AssetLocator::Url(url) => self.fetch_url(locator, url, token, progress),
        }
    }
}

fn read_chunked(
    locator: &AssetLocator,
    mut reader: impl Read,
    total: Option<usize>,
    token: &LoadToken,
    progress: &mut dyn FnMut(f32),
) -> Result<Vec<u8>, LoadError> {
    let mut bytes = Vec::with_capacity(total.unwrap_or(0).min(256 * 1024 * 1024));
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        token.check()?;
        let read = reader.read(&mut chunk).map_err(|err| ViewerError::network(locator, err))?;
        if read == 0 {
            break;
        }
        bytes.extend_from_slice(&chunk[..read]);
        if let Some(total) = total.filter(|t| *t > 0) {
            progress((bytes.len() as f32 / total as f32).min(1.0));
        }
    }
    progress(1.0);
    Ok(bytes)
}

/// In-memory source keyed by locator; counts fetch attempts.
#[derive(Default)]
pub struct MemoryByteSource {
    entries: Mutex<HashMap<AssetLocator, Vec<u8>>>,
    fetches: AtomicUsize,
}

impl MemoryByteSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, locator: AssetLocator, bytes: impl Into<Vec<u8>>) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).insert(locator, bytes.into());
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl ByteSource for MemoryByteSource {
    fn fetch(
        &self,
        locator: &AssetLocator,
        token: &LoadToken,
        progress: &mut dyn FnMut(f32),
    ) -> Result<Vec<u8>, LoadError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        token.check()?;
        let bytes = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(locator)
            .cloned()
            .ok_or_else(|| ViewerError::network(locator, "not found"))?;
        progress(1.0);
        Ok(bytes)
    }
}
