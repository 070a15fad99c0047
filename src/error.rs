use thiserror::Error;

/// Terminal failures surfaced by the viewer. Anything that is not one of these
/// (an unsupported node inside an otherwise good asset, for instance) is logged
/// and skipped instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ViewerError {
    #[error("UnsupportedFormat: {0}")]
    UnsupportedFormat(String),
    #[error("NetworkFailure: {locator}: {message}")]
    NetworkFailure { locator: String, message: String },
    #[error("MalformedAsset: {0}")]
    MalformedAsset(String),
    #[error("RenderContextLost: {0}")]
    RenderContextLost(String),
    #[error("DisposalRace")]
    DisposalRace,
}

impl ViewerError {
    pub fn malformed(err: impl std::fmt::Display) -> Self {
        ViewerError::MalformedAsset(err.to_string())
    }

    pub fn network(locator: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        ViewerError::NetworkFailure { locator: locator.to_string(), message: err.to_string() }
    }

    /// Short variant name, stable across message changes.
    pub fn kind(&self) -> &'static str {
        match self {
            ViewerError::UnsupportedFormat(_) => "UnsupportedFormat",
            ViewerError::NetworkFailure { .. } => "NetworkFailure",
            ViewerError::MalformedAsset(_) => "MalformedAsset",
            ViewerError::RenderContextLost(_) => "RenderContextLost",
            ViewerError::DisposalRace => "DisposalRace",
        }
    }
}

pub type ViewerResult<T> = std::result::Result<T, ViewerError>;
