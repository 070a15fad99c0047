pub mod app;
pub mod camera;
pub mod cli;
pub mod config;
pub mod error;
pub mod format;
pub mod geometry;
pub mod input;
pub mod load_worker;
pub mod loaders;
pub mod normalize;
#[cfg(feature = "overlay")]
pub mod overlay;
pub mod render_loop;
pub mod renderer;
pub mod scene;
pub mod session;
pub mod source;

pub use app::{run, App};
pub use error::{ViewerError, ViewerResult};
pub use render_loop::{DrawBackend, RecordingBackend};
pub use session::{AssetDescriptor, LoadStatus, ViewerSession};
