use thiserror::Error;

use crate::{
    exporter::ExportError,
    health::ApiError,
    route::RouteError,
    runtime::{conf::ConfError, reload::ReloadError},
};

/// Main application error type
#[derive(Debug, Error)]
pub enum DecapError {
    /// Configuration resolution errors
    #[error("configuration error: {0}")]
    Conf(#[from] ConfError),

    /// Route map loading errors
    #[error("route map error: {0}")]
    Route(#[from] RouteError),

    /// Datalink/exporter errors
    #[error("exporter error: {0}")]
    Export(#[from] ExportError),

    /// Health API server errors
    #[error("health api error: {0}")]
    Api(#[from] ApiError),

    /// Reload watcher errors
    #[error("reload watcher error: {0}")]
    Reload(#[from] ReloadError),

    /// Socket and signal handling errors
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for Result with DecapError
pub type Result<T> = std::result::Result<T, DecapError>;
