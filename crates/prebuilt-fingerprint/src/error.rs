use std::path::PathBuf;

use crate::platform::Platform;

pub type Result<T> = std::result::Result<T, FingerprintError>;

/// Errors that abort fingerprinting.
///
/// Per-file read failures are not represented here: they are logged and the
/// file is left out of the fingerprint.
#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error("unknown platform `{name}` (expected one of: android, ios)")]
    UnknownPlatform { name: String },

    #[error("project root {path} is not usable: {source}")]
    ProjectRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to resolve native dependencies for {platform}: {message}")]
    DependencyGraph { platform: Platform, message: String },

    #[error("invalid glob pattern `{pattern}`: {message}")]
    InvalidGlob { pattern: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
