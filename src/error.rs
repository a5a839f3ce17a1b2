use std::path::PathBuf;

use thiserror::Error;

/// Failure classes for a single (version, platform) unit of work.
///
/// Every variant is local to one artifact: the batch loop logs the error and
/// moves on to the next unit. Only configuration problems (missing release
/// file, unparseable archive root) abort a run, and those surface as plain
/// `anyhow` errors from the orchestration layer.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// The numeric portion of a version string did not split into exactly
    /// three integers.
    #[error("invalid version format: {0:?}")]
    InvalidVersionFormat(String),

    #[error("malformed release file {path}: {reason}")]
    MalformedReleaseFile { path: PathBuf, reason: String },

    /// A channel "latest" endpoint answered with a non-200 status.
    #[error("channel {channel} latest query returned HTTP {status}")]
    ChannelUnavailable { channel: String, status: u16 },

    /// Non-404 HTTP failure or transport error. Aborts the whole fallback
    /// chain for the current artifact; 404 by itself never produces this.
    #[error("request to {url} failed: {reason}")]
    Network { url: String, reason: String },

    #[error("corrupt archive {path}: {reason}")]
    MalformedArchive { path: PathBuf, reason: String },

    /// The external size analyzer exited non-zero.
    #[error("size analyzer exited with status {status}: {stderr}")]
    AnalyzerFailure { status: i32, stderr: String },

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TrackerError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
