use std::path::PathBuf;

use reqwest::StatusCode;

/// Everything that can go wrong while resolving a tile.
///
/// Note that a tile missing from a cache is not an error, caches return `Ok(None)` for it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupted cache entry {path}: {reason}")]
    Corrupted { path: PathBuf, reason: &'static str },

    #[error("malformed URL: {0}")]
    MalformedUrl(String),

    #[error("unexpected HTTP status {0}")]
    BadResponse(StatusCode),

    #[error("tile server returned no data")]
    EmptyResponse,

    #[error(transparent)]
    Http(#[from] reqwest_middleware::Error),

    #[error("tile data could not be decoded: {0}")]
    Decode(#[from] image::ImageError),

    #[error("tile coordinate is out of range")]
    InvalidTile,

    #[error(transparent)]
    InvalidZoom(#[from] crate::InvalidZoom),

    #[error("request was cancelled")]
    Cancelled,

    #[error("tile is not cached and the source is offline")]
    Offline,

    #[error("request is already completed")]
    AlreadyCompleted,

    #[error("request has no data to complete with")]
    NothingToComplete,

    #[error("tile provider finished without completing the request")]
    Incomplete,

    #[error("IO runtime could not be started: {0}")]
    Runtime(#[source] std::io::Error),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Self::Http(reqwest_middleware::Error::Reqwest(error))
    }
}
