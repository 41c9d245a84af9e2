use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use reqwest::StatusCode;

/// Pipeline stage a terminating error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Manifest,
    Playlist,
    Key,
    Segment,
    Decryption,
    Output,
    Transcode,
    Job,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Manifest => "manifest discovery",
            Stage::Playlist => "playlist loading",
            Stage::Key => "key resolution",
            Stage::Segment => "segment download",
            Stage::Decryption => "decryption",
            Stage::Output => "output",
            Stage::Transcode => "transcoding",
            Stage::Job => "job",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("no URL ending in `{suffix}` observed yet")]
    ManifestNotYetAvailable { suffix: String },

    #[error("manifest URL not found after {attempts} polls of {page_url}")]
    AcquisitionFailed { page_url: String, attempts: u32 },

    #[error("browser session error: {reason}")]
    Browser { reason: String },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("transient failure fetching key {url}: {reason}")]
    KeyFetchTransient { url: String, reason: String },

    #[error("key server rejected {url} with HTTP {status}")]
    KeyFetchRejected { url: String, status: StatusCode },

    #[error("key request to {url} failed: {reason}")]
    KeyRequestFailed { url: String, reason: String },

    #[error("transient failure fetching segment #{index} ({url}): {reason}")]
    SegmentFetchTransient {
        index: usize,
        url: String,
        reason: String,
    },

    #[error("segment #{index} ({url}) failed after {attempts} attempts: {reason}")]
    SegmentFetchExhausted {
        index: usize,
        url: String,
        attempts: u32,
        reason: String,
    },

    #[error("segment #{index} ({url}) rejected with HTTP {status}")]
    SegmentRejected {
        index: usize,
        url: String,
        status: StatusCode,
    },

    #[error("segment #{index} request to {url} failed: {reason}")]
    SegmentRequestFailed {
        index: usize,
        url: String,
        reason: String,
    },

    #[error("decryption error: {reason}")]
    Decryption { reason: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("output incomplete: wrote {written} of {expected} segments")]
    IncompleteOutput { written: usize, expected: usize },

    #[error("transcoder exited with {status}: {stderr}")]
    TranscodeFailed { status: String, stderr: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl DownloadError {
    pub fn browser(reason: impl Into<String>) -> Self {
        Self::Browser {
            reason: reason.into(),
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn decryption(reason: impl Into<String>) -> Self {
        Self::Decryption {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a retry policy may attempt the failed operation again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ManifestNotYetAvailable { .. }
                | Self::KeyFetchTransient { .. }
                | Self::SegmentFetchTransient { .. }
        )
    }

    pub fn stage(&self) -> Stage {
        match self {
            Self::ManifestNotYetAvailable { .. }
            | Self::AcquisitionFailed { .. }
            | Self::Browser { .. } => Stage::Manifest,
            Self::Playlist { .. } => Stage::Playlist,
            Self::KeyFetchTransient { .. }
            | Self::KeyFetchRejected { .. }
            | Self::KeyRequestFailed { .. } => Stage::Key,
            Self::SegmentFetchTransient { .. }
            | Self::SegmentFetchExhausted { .. }
            | Self::SegmentRejected { .. }
            | Self::SegmentRequestFailed { .. } => Stage::Segment,
            Self::Decryption { .. } => Stage::Decryption,
            Self::Io { .. } | Self::IncompleteOutput { .. } => Stage::Output,
            Self::TranscodeFailed { .. } => Stage::Transcode,
            Self::Cancelled | Self::Configuration { .. } | Self::Internal { .. } => Stage::Job,
        }
    }

    /// Recover an owned error from one shared between coalesced callers.
    ///
    /// The sole owner gets the original back; otherwise an equivalent value is rebuilt.
    pub(crate) fn from_shared(shared: Arc<DownloadError>) -> Self {
        Arc::try_unwrap(shared).unwrap_or_else(|shared| shared.rebuild())
    }

    fn rebuild(&self) -> Self {
        match self {
            Self::Cancelled => Self::Cancelled,
            Self::KeyFetchTransient { url, reason } => Self::KeyFetchTransient {
                url: url.clone(),
                reason: reason.clone(),
            },
            Self::KeyFetchRejected { url, status } => Self::KeyFetchRejected {
                url: url.clone(),
                status: *status,
            },
            Self::KeyRequestFailed { url, reason } => Self::KeyRequestFailed {
                url: url.clone(),
                reason: reason.clone(),
            },
            Self::Decryption { reason } => Self::decryption(reason.clone()),
            Self::Io { path, source } => {
                Self::io(path.clone(), std::io::Error::new(source.kind(), source.to_string()))
            }
            other => Self::Internal {
                reason: other.to_string(),
            },
        }
    }
}
