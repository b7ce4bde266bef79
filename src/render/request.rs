//! Render request identifiers and error types

use std::io;
use std::path::PathBuf;

/// Unique identifier for render requests
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

impl RequestId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Work handed to a background render thread
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RenderRequest {
    /// Open a document and render its first batch
    Initial { id: RequestId, document: String },
    /// Render the next batch of an open document
    Extend { id: RequestId, document: String },
}

impl RenderRequest {
    #[must_use]
    pub fn id(&self) -> RequestId {
        match self {
            Self::Initial { id, .. } | Self::Extend { id, .. } => *id,
        }
    }

    #[must_use]
    pub fn document(&self) -> &str {
        match self {
            Self::Initial { document, .. } | Self::Extend { document, .. } => document,
        }
    }
}

/// Errors reported by a page codec
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("cannot open document: {0}")]
    Open(String),

    #[error("page {page}: {detail}")]
    Render { page: usize, detail: String },

    #[error("out of memory rendering page {page}")]
    OutOfMemory { page: usize },
}

/// Fragments native rasterizers use when an allocation fails
const ALLOCATION_FAILURES: &[&str] = &[
    "out of memory",
    "malloc",
    "calloc",
    "realloc",
    "cannot allocate",
];

impl CodecError {
    pub fn render(page: usize, detail: impl Into<String>) -> Self {
        Self::Render {
            page,
            detail: detail.into(),
        }
    }

    /// A render failure reported as text, classified as `OutOfMemory` when
    /// the message shows an allocation failure.
    pub fn from_render_failure(page: usize, detail: impl std::fmt::Display) -> Self {
        let detail = detail.to_string();
        let lower = detail.to_lowercase();
        if ALLOCATION_FAILURES.iter().any(|f| lower.contains(f)) {
            Self::OutOfMemory { page }
        } else {
            Self::render(page, detail)
        }
    }
}

/// Errors from the rendering engine
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("document `{document}` unavailable: {reason}")]
    SourceUnavailable { document: String, reason: String },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("failed to write page {path:?}: {source}")]
    DiskWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode page {path:?}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to decode page {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("I/O: {0}")]
    Io(#[from] io::Error),
}

impl RenderError {
    pub fn unavailable(document: &str, reason: impl std::fmt::Display) -> Self {
        Self::SourceUnavailable {
            document: document.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True when the failure should stop the current batch.
    #[must_use]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::Codec(CodecError::OutOfMemory { .. }))
    }
}

pub type Result<T, E = RenderError> = std::result::Result<T, E>;
