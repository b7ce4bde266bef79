//! Core types for incremental page rendering

use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

/// Decoded page raster (RGB, 3 bytes per pixel).
pub type PageImage = image::RgbImage;

/// Where a document's bytes come from before staging.
#[derive(Clone, Debug)]
pub enum DocumentSource {
    /// A file on disk, copied into the staging area on open
    Path(PathBuf),
    /// In-memory bytes (bundled resources, downloads)
    Bytes(Arc<[u8]>),
}

/// A paginated source artifact, identified by a stable name.
#[derive(Clone, Debug)]
pub struct Document {
    pub name: String,
    pub source: DocumentSource,
}

impl Document {
    #[must_use]
    pub fn from_path(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source: DocumentSource::Path(path.into()),
        }
    }

    #[must_use]
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            source: DocumentSource::Bytes(bytes.into()),
        }
    }
}

/// A page persisted in the disk store. Never mutated once created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageRecord {
    /// Page number (0-indexed)
    pub index: usize,
    /// Location of the encoded image
    pub path: PathBuf,
    /// Encoded file size in bytes
    pub byte_size: u64,
    /// Image width in pixels
    pub width_px: u32,
    /// Image height in pixels
    pub height_px: u32,
}

/// Lifecycle of a viewer session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Unopened,
    /// Handle opening or first batch rendering
    Opening,
    /// Some pages still unrendered
    Partial,
    /// Every page has been attempted
    Full,
    Closed,
}

/// Point-in-time view of a session, safe to hold while rendering continues.
#[derive(Clone, Debug)]
pub struct SessionSnapshot {
    pub document: String,
    pub state: SessionState,
    /// Rendered pages in ascending index order
    pub pages: Arc<[PageRecord]>,
    pub total_pages: usize,
}

impl SessionSnapshot {
    #[must_use]
    pub fn rendered_count(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.state == SessionState::Full
    }

    /// Pixel dimensions of the first rendered page, if any.
    #[must_use]
    pub fn resolution(&self) -> Option<(u32, u32)> {
        self.pages.first().map(|p| (p.width_px, p.height_px))
    }
}

/// Why a batch stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchStop {
    /// Every page in the requested range was attempted
    Completed,
    /// The codec ran out of memory at this page; later pages were not attempted
    OutOfMemory { page: usize },
    /// The session was closed while the batch was running
    Cancelled,
    /// Nothing to do: session missing or already full
    Idle,
}

/// Outcome of one render batch.
#[derive(Clone, Debug)]
pub struct BatchReport {
    pub document: String,
    /// Page range the batch set out to render
    pub requested: Range<usize>,
    /// Pages appended to the session by this batch
    pub pages: Vec<PageRecord>,
    /// Pages that failed to render or persist and were skipped
    pub skipped: Vec<usize>,
    pub stop: BatchStop,
}

impl BatchReport {
    #[must_use]
    pub fn idle(document: &str) -> Self {
        Self {
            document: document.to_string(),
            requested: 0..0,
            pages: Vec::new(),
            skipped: Vec::new(),
            stop: BatchStop::Idle,
        }
    }

    #[must_use]
    pub fn rendered(&self) -> usize {
        self.pages.len()
    }
}

impl std::fmt::Display for BatchReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}..{}): {} rendered, {} skipped, {:?}",
            self.document,
            self.requested.start,
            self.requested.end,
            self.pages.len(),
            self.skipped.len(),
            self.stop
        )
    }
}
