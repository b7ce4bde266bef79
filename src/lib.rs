//! Incremental page rendering for scrolling document viewers.
//!
//! Documents are rasterized a batch at a time as the reader scrolls, kept on
//! disk as PNG files and in memory as decoded images under a byte budget.
//! The rasterizer itself sits behind [`render::PageCodec`]; the `pdf`
//! feature provides a MuPDF implementation.

pub mod logging;
pub mod render;
pub mod settings;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use render::{
    BatchReport, BatchStop, Document, DocumentSource, MemoryPageCache, PageCodec, PageHandle,
    PageImage, PageRecord, PendingRender, PrefetchPolicy, RenderError, RenderScheduler,
    RenderService, SchedulerConfig, SessionSnapshot, SessionState,
};
pub use settings::RenderSettings;
