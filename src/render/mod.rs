//! Incremental page rendering and caching

mod cache;
mod codec;
mod disk;
#[cfg(feature = "pdf")]
mod mupdf;
mod prefetch;
mod request;
mod scheduler;
mod service;
mod session;
mod staging;
mod types;

pub use cache::{CacheStats, MemoryPageCache, footprint};
pub use codec::{PageCodec, PageHandle, fit_width};
pub use disk::DiskPageStore;
#[cfg(feature = "pdf")]
pub use mupdf::{MuPdfCodec, MuPdfHandle};
pub use prefetch::PrefetchPolicy;
pub use request::{CodecError, RenderError, RenderRequest, RequestId, Result};
pub use scheduler::{RenderScheduler, SchedulerConfig};
pub use service::{PendingRender, RenderService};
pub use session::ViewerSession;
pub use staging::StagingArea;
pub use types::*;

/// Pages rendered when a document is first opened
pub const DEFAULT_INITIAL_BATCH: usize = 5;
/// Pages rendered per extension
pub const DEFAULT_BATCH_SIZE: usize = 5;
/// Pages from the end of the rendered list at which the next batch is requested
pub const DEFAULT_PREFETCH_MARGIN: usize = 3;
/// Raster width in pixels, independent of the source page size
pub const DEFAULT_TARGET_WIDTH: u32 = 1920;
/// Memory cache budget as a fraction (1/n) of physical memory
pub const DEFAULT_MEMORY_DIVISOR: u64 = 8;
/// Floor for the memory cache budget when it shrinks under memory pressure
pub const MIN_MEMORY_BUDGET: usize = 32 * 1024 * 1024;
