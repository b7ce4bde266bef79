//! Seam to the document rasterizer

use std::path::Path;

use super::request::CodecError;
use super::types::PageImage;

/// Opens documents for rasterization.
///
/// Implementations wrap a native renderer (MuPDF, pdfium, ...). The engine
/// only ever calls `open` on a staged, random-access copy of the source.
pub trait PageCodec: Send + Sync + 'static {
    type Handle: PageHandle;

    fn open(&self, staged: &Path) -> Result<Self::Handle, CodecError>;
}

/// An open document. Owned by exactly one session.
pub trait PageHandle: Send + 'static {
    fn page_count(&self) -> usize;

    /// Rasterize `index` at `target_width` pixels, preserving aspect ratio.
    fn render_page(&mut self, index: usize, target_width: u32) -> Result<PageImage, CodecError>;

    /// Release the native document and its file descriptor.
    ///
    /// Must be idempotent: the engine calls it on every exit path and the
    /// handle may also be dropped afterwards.
    fn close(&mut self);
}

/// Output size for a page of `page_width` x `page_height` points scaled to `target_width`.
#[must_use]
pub fn fit_width(page_width: f32, page_height: f32, target_width: u32) -> (u32, u32) {
    if page_width <= 0.0 || page_height <= 0.0 {
        return (target_width, target_width);
    }
    let scale = target_width as f32 / page_width;
    let height = (page_height * scale).round().max(1.0) as u32;
    (target_width, height)
}
