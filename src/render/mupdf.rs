//! MuPDF-backed page codec
//!
//! MuPDF documents are bound to the thread that opened them, so each handle
//! owns a dedicated thread holding the `Document` and is driven over flume
//! channels.

use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use flume::{Receiver, Sender};
use log::{debug, warn};
use mupdf::{Colorspace, Document, Matrix, Pixmap};

use super::codec::{PageCodec, PageHandle, fit_width};
use super::request::CodecError;
use super::types::PageImage;

enum Job {
    Render {
        index: usize,
        target_width: u32,
        reply: Sender<Result<PageImage, CodecError>>,
    },
    Shutdown,
}

/// Opens PDF/EPUB/XPS/CBZ documents through MuPDF.
#[derive(Clone, Copy, Debug, Default)]
pub struct MuPdfCodec;

impl PageCodec for MuPdfCodec {
    type Handle = MuPdfHandle;

    fn open(&self, staged: &Path) -> Result<MuPdfHandle, CodecError> {
        MuPdfHandle::spawn(staged.to_path_buf())
    }
}

pub struct MuPdfHandle {
    jobs: Sender<Job>,
    thread: Option<JoinHandle<()>>,
    page_count: usize,
}

impl MuPdfHandle {
    fn spawn(path: PathBuf) -> Result<Self, CodecError> {
        let (jobs_tx, jobs_rx) = flume::unbounded();
        let (ready_tx, ready_rx) = flume::bounded(1);

        let thread = std::thread::Builder::new()
            .name("mupdf-handle".into())
            .spawn(move || document_thread(&path, jobs_rx, ready_tx))
            .map_err(|e| CodecError::Open(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(page_count)) => Ok(Self {
                jobs: jobs_tx,
                thread: Some(thread),
                page_count,
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(CodecError::Open("document thread exited".into()))
            }
        }
    }
}

impl PageHandle for MuPdfHandle {
    fn page_count(&self) -> usize {
        self.page_count
    }

    fn render_page(&mut self, index: usize, target_width: u32) -> Result<PageImage, CodecError> {
        let (reply, result) = flume::bounded(1);
        self.jobs
            .send(Job::Render {
                index,
                target_width,
                reply,
            })
            .map_err(|_| CodecError::render(index, "document handle closed"))?;
        result
            .recv()
            .map_err(|_| CodecError::render(index, "document thread exited"))?
    }

    fn close(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.jobs.send(Job::Shutdown);
            if thread.join().is_err() {
                warn!("MuPDF document thread panicked");
            }
        }
    }
}

impl Drop for MuPdfHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[expect(
    clippy::needless_pass_by_value,
    reason = "Values moved into thread, need ownership"
)]
fn document_thread(
    path: &Path,
    jobs: Receiver<Job>,
    ready: Sender<Result<usize, CodecError>>,
) {
    let doc = match Document::open(path.to_string_lossy().as_ref()) {
        Ok(doc) => doc,
        Err(e) => {
            let _ = ready.send(Err(CodecError::Open(e.to_string())));
            return;
        }
    };
    let page_count = match doc.page_count() {
        Ok(n) => usize::try_from(n).unwrap_or(0),
        Err(e) => {
            let _ = ready.send(Err(CodecError::Open(e.to_string())));
            return;
        }
    };
    if ready.send(Ok(page_count)).is_err() {
        return;
    }
    debug!("Opened {path:?} with {page_count} pages");

    for job in jobs {
        match job {
            Job::Render {
                index,
                target_width,
                reply,
            } => {
                let _ = reply.send(render_page(&doc, index, target_width));
            }
            Job::Shutdown => break,
        }
    }
    debug!("Closed {path:?}");
}

fn render_page(doc: &Document, index: usize, target_width: u32) -> Result<PageImage, CodecError> {
    let page_no = i32::try_from(index).map_err(|_| CodecError::render(index, "page out of range"))?;
    let page = doc
        .load_page(page_no)
        .map_err(|e| CodecError::from_render_failure(index, e))?;
    let bounds = page
        .bounds()
        .map_err(|e| CodecError::from_render_failure(index, e))?;

    let page_width = bounds.x1 - bounds.x0;
    let page_height = bounds.y1 - bounds.y0;
    let (width, _) = fit_width(page_width, page_height, target_width);
    let mag = width as f32 / page_width.max(1.0);

    let rgb = Colorspace::device_rgb();
    let pixmap = page
        .to_pixmap(&Matrix::new_scale(mag, mag), &rgb, false, false)
        .map_err(|e| CodecError::from_render_failure(index, e))?;

    pixmap_to_image(&pixmap, index)
}

fn pixmap_to_image(pixmap: &Pixmap, index: usize) -> Result<PageImage, CodecError> {
    let n = pixmap.n() as usize;
    if n < 3 {
        return Err(CodecError::render(
            index,
            format!("unsupported pixmap format: {n} channels"),
        ));
    }

    let width = pixmap.width() as usize;
    let height = pixmap.height() as usize;
    let stride = pixmap.stride() as usize;
    let samples = pixmap.samples();
    let row_bytes = width * n;
    if samples.len() < stride.saturating_mul(height) || row_bytes > stride {
        return Err(CodecError::render(index, "pixmap buffer size mismatch"));
    }

    let mut out = Vec::new();
    out.try_reserve_exact(width * height * 3)
        .map_err(|_| CodecError::OutOfMemory { page: index })?;
    for y in 0..height {
        let row_start = y * stride;
        let row = &samples[row_start..row_start + row_bytes];
        if n == 3 {
            out.extend_from_slice(row);
        } else {
            for px in row.chunks_exact(n) {
                out.extend_from_slice(&px[..3]);
            }
        }
    }

    PageImage::from_raw(pixmap.width(), pixmap.height(), out)
        .ok_or_else(|| CodecError::render(index, "pixel buffer does not match dimensions"))
}
