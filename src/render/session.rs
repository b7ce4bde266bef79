//! Per-document session state

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use log::debug;

use super::codec::PageHandle;
use super::types::{PageRecord, SessionSnapshot, SessionState};

/// Render progress of one open document.
///
/// Owns the codec handle exclusively. The handle is closed when every page
/// has been attempted, when the session is closed, or when it is dropped,
/// whichever comes first.
pub struct ViewerSession<H: PageHandle> {
    document: String,
    handle: Option<H>,
    total_pages: usize,
    /// Next page index to attempt
    next_page: usize,
}

impl<H: PageHandle> ViewerSession<H> {
    pub fn new(document: impl Into<String>, handle: H) -> Self {
        let total_pages = handle.page_count();
        Self {
            document: document.into(),
            handle: Some(handle),
            total_pages,
            next_page: 0,
        }
    }

    #[must_use]
    pub fn document(&self) -> &str {
        &self.document
    }

    #[must_use]
    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    #[must_use]
    pub fn next_page(&self) -> usize {
        self.next_page
    }

    /// Pages the next batch of `size` should cover.
    #[must_use]
    pub fn next_batch(&self, size: usize) -> Range<usize> {
        let end = self.next_page.saturating_add(size).min(self.total_pages);
        self.next_page..end
    }

    /// Record that every page before `page` has been attempted.
    pub fn advance_to(&mut self, page: usize) {
        self.next_page = self.next_page.max(page.min(self.total_pages));
    }

    /// Every page has been attempted.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.next_page >= self.total_pages
    }

    pub fn handle_mut(&mut self) -> Option<&mut H> {
        self.handle.as_mut()
    }

    #[must_use]
    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    /// Release the codec handle. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close();
            debug!("Released codec handle for {}", self.document);
        }
    }
}

impl<H: PageHandle> Drop for ViewerSession<H> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Registry entry shared between the scheduler, in-flight renders and readers.
///
/// `session` is locked for the whole duration of a batch, which serializes
/// use of the codec handle. Readers never touch it: they read the published
/// snapshot, which is replaced (never mutated) as pages land.
pub(crate) struct SessionEntry<H: PageHandle> {
    document: String,
    cancelled: AtomicBool,
    session: Mutex<Option<ViewerSession<H>>>,
    published: RwLock<SessionSnapshot>,
}

impl<H: PageHandle> SessionEntry<H> {
    pub(crate) fn new(document: &str) -> Self {
        Self {
            document: document.to_string(),
            cancelled: AtomicBool::new(false),
            session: Mutex::new(None),
            published: RwLock::new(SessionSnapshot {
                document: document.to_string(),
                state: SessionState::Opening,
                pages: Arc::from(Vec::new()),
                total_pages: 0,
            }),
        }
    }

    pub(crate) fn document(&self) -> &str {
        &self.document
    }

    pub(crate) fn lock_session(&self) -> MutexGuard<'_, Option<ViewerSession<H>>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn state(&self) -> SessionState {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.published
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .state = state;
    }

    pub(crate) fn set_total(&self, total_pages: usize) {
        self.published
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .total_pages = total_pages;
    }

    /// Leave `Opening` once the first batch is done. A session that already
    /// reached another state keeps it.
    pub(crate) fn finish_opening(&self) {
        let mut published = self.published.write().unwrap_or_else(PoisonError::into_inner);
        if published.state == SessionState::Opening {
            published.state = SessionState::Partial;
        }
    }

    /// Append a page to the published list.
    ///
    /// Pages arrive in ascending index order, so every snapshot ever handed
    /// out is a prefix of the later ones.
    pub(crate) fn publish(&self, record: PageRecord) {
        let mut published = self.published.write().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(
            published.pages.last().is_none_or(|last| last.index < record.index),
            "pages must be published in ascending order"
        );
        let pages: Vec<PageRecord> = published
            .pages
            .iter()
            .cloned()
            .chain(std::iter::once(record))
            .collect();
        published.pages = Arc::from(pages);
    }
}
