//! Render scheduler - decides what to render and when, per document

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};

use super::cache::MemoryPageCache;
use super::codec::{PageCodec, PageHandle};
use super::disk::DiskPageStore;
use super::request::{RenderError, Result};
use super::session::{SessionEntry, ViewerSession};
use super::staging::StagingArea;
use super::types::{
    BatchReport, BatchStop, Document, PageImage, PageRecord, SessionSnapshot, SessionState,
};
use super::{DEFAULT_BATCH_SIZE, DEFAULT_INITIAL_BATCH, DEFAULT_TARGET_WIDTH, MIN_MEMORY_BUDGET};

const PAGES_DIR: &str = "pages";
const STAGED_DIR: &str = "staged";

/// Batch sizing and raster width
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub initial_batch: usize,
    pub batch_size: usize,
    pub target_width: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            initial_batch: DEFAULT_INITIAL_BATCH,
            batch_size: DEFAULT_BATCH_SIZE,
            target_width: DEFAULT_TARGET_WIDTH,
        }
    }
}

/// Owns one session per open document and renders pages in batches.
///
/// Safe to share across threads. Operations on different documents run
/// independently; batches for the same document are serialized on the
/// session's handle lock.
pub struct RenderScheduler<C: PageCodec> {
    codec: C,
    config: SchedulerConfig,
    store: DiskPageStore,
    staging: StagingArea,
    memory: Arc<MemoryPageCache>,
    sessions: Mutex<HashMap<String, Arc<SessionEntry<C::Handle>>>>,
}

impl<C: PageCodec> RenderScheduler<C> {
    /// Pages live under `<cache_root>/pages/<key>/`, staged sources under
    /// `<cache_root>/staged/`.
    pub fn new(
        codec: C,
        cache_root: &Path,
        memory: Arc<MemoryPageCache>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let store = DiskPageStore::new(cache_root.join(PAGES_DIR))?;
        let staging = StagingArea::new(cache_root.join(STAGED_DIR));
        Ok(Self {
            codec,
            config,
            store,
            staging,
            memory,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    #[must_use]
    pub fn store(&self) -> &DiskPageStore {
        &self.store
    }

    #[must_use]
    pub fn memory(&self) -> &Arc<MemoryPageCache> {
        &self.memory
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<SessionEntry<C::Handle>>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, document: &str) -> Option<Arc<SessionEntry<C::Handle>>> {
        self.lock_sessions().get(document).cloned()
    }

    /// Open a document and render its first batch.
    ///
    /// An existing session is returned as is, without rendering. If another
    /// caller is still opening the document this waits for it to finish.
    pub fn open_initial(&self, document: &Document) -> Result<SessionSnapshot> {
        let entry = Arc::new(SessionEntry::new(&document.name));
        let mut slot = entry.lock_session();
        {
            let mut sessions = self.lock_sessions();
            if let Some(existing) = sessions.get(&document.name).cloned() {
                drop(sessions);
                drop(slot);
                return Self::join_existing(&existing);
            }
            sessions.insert(document.name.clone(), Arc::clone(&entry));
        }
        info!("Opening {}", document.name);

        let handle = match self.open_handle(document) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Failed to open {}: {e}", document.name);
                entry.set_state(SessionState::Unopened);
                let mut sessions = self.lock_sessions();
                if sessions
                    .get(&document.name)
                    .is_some_and(|current| Arc::ptr_eq(current, &entry))
                {
                    sessions.remove(&document.name);
                }
                return Err(e);
            }
        };

        let session = slot.insert(ViewerSession::new(&document.name, handle));
        entry.set_total(session.total_pages());
        info!(
            "Opened {} with {} pages",
            document.name,
            session.total_pages()
        );

        self.render_batch(&entry, session, self.config.initial_batch);
        entry.finish_opening();
        Ok(entry.snapshot())
    }

    fn join_existing(existing: &SessionEntry<C::Handle>) -> Result<SessionSnapshot> {
        if existing.state() == SessionState::Opening {
            // The opener holds the session lock until its first batch is done
            drop(existing.lock_session());
        }
        let snapshot = existing.snapshot();
        match snapshot.state {
            SessionState::Partial | SessionState::Full => Ok(snapshot),
            state => Err(RenderError::unavailable(
                existing.document(),
                format!("session is {state:?}"),
            )),
        }
    }

    fn open_handle(&self, document: &Document) -> Result<C::Handle> {
        let staged = self.staging.stage(document)?;
        self.codec
            .open(&staged)
            .map_err(|e| RenderError::unavailable(&document.name, e))
    }

    /// Render the next batch of an open document.
    ///
    /// Returns an idle report when the document is not open or every page
    /// has already been rendered; no codec access happens in that case.
    pub fn extend_batch(&self, document: &str) -> BatchReport {
        let Some(entry) = self.entry(document) else {
            return BatchReport::idle(document);
        };
        if entry.state() == SessionState::Full {
            return BatchReport::idle(document);
        }

        let mut slot = entry.lock_session();
        let Some(session) = slot.as_mut() else {
            return BatchReport::idle(document);
        };
        if entry.is_cancelled() || session.is_exhausted() {
            return BatchReport::idle(document);
        }

        self.render_batch(&entry, session, self.config.batch_size)
    }

    fn render_batch(
        &self,
        entry: &SessionEntry<C::Handle>,
        session: &mut ViewerSession<C::Handle>,
        size: usize,
    ) -> BatchReport {
        let requested = session.next_batch(size);
        let mut report = BatchReport {
            document: session.document().to_string(),
            requested: requested.clone(),
            pages: Vec::new(),
            skipped: Vec::new(),
            stop: BatchStop::Completed,
        };

        for index in requested {
            if entry.is_cancelled() {
                debug!("{} closed, abandoning batch at page {index}", report.document);
                report.stop = BatchStop::Cancelled;
                break;
            }

            match self.render_page(session, index) {
                Ok(record) => {
                    entry.publish(record.clone());
                    report.pages.push(record);
                    session.advance_to(index + 1);
                }
                Err(e) if e.is_out_of_memory() => {
                    error!("{}: {e}; stopping batch", report.document);
                    self.memory
                        .shrink_to((self.memory.budget() / 2).max(MIN_MEMORY_BUDGET));
                    report.stop = BatchStop::OutOfMemory { page: index };
                    break;
                }
                Err(e) => {
                    warn!("{}: skipping page {index}: {e}", report.document);
                    report.skipped.push(index);
                    session.advance_to(index + 1);
                }
            }
        }

        if session.is_exhausted() && report.stop != BatchStop::Cancelled {
            session.close();
            entry.set_state(SessionState::Full);
            info!("{} fully rendered", report.document);
        }
        debug!("Batch {report}");
        report
    }

    /// Render one page unless it is already on disk.
    fn render_page(
        &self,
        session: &mut ViewerSession<C::Handle>,
        index: usize,
    ) -> Result<PageRecord> {
        let document = session.document().to_string();
        if let Some(record) = self.store.record(&document, index)? {
            return Ok(record);
        }

        let handle = session
            .handle_mut()
            .ok_or_else(|| RenderError::unavailable(&document, "codec handle released"))?;
        let image = handle.render_page(index, self.config.target_width)?;
        let record = self.store.write(&document, index, &image)?;
        self.memory.put(record.path.clone(), Arc::new(image));
        Ok(record)
    }

    /// Page count of a document, opening it temporarily if it has no session.
    pub fn total_pages(&self, document: &Document) -> Result<usize> {
        if let Some(entry) = self.entry(&document.name) {
            let snapshot = entry.snapshot();
            if matches!(snapshot.state, SessionState::Partial | SessionState::Full) {
                return Ok(snapshot.total_pages);
            }
        }

        let staged = self.staging.staged_path(document);
        let staged = if staged.is_file() {
            staged
        } else {
            self.staging.stage(document)?
        };
        let mut handle = self
            .codec
            .open(&staged)
            .map_err(|e| RenderError::unavailable(&document.name, e))?;
        let count = handle.page_count();
        handle.close();
        Ok(count)
    }

    /// Close a document: release its codec handle and drop its pages from
    /// memory and disk.
    ///
    /// Safe to call while a batch is rendering; the batch stops after the
    /// page in progress and this waits for it.
    pub fn close(&self, document: &str) -> Result<()> {
        let removed = {
            let mut sessions = self.lock_sessions();
            let removed = sessions.remove(document);
            // Cancelled before it leaves the map, so no caller sees it gone but live
            if let Some(entry) = &removed {
                entry.cancel();
            }
            removed
        };
        if let Some(entry) = removed {
            let mut slot = entry.lock_session();
            if let Some(mut session) = slot.take() {
                session.close();
            }
            entry.set_state(SessionState::Closed);
            info!("Closed {document}");
        }

        self.memory.clear_prefix(&self.store.document_dir(document));

        let detached = {
            let sessions = self.lock_sessions();
            if sessions.contains_key(document) {
                debug!("{document} reopened during close, keeping its pages");
                return Ok(());
            }
            self.staging.remove(document)?;
            self.store.detach_document(document)?
        };
        if let Some(pages) = detached {
            pages.remove()?;
        }
        Ok(())
    }

    /// Close every open document.
    pub fn close_all(&self) -> Result<()> {
        let names: Vec<String> = self.lock_sessions().keys().cloned().collect();
        for name in names {
            self.close(&name)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn snapshot(&self, document: &str) -> Option<SessionSnapshot> {
        self.entry(document).map(|entry| entry.snapshot())
    }

    #[must_use]
    pub fn state(&self, document: &str) -> SessionState {
        self.entry(document)
            .map_or(SessionState::Unopened, |entry| entry.state())
    }

    #[must_use]
    pub fn open_documents(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_sessions().keys().cloned().collect();
        names.sort();
        names
    }

    /// Decoded page, from memory if resident, otherwise decoded from disk and cached.
    pub fn page_image(&self, path: &Path) -> Result<Arc<PageImage>> {
        if let Some(image) = self.memory.get(path) {
            return Ok(image);
        }
        let image = Arc::new(self.store.read(path)?);
        self.memory.put(PathBuf::from(path), Arc::clone(&image));
        Ok(image)
    }
}

impl<C: PageCodec> Drop for RenderScheduler<C> {
    fn drop(&mut self) {
        let sessions = std::mem::take(
            self.sessions
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for (_, entry) in sessions {
            entry.cancel();
            if let Some(mut session) = entry.lock_session().take() {
                session.close();
            }
        }
    }
}
