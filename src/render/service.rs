//! Render service - runs scheduler work off the caller's thread

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use flume::Receiver;
use log::{debug, warn};
use rayon::prelude::*;

use super::cache::MemoryPageCache;
use super::codec::PageCodec;
use super::prefetch::PrefetchPolicy;
use super::request::{RenderRequest, RequestId, Result};
use super::scheduler::RenderScheduler;
use super::types::{BatchReport, Document, PageImage, SessionSnapshot};
use crate::settings::RenderSettings;

/// Result of work running on a background thread.
pub struct PendingRender<T> {
    id: RequestId,
    rx: Receiver<T>,
}

impl<T> PendingRender<T> {
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Block until the work finishes. `None` if the worker died.
    pub fn wait(self) -> Option<T> {
        self.rx.recv().ok()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Take the result if it is ready, without blocking.
    pub fn try_take(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Channel for callers that multiplex several pending renders.
    #[must_use]
    pub fn receiver(&self) -> &Receiver<T> {
        &self.rx
    }
}

/// Clears a document's in-flight flag when the worker finishes or unwinds.
struct InFlight {
    set: Arc<Mutex<HashSet<String>>>,
    document: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.document);
    }
}

/// Front door for a viewer: opens documents in the background, extends
/// them as the reader scrolls and serves decoded pages.
///
/// Holds the per-document in-flight flag that keeps at most one batch
/// running per document.
pub struct RenderService<C: PageCodec> {
    scheduler: Arc<RenderScheduler<C>>,
    policy: PrefetchPolicy,
    in_flight: Arc<Mutex<HashSet<String>>>,
    next_request_id: AtomicU64,
}

impl<C: PageCodec> RenderService<C> {
    /// Build the memory cache, disk store and scheduler from settings.
    pub fn new(codec: C, settings: &RenderSettings) -> Result<Self> {
        let memory = Arc::new(MemoryPageCache::new(settings.memory_budget()));
        let scheduler = RenderScheduler::new(
            codec,
            &settings.resolved_cache_root(),
            memory,
            settings.scheduler_config(),
        )?;
        Ok(Self::with_scheduler(
            Arc::new(scheduler),
            settings.prefetch_policy(),
        ))
    }

    #[must_use]
    pub fn with_scheduler(scheduler: Arc<RenderScheduler<C>>, policy: PrefetchPolicy) -> Self {
        Self {
            scheduler,
            policy,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            next_request_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<RenderScheduler<C>> {
        &self.scheduler
    }

    #[must_use]
    pub fn policy(&self) -> PrefetchPolicy {
        self.policy
    }

    fn next_id(&self) -> RequestId {
        RequestId::new(self.next_request_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Mark a document busy; `None` if a batch is already running for it.
    fn claim(&self, document: &str) -> Option<InFlight> {
        let mut set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(document.to_string()) {
            return None;
        }
        Some(InFlight {
            set: Arc::clone(&self.in_flight),
            document: document.to_string(),
        })
    }

    #[must_use]
    pub fn is_in_flight(&self, document: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(document)
    }

    fn spawn<T, F>(&self, request: RenderRequest, guard: Option<InFlight>, work: F) -> PendingRender<T>
    where
        T: Send + 'static,
        F: FnOnce(&RenderScheduler<C>) -> T + Send + 'static,
    {
        let (tx, rx) = flume::bounded(1);
        let scheduler = Arc::clone(&self.scheduler);
        let id = request.id();
        debug!("Dispatching {request:?}");

        std::thread::spawn(move || {
            let result = work(&*scheduler);
            // Release both before the caller can observe completion
            drop(scheduler);
            drop(guard);
            let _ = tx.send(result);
        });

        PendingRender { id, rx }
    }

    /// Open a document and render its first batch in the background.
    pub fn open(&self, document: Document) -> PendingRender<Result<SessionSnapshot>> {
        let id = self.next_id();
        let guard = self.claim(&document.name);
        let request = RenderRequest::Initial {
            id,
            document: document.name.clone(),
        };
        self.spawn(request, guard, move |scheduler| scheduler.open_initial(&document))
    }

    /// Render the next batch unless one is already running for this document.
    pub fn request_more(&self, document: &str) -> Option<PendingRender<BatchReport>> {
        let guard = self.claim(document)?;
        let request = RenderRequest::Extend {
            id: self.next_id(),
            document: document.to_string(),
        };
        let name = document.to_string();
        Some(self.spawn(request, Some(guard), move |scheduler| {
            scheduler.extend_batch(&name)
        }))
    }

    /// Report the last page index the reader can see; starts the next batch
    /// when the prefetch policy says so.
    pub fn on_visible(
        &self,
        document: &str,
        last_visible: usize,
    ) -> Option<PendingRender<BatchReport>> {
        let snapshot = self.scheduler.snapshot(document)?;
        if !self
            .policy
            .should_extend_session(last_visible, &snapshot, self.is_in_flight(document))
        {
            return None;
        }
        debug!(
            "{document}: reader at {last_visible}, {} of {} rendered, prefetching",
            snapshot.rendered_count(),
            snapshot.total_pages
        );
        self.request_more(document)
    }

    #[must_use]
    pub fn snapshot(&self, document: &str) -> Option<SessionSnapshot> {
        self.scheduler.snapshot(document)
    }

    pub fn total_pages(&self, document: &Document) -> Result<usize> {
        self.scheduler.total_pages(document)
    }

    /// Close a document, waiting for the page in progress if a batch is running.
    pub fn close(&self, document: &str) -> Result<()> {
        self.scheduler.close(document)
    }

    /// A page already resident in memory.
    #[must_use]
    pub fn cached_page(&self, path: &Path) -> Option<Arc<PageImage>> {
        self.scheduler.memory().get(path)
    }

    /// Decode a page on a background thread (memory first, then disk).
    pub fn load_page(&self, path: &Path) -> PendingRender<Result<Arc<PageImage>>> {
        let (tx, rx) = flume::bounded(1);
        let scheduler = Arc::clone(&self.scheduler);
        let path = path.to_path_buf();
        std::thread::spawn(move || {
            let result = scheduler.page_image(&path);
            drop(scheduler);
            let _ = tx.send(result);
        });
        PendingRender {
            id: self.next_id(),
            rx,
        }
    }

    /// Decode every published page of a document that is not in memory,
    /// in parallel. Resolves to the number of pages loaded.
    pub fn warm_cache(&self, document: &str) -> PendingRender<usize> {
        let (tx, rx) = flume::bounded(1);
        let scheduler = Arc::clone(&self.scheduler);
        let document = document.to_string();
        std::thread::spawn(move || {
            let loaded = warm(&scheduler, &document);
            drop(scheduler);
            let _ = tx.send(loaded);
        });
        PendingRender {
            id: self.next_id(),
            rx,
        }
    }
}

fn warm<C: PageCodec>(scheduler: &RenderScheduler<C>, document: &str) -> usize {
    let Some(snapshot) = scheduler.snapshot(document) else {
        return 0;
    };
    let missing: Vec<PathBuf> = snapshot
        .pages
        .iter()
        .filter(|page| !scheduler.memory().contains(&page.path))
        .map(|page| page.path.clone())
        .collect();

    let loaded = missing
        .par_iter()
        .filter(|path| match scheduler.page_image(path) {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to warm {path:?}: {e}");
                false
            }
        })
        .count();
    debug!("Warmed {loaded} pages of {document}");
    loaded
}
