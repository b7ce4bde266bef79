//! LRU page cache for decoded page images, bounded by byte footprint

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;
use lru::LruCache;

use super::types::PageImage;

/// Statistics about cache usage
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cached pages
    pub entries: usize,
    /// Bytes held by cached pixel buffers
    pub bytes_used: usize,
    /// Maximum bytes allowed
    pub budget: usize,
    pub hits: u64,
    pub misses: u64,
    /// Pages dropped to stay within budget
    pub evictions: u64,
}

impl CacheStats {
    /// Cache hit rate (0.0 to 1.0)
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheInner {
    pages: LruCache<PathBuf, Arc<PageImage>>,
    stats: CacheStats,
}

impl CacheInner {
    fn evict_until(&mut self, limit: usize) {
        while self.stats.bytes_used > limit {
            let Some((path, image)) = self.pages.pop_lru() else {
                break;
            };
            self.stats.bytes_used = self.stats.bytes_used.saturating_sub(footprint(&image));
            self.stats.evictions += 1;
            debug!("Evicted {path:?} from memory cache");
        }
        self.stats.entries = self.pages.len();
    }

    fn remove(&mut self, path: &Path) -> Option<Arc<PageImage>> {
        let image = self.pages.pop(path)?;
        self.stats.bytes_used = self.stats.bytes_used.saturating_sub(footprint(&image));
        self.stats.entries = self.pages.len();
        Some(image)
    }
}

/// Decoded pages keyed by their on-disk path.
///
/// Shared by every open document: entries from different documents compete
/// for the same budget. The lock is held only for map operations, never
/// across decoding or I/O.
pub struct MemoryPageCache {
    inner: Mutex<CacheInner>,
}

/// Bytes a page image occupies in memory.
#[must_use]
pub fn footprint(image: &PageImage) -> usize {
    image.as_raw().len()
}

impl MemoryPageCache {
    #[must_use]
    pub fn new(budget: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                pages: LruCache::unbounded(),
                stats: CacheStats {
                    budget,
                    ..CacheStats::default()
                },
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a cached page, promoting it in the LRU order
    #[must_use]
    pub fn get(&self, path: &Path) -> Option<Arc<PageImage>> {
        let mut inner = self.lock();
        match inner.pages.get(path).cloned() {
            Some(image) => {
                inner.stats.hits += 1;
                Some(image)
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Check if a page is cached without promoting it
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.lock().pages.contains(path)
    }

    /// Insert or replace a page, evicting least recently used pages to stay
    /// within budget. A page larger than the whole budget is not cached.
    pub fn put(&self, path: PathBuf, image: Arc<PageImage>) -> bool {
        let size = footprint(&image);
        let mut inner = self.lock();

        inner.remove(&path);
        if size > inner.stats.budget {
            debug!(
                "Page {path:?} ({size} bytes) exceeds cache budget of {} bytes",
                inner.stats.budget
            );
            return false;
        }

        inner.stats.bytes_used += size;
        inner.pages.put(path, image);
        let budget = inner.stats.budget;
        inner.evict_until(budget);
        true
    }

    pub fn remove(&self, path: &Path) -> Option<Arc<PageImage>> {
        self.lock().remove(path)
    }

    /// Drop every page stored under `prefix` (one document's directory).
    pub fn clear_prefix(&self, prefix: &Path) -> usize {
        let mut inner = self.lock();
        let doomed: Vec<PathBuf> = inner
            .pages
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &doomed {
            inner.remove(path);
        }
        doomed.len()
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.pages.clear();
        inner.stats.bytes_used = 0;
        inner.stats.entries = 0;
    }

    /// Lower the budget to `bytes` and evict least recently used pages to
    /// fit. Never raises the budget.
    pub fn shrink_to(&self, bytes: usize) {
        let mut inner = self.lock();
        inner.stats.budget = inner.stats.budget.min(bytes);
        let budget = inner.stats.budget;
        inner.evict_until(budget);
        debug!("Memory cache budget now {budget} bytes");
    }

    #[must_use]
    pub fn budget(&self) -> usize {
        self.lock().stats.budget
    }

    #[must_use]
    pub fn bytes_used(&self) -> usize {
        self.lock().stats.bytes_used
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().pages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(width: u32, height: u32) -> Arc<PageImage> {
        Arc::new(PageImage::new(width, height))
    }

    fn key(doc: &str, i: usize) -> PathBuf {
        PathBuf::from(format!("/cache/pages/{doc}/page_{i}.png"))
    }

    #[test]
    fn cache_insert_and_get() {
        let cache = MemoryPageCache::new(10_000);
        cache.put(key("a", 0), page(10, 10));

        assert!(cache.contains(&key("a", 0)));
        assert!(cache.get(&key("a", 0)).is_some());
        assert!(cache.get(&key("a", 1)).is_none());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.bytes_used(), 300);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn eviction_is_by_bytes_not_entries() {
        // 300 bytes per 10x10 page, room for three
        let cache = MemoryPageCache::new(900);
        for i in 0..3 {
            cache.put(key("a", i), page(10, 10));
        }
        assert_eq!(cache.len(), 3);

        // One 20x10 page (600 bytes) pushes out the two oldest
        cache.put(key("a", 3), page(20, 10));
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&key("a", 0)));
        assert!(!cache.contains(&key("a", 1)));
        assert!(cache.contains(&key("a", 2)));
        assert_eq!(cache.bytes_used(), 900);
        assert_eq!(cache.stats().evictions, 2);
    }

    #[test]
    fn eviction_follows_access_not_insertion() {
        let cache = MemoryPageCache::new(900);
        for i in 0..3 {
            cache.put(key("a", i), page(10, 10));
        }
        // Touch the oldest so page 1 becomes least recently used
        assert!(cache.get(&key("a", 0)).is_some());

        cache.put(key("a", 3), page(10, 10));
        assert!(cache.contains(&key("a", 0)));
        assert!(!cache.contains(&key("a", 1)));
    }

    #[test]
    fn replacing_an_entry_updates_footprint() {
        let cache = MemoryPageCache::new(10_000);
        cache.put(key("a", 0), page(10, 10));
        cache.put(key("a", 0), page(20, 10));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.bytes_used(), 600);
    }

    #[test]
    fn oversized_page_is_not_cached() {
        let cache = MemoryPageCache::new(500);
        cache.put(key("a", 0), page(10, 10));
        assert!(!cache.put(key("a", 1), page(20, 20)));
        assert!(cache.contains(&key("a", 0)));
        assert_eq!(cache.bytes_used(), 300);
    }

    #[test]
    fn clear_prefix_only_touches_one_document() {
        let cache = MemoryPageCache::new(10_000);
        for i in 0..3 {
            cache.put(key("atlas", i), page(10, 10));
            cache.put(key("atlas-2", i), page(10, 10));
        }

        let removed = cache.clear_prefix(Path::new("/cache/pages/atlas"));
        assert_eq!(removed, 3);
        assert_eq!(cache.len(), 3);
        assert!(cache.contains(&key("atlas-2", 0)));
        assert_eq!(cache.bytes_used(), 900);
    }

    #[test]
    fn shrink_to_drops_oldest_first() {
        let cache = MemoryPageCache::new(10_000);
        for i in 0..4 {
            cache.put(key("a", i), page(10, 10));
        }
        cache.shrink_to(600);
        assert_eq!(cache.budget(), 600);
        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&key("a", 3)));
        assert!(!cache.contains(&key("a", 0)));

        cache.shrink_to(5_000);
        assert_eq!(cache.budget(), 600);
    }

    #[test]
    fn clear_resets_usage() {
        let cache = MemoryPageCache::new(10_000);
        cache.put(key("a", 0), page(10, 10));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.bytes_used(), 0);
    }

    #[test]
    fn concurrent_puts_stay_within_budget() {
        let cache = Arc::new(MemoryPageCache::new(3_000));
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        cache.put(key(&format!("doc{t}"), i), page(10, 10));
                        let _ = cache.get(&key(&format!("doc{t}"), i / 2));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert!(cache.bytes_used() <= 3_000);
        assert_eq!(cache.bytes_used(), cache.len() * 300);
    }
}
