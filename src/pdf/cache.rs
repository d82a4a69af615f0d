//! LRU page cache for rendered PDF pages, bounded by bytes

use std::sync::Arc;

use log::debug;
use lru::LruCache;

use super::types::{DocumentId, RenderKey, RenderedPage};

/// A stored page and the bytes it is charged
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub page: Arc<RenderedPage>,
    pub size_bytes: usize,
}

/// LRU cache for rendered page data.
///
/// Entries are evicted least-recently-used first once the stored bytes
/// exceed the budget. The newest entry always survives its own insertion.
pub struct PageCache {
    cache: LruCache<RenderKey, CacheEntry>,
    budget_bytes: usize,
    used_bytes: usize,
    evictions: u64,
}

impl PageCache {
    /// Create a new cache with the given byte budget
    #[must_use]
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            cache: LruCache::unbounded(),
            budget_bytes,
            used_bytes: 0,
            evictions: 0,
        }
    }

    /// Get a cached page, promoting it in the LRU order
    #[must_use]
    pub fn get(&mut self, key: &RenderKey) -> Option<Arc<RenderedPage>> {
        self.cache.get(key).map(|entry| Arc::clone(&entry.page))
    }

    /// Check if a key is in the cache without promoting it
    #[must_use]
    pub fn contains(&self, key: &RenderKey) -> bool {
        self.cache.contains(key)
    }

    /// Insert a page into the cache, returning an Arc to the data
    pub fn insert(&mut self, page: Arc<RenderedPage>) -> Arc<RenderedPage> {
        let key = page.key().clone();
        let size_bytes = page.size_bytes();
        let entry = CacheEntry {
            page: Arc::clone(&page),
            size_bytes,
        };

        if let Some(old) = self.cache.put(key, entry) {
            self.used_bytes -= old.size_bytes;
        }
        self.used_bytes += size_bytes;
        self.evict_over_budget();

        page
    }

    fn evict_over_budget(&mut self) {
        while self.used_bytes > self.budget_bytes && self.cache.len() > 1 {
            let Some((key, entry)) = self.cache.pop_lru() else {
                break;
            };
            self.used_bytes -= entry.size_bytes;
            self.evictions += 1;
            debug!(
                "evicted {} page {} at {}x{} ({} bytes)",
                key.document, key.page, key.width, key.height, entry.size_bytes
            );
        }
    }

    /// Remove a single entry
    pub fn remove(&mut self, key: &RenderKey) -> bool {
        match self.cache.pop(key) {
            Some(entry) => {
                self.used_bytes -= entry.size_bytes;
                true
            }
            None => false,
        }
    }

    /// Invalidate every cached raster of a document, returning how many were dropped
    pub fn invalidate_document(&mut self, document: DocumentId) -> usize {
        let keys_to_remove: Vec<_> = self
            .cache
            .iter()
            .filter(|(k, _)| k.document == document)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &keys_to_remove {
            self.remove(key);
        }
        keys_to_remove.len()
    }

    /// Change the byte budget, evicting immediately if it shrank
    pub fn set_budget(&mut self, budget_bytes: usize) {
        self.budget_bytes = budget_bytes;
        self.evict_over_budget();
    }

    /// Number of cached pages
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Check if cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    #[must_use]
    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    /// Entries dropped to stay within budget since creation
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.evictions
    }
}
