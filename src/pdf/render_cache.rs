//! Page render cache with single-flight rendering
//!
//! [`PageRenderCache::get`] answers from memory when it can and otherwise
//! asks the document's [`RenderSource`] for a fresh raster. At most one
//! render per [`RenderKey`] runs at a time: later callers for the same key
//! block on that render and share its outcome, while callers for other keys
//! proceed independently. The engine is never called with the cache lock
//! held.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use log::{debug, warn};

use super::cache::PageCache;
use super::engine::RenderSource;
use super::request::RenderError;
use super::types::{DocumentId, RenderKey, RenderedPage};

type RenderOutcome = Result<Arc<RenderedPage>, RenderError>;

/// Snapshot of cache occupancy and traffic
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub used_bytes: usize,
    pub budget_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub in_flight: usize,
}

struct OpenDocument {
    source: Arc<dyn RenderSource>,
    generation: u64,
}

struct Inner {
    pages: PageCache,
    documents: HashMap<DocumentId, OpenDocument>,
    in_flight: HashMap<RenderKey, Arc<InFlight>>,
    next_document_id: u64,
    hits: u64,
    misses: u64,
}

/// Outcome slot of one running render
#[derive(Default)]
struct InFlight {
    outcome: Mutex<Option<RenderOutcome>>,
    ready: Condvar,
}

impl InFlight {
    fn wait(&self) -> RenderOutcome {
        let mut outcome = self
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            outcome = self
                .ready
                .wait(outcome)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn complete(&self, result: RenderOutcome) {
        *self
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(result);
        self.ready.notify_all();
    }
}

/// Owns the in-flight slot for the render this thread is running.
///
/// Dropping it without [`PendingRender::finish`] (the engine panicked)
/// releases the waiters with an error.
struct PendingRender<'a> {
    cache: &'a PageRenderCache,
    key: RenderKey,
    generation: u64,
    flight: Arc<InFlight>,
    finished: bool,
}

impl PendingRender<'_> {
    fn finish(mut self, result: RenderOutcome) -> RenderOutcome {
        self.finished = true;
        self.settle(result)
    }

    fn settle(&self, result: RenderOutcome) -> RenderOutcome {
        {
            let mut inner = self.cache.lock();
            let ours = inner
                .in_flight
                .get(&self.key)
                .is_some_and(|f| Arc::ptr_eq(f, &self.flight));
            if ours {
                inner.in_flight.remove(&self.key);
            }

            let current = inner
                .documents
                .get(&self.key.document)
                .is_some_and(|doc| doc.generation == self.generation);
            match &result {
                Ok(page) if current => {
                    inner.pages.insert(Arc::clone(page));
                }
                Ok(_) => {
                    debug!(
                        "dropping render of {} page {}: document invalidated meanwhile",
                        self.key.document, self.key.page
                    );
                }
                Err(e) => {
                    warn!(
                        "render of {} page {} failed: {e}",
                        self.key.document, self.key.page
                    );
                }
            }
        }

        self.flight.complete(result.clone());
        result
    }
}

impl Drop for PendingRender<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.settle(Err(RenderError::failure("render aborted")));
        }
    }
}

/// Memory cache of rendered pages over a set of open documents
pub struct PageRenderCache {
    inner: Mutex<Inner>,
}

impl PageRenderCache {
    /// Create a cache holding at most `budget_bytes` of pixels
    #[must_use]
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pages: PageCache::new(budget_bytes),
                documents: HashMap::new(),
                in_flight: HashMap::new(),
                next_document_id: 1,
                hits: 0,
                misses: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make a document renderable and allocate its id
    pub fn register_document(&self, source: Arc<dyn RenderSource>) -> DocumentId {
        let mut inner = self.lock();
        let id = DocumentId(inner.next_document_id);
        inner.next_document_id += 1;
        debug!("registered {id} with {} pages", source.page_count());
        inner.documents.insert(
            id,
            OpenDocument {
                source,
                generation: 0,
            },
        );
        id
    }

    /// Drop the document's pages and its source. Returns false if it was not open.
    pub fn close_document(&self, document: DocumentId) -> bool {
        let closed = {
            let mut inner = self.lock();
            Self::invalidate_locked(&mut inner, document);
            inner.documents.remove(&document)
        };
        // Source is dropped here, outside the lock
        match closed {
            Some(_) => {
                debug!("closed {document}");
                true
            }
            None => false,
        }
    }

    /// Drop every cached raster of a document, returning how many were dropped.
    ///
    /// Renders still running for it complete for their callers but are not
    /// stored.
    pub fn invalidate(&self, document: DocumentId) -> usize {
        let mut inner = self.lock();
        Self::invalidate_locked(&mut inner, document)
    }

    fn invalidate_locked(inner: &mut Inner, document: DocumentId) -> usize {
        if let Some(doc) = inner.documents.get_mut(&document) {
            doc.generation += 1;
        }
        inner.in_flight.retain(|key, _| key.document != document);
        let dropped = inner.pages.invalidate_document(document);
        debug!("invalidated {dropped} cached pages of {document}");
        dropped
    }

    /// Source of an open document
    pub fn source(&self, document: DocumentId) -> Result<Arc<dyn RenderSource>, RenderError> {
        self.lock()
            .documents
            .get(&document)
            .map(|doc| Arc::clone(&doc.source))
            .ok_or(RenderError::DocumentClosed(document))
    }

    pub fn page_count(&self, document: DocumentId) -> Result<usize, RenderError> {
        self.source(document).map(|source| source.page_count())
    }

    #[must_use]
    pub fn is_open(&self, document: DocumentId) -> bool {
        self.lock().documents.contains_key(&document)
    }

    /// Return the page for `key`, rendering it if it is not cached
    pub fn get(&self, key: &RenderKey) -> Result<Arc<RenderedPage>, RenderError> {
        key.validate()?;

        let (source, generation, flight) = {
            let mut inner = self.lock();
            let (source, generation) = match inner.documents.get(&key.document) {
                Some(doc) => (Arc::clone(&doc.source), doc.generation),
                None => return Err(RenderError::DocumentClosed(key.document)),
            };

            let page_count = source.page_count();
            if key.page >= page_count {
                return Err(RenderError::PageIndexOutOfRange {
                    page: key.page,
                    page_count,
                });
            }

            if let Some(page) = inner.pages.get(key) {
                inner.hits += 1;
                return Ok(page);
            }

            if let Some(flight) = inner.in_flight.get(key).map(Arc::clone) {
                drop(inner);
                debug!(
                    "joining in-flight render of {} page {}",
                    key.document, key.page
                );
                return flight.wait();
            }

            inner.misses += 1;
            let flight = Arc::new(InFlight::default());
            inner.in_flight.insert(key.clone(), Arc::clone(&flight));
            (source, generation, flight)
        };

        let pending = PendingRender {
            cache: self,
            key: key.clone(),
            generation,
            flight,
            finished: false,
        };

        debug!(
            "rendering {} page {} at {}x{} density {}",
            key.document,
            key.page,
            key.width,
            key.height,
            key.density()
        );
        let result = source
            .render_page(key.page, key.width, key.height, key.density())
            .and_then(|bitmap| RenderedPage::from_bitmap(key.clone(), bitmap))
            .map(Arc::new);

        pending.finish(result)
    }

    /// Cached page without rendering, promoting it in the LRU order
    #[must_use]
    pub fn get_cached(&self, key: &RenderKey) -> Option<Arc<RenderedPage>> {
        self.lock().pages.get(key)
    }

    /// Check if a key is cached without promoting it
    #[must_use]
    pub fn contains(&self, key: &RenderKey) -> bool {
        self.lock().pages.contains(key)
    }

    #[must_use]
    pub fn is_in_flight(&self, key: &RenderKey) -> bool {
        self.lock().in_flight.contains_key(key)
    }

    pub fn set_budget(&self, budget_bytes: usize) {
        self.lock().pages.set_budget(budget_bytes);
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.pages.len(),
            used_bytes: inner.pages.used_bytes(),
            budget_bytes: inner.pages.budget_bytes(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.pages.evictions(),
            in_flight: inner.in_flight.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeSource;

    fn cache_with_doc(pages: usize) -> (PageRenderCache, Arc<FakeSource>, DocumentId) {
        let cache = PageRenderCache::new(usize::MAX);
        let source = Arc::new(FakeSource::new(pages));
        let id = cache.register_document(source.clone());
        (cache, source, id)
    }

    #[test]
    fn second_get_is_served_from_memory() {
        let (cache, source, doc) = cache_with_doc(3);
        let key = RenderKey::new(doc, 1, 40, 30, 2.0);

        let first = cache.get(&key).unwrap();
        let second = cache.get(&key).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.render_count(), 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn page_past_the_end_is_out_of_range() {
        let (cache, source, doc) = cache_with_doc(3);
        let err = cache.get(&RenderKey::new(doc, 3, 10, 10, 1.0)).unwrap_err();

        assert_eq!(
            err,
            RenderError::PageIndexOutOfRange {
                page: 3,
                page_count: 3
            }
        );
        assert_eq!(source.render_count(), 0);
    }

    #[test]
    fn zero_width_is_rejected_before_rendering() {
        let (cache, source, doc) = cache_with_doc(1);
        let err = cache.get(&RenderKey::new(doc, 0, 0, 10, 1.0)).unwrap_err();

        assert!(matches!(err, RenderError::InvalidRenderDimensions { .. }));
        assert_eq!(source.render_count(), 0);
    }

    #[test]
    fn unknown_document_is_closed() {
        let cache = PageRenderCache::new(1024);
        let err = cache
            .get(&RenderKey::new(DocumentId(42), 0, 10, 10, 1.0))
            .unwrap_err();
        assert_eq!(err, RenderError::DocumentClosed(DocumentId(42)));
    }

    #[test]
    fn engine_failure_is_surfaced_and_not_cached() {
        let (cache, source, doc) = cache_with_doc(2);
        source.fail_page(1);
        let good = RenderKey::new(doc, 0, 10, 10, 1.0);
        let bad = RenderKey::new(doc, 1, 10, 10, 1.0);

        cache.get(&good).unwrap();
        assert!(matches!(
            cache.get(&bad),
            Err(RenderError::RenderFailure { .. })
        ));
        assert!(!cache.contains(&bad));
        assert!(cache.contains(&good));
        assert!(!cache.is_in_flight(&bad));
    }

    #[test]
    fn wrong_sized_bitmap_is_a_render_failure() {
        let (cache, source, doc) = cache_with_doc(1);
        source.set_size_skew(1);

        let err = cache.get(&RenderKey::new(doc, 0, 10, 10, 1.0)).unwrap_err();
        assert!(matches!(err, RenderError::RenderFailure { .. }));
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn close_document_drops_pages_and_source() {
        let (cache, _source, doc) = cache_with_doc(2);
        let key = RenderKey::new(doc, 0, 10, 10, 1.0);
        cache.get(&key).unwrap();

        assert!(cache.close_document(doc));
        assert!(!cache.contains(&key));
        assert!(!cache.is_open(doc));
        assert_eq!(cache.get(&key), Err(RenderError::DocumentClosed(doc)));
        assert!(!cache.close_document(doc));
    }

    #[test]
    fn budget_evicts_least_recent_page() {
        let (cache, source, doc) = cache_with_doc(3);
        // Each 10x10 RGB page is 300 bytes
        cache.set_budget(600);

        let keys: Vec<_> = (0..3).map(|p| RenderKey::new(doc, p, 10, 10, 1.0)).collect();
        cache.get(&keys[0]).unwrap();
        cache.get(&keys[1]).unwrap();
        cache.get(&keys[0]).unwrap();
        cache.get(&keys[2]).unwrap();

        assert!(cache.contains(&keys[0]));
        assert!(!cache.contains(&keys[1]));
        assert!(cache.contains(&keys[2]));
        assert_eq!(source.render_count(), 3);
        assert_eq!(cache.stats().evictions, 1);
    }
}
