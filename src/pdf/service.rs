//! Render service - feeds the page cache from a worker pool

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use flume::{Receiver, Sender};
use log::debug;

use super::links::LinkKey;
use super::render_cache::PageRenderCache;
use super::request::{CancelToken, RenderRequest, RenderResponse, RequestId};
use super::types::{DocumentId, RenderKey};
use super::worker::render_worker;

#[derive(Debug)]
struct PendingRequest {
    key: RenderKey,
    cancel: CancelToken,
    prefetch: bool,
}

/// Asynchronous, cancellable page requests for a display surface.
///
/// Callers queue keys and collect finished pages with
/// [`RenderService::poll_responses`]; the UI thread never waits on a render.
pub struct RenderService {
    cache: Arc<PageRenderCache>,
    request_tx: Sender<RenderRequest>,
    response_rx: Receiver<RenderResponse>,
    next_request_id: u64,
    pending_requests: HashMap<RequestId, PendingRequest>,
    pending_links: HashMap<RequestId, LinkKey>,
    num_workers: usize,
    workers: Vec<JoinHandle<()>>,
}

impl RenderService {
    /// Start `num_workers` render threads over `cache`
    #[must_use]
    pub fn new(cache: Arc<PageRenderCache>, num_workers: usize) -> Self {
        // flume gives us MPMC: every worker pulls from the one request queue
        let (request_tx, request_rx) = flume::unbounded();
        let (response_tx, response_rx) = flume::unbounded();

        let num_workers = num_workers.max(1);
        let workers = (0..num_workers)
            .map(|_| {
                let rx = request_rx.clone();
                let tx = response_tx.clone();
                let cache_clone = Arc::clone(&cache);
                std::thread::spawn(move || render_worker(rx, tx, cache_clone))
            })
            .collect();

        Self {
            cache,
            request_tx,
            response_rx,
            next_request_id: 1,
            pending_requests: HashMap::new(),
            pending_links: HashMap::new(),
            num_workers,
            workers,
        }
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<PageRenderCache> {
        &self.cache
    }

    /// Request a page to be rendered
    pub fn request_page(&mut self, key: RenderKey) -> RequestId {
        self.enqueue(key, false)
    }

    /// Request a page only if it is not cached or already pending
    pub fn request_page_if_needed(&mut self, key: RenderKey) -> Option<RequestId> {
        if self.cache.contains(&key) || self.is_pending(&key) {
            return None;
        }

        Some(self.request_page(key))
    }

    /// Queue the pages within `radius` of `key`'s page that are not cached yet
    pub fn prefetch_around(
        &mut self,
        key: &RenderKey,
        radius: usize,
        page_count: usize,
    ) -> Vec<RequestId> {
        let mut ids = Vec::new();
        for offset in 1..=radius {
            let ahead = key.page + offset;
            if ahead < page_count {
                ids.extend(self.maybe_prefetch(key.with_page(ahead)));
            }
            if key.page >= offset {
                ids.extend(self.maybe_prefetch(key.with_page(key.page - offset)));
            }
        }
        ids
    }

    fn maybe_prefetch(&mut self, key: RenderKey) -> Option<RequestId> {
        if self.cache.contains(&key) || self.is_pending(&key) {
            return None;
        }
        Some(self.enqueue(key, true))
    }

    fn enqueue(&mut self, key: RenderKey, prefetch: bool) -> RequestId {
        let id = self.next_id();
        let cancel = CancelToken::new();

        let request = if prefetch {
            RenderRequest::Prefetch {
                id,
                key: key.clone(),
                cancel: cancel.clone(),
            }
        } else {
            RenderRequest::Page {
                id,
                key: key.clone(),
                cancel: cancel.clone(),
            }
        };
        let _ = self.request_tx.send(request);
        self.pending_requests.insert(
            id,
            PendingRequest {
                key,
                cancel,
                prefetch,
            },
        );

        id
    }

    /// Queue link enumeration for one page unless it is already queued
    pub fn request_links(&mut self, key: LinkKey) -> Option<RequestId> {
        if self.links_pending(&key) {
            return None;
        }

        let id = self.next_id();
        let _ = self.request_tx.send(RenderRequest::Links {
            id,
            key: key.clone(),
        });
        self.pending_links.insert(id, key);
        Some(id)
    }

    #[must_use]
    pub fn links_pending(&self, key: &LinkKey) -> bool {
        self.pending_links.values().any(|pending| pending == key)
    }

    /// Cancel a queued request. A render that already started still
    /// completes, and false is returned for it.
    pub fn cancel(&mut self, id: RequestId) -> bool {
        self.pending_requests
            .get(&id)
            .is_some_and(|pending| pending.cancel.cancel())
    }

    /// Cancel queued requests for `document` whose page left the visible
    /// range. Returns how many were newly cancelled.
    pub fn cancel_outside(
        &mut self,
        document: DocumentId,
        visible: RangeInclusive<usize>,
    ) -> usize {
        let mut cancelled = 0;
        for (id, pending) in &self.pending_requests {
            if pending.key.document != document || visible.contains(&pending.key.page) {
                continue;
            }
            if pending.cancel.cancel() {
                debug!("cancelling request {id:?} for page {}", pending.key.page);
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Cancel everything pending for a document
    pub fn cancel_document(&mut self, document: DocumentId) {
        for pending in self.pending_requests.values() {
            if pending.key.document == document {
                pending.cancel.cancel();
            }
        }
    }

    fn is_pending(&self, key: &RenderKey) -> bool {
        self.pending_requests
            .values()
            .any(|pending| !pending.cancel.is_cancelled() && pending.key == *key)
    }

    /// Number of page and link requests queued or running
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending_requests.len() + self.pending_links.len()
    }

    /// Number of pending prefetches
    #[must_use]
    pub fn pending_prefetch_count(&self) -> usize {
        self.pending_requests.values().filter(|p| p.prefetch).count()
    }

    /// Poll for completed render responses
    pub fn poll_responses(&mut self) -> Vec<RenderResponse> {
        let mut responses = vec![];

        while let Ok(response) = self.response_rx.try_recv() {
            self.settle(response.id());
            responses.push(response);
        }

        responses
    }

    /// Block until the next response arrives or `timeout` passes
    pub fn wait_response(&mut self, timeout: Duration) -> Option<RenderResponse> {
        let response = self.response_rx.recv_timeout(timeout).ok()?;
        self.settle(response.id());
        Some(response)
    }

    fn settle(&mut self, id: RequestId) {
        if self.pending_requests.remove(&id).is_none() {
            self.pending_links.remove(&id);
        }
    }

    /// Get the response receiver for event-loop integration
    #[must_use]
    pub fn response_receiver(&self) -> &Receiver<RenderResponse> {
        &self.response_rx
    }

    /// Shutdown all workers
    pub fn shutdown(&mut self) {
        for pending in self.pending_requests.values() {
            pending.cancel.cancel();
        }
        for _ in 0..self.num_workers {
            let _ = self.request_tx.send(RenderRequest::Shutdown);
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }

    fn next_id(&mut self) -> RequestId {
        let id = RequestId::new(self.next_request_id);
        self.next_request_id += 1;
        id
    }
}

impl Drop for RenderService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::RenderError;
    use crate::test_utils::FakeSource;

    fn setup(pages: usize, workers: usize) -> (RenderService, Arc<FakeSource>, DocumentId) {
        let cache = Arc::new(PageRenderCache::new(usize::MAX));
        let source = Arc::new(FakeSource::new(pages));
        let doc = cache.register_document(source.clone());
        (RenderService::new(cache, workers), source, doc)
    }

    fn drain(service: &mut RenderService, expected: usize) -> Vec<RenderResponse> {
        (0..expected)
            .filter_map(|_| service.wait_response(Duration::from_secs(5)))
            .collect()
    }

    #[test]
    fn requested_page_arrives_and_is_cached() {
        let (mut service, _source, doc) = setup(3, 2);
        let key = RenderKey::new(doc, 0, 20, 20, 1.0);

        let id = service.request_page(key.clone());
        let responses = drain(&mut service, 1);

        assert!(matches!(
            &responses[0],
            RenderResponse::Page { id: got, page } if *got == id && page.key() == &key
        ));
        assert!(service.cache().contains(&key));
        assert_eq!(service.pending_count(), 0);
        assert!(service.request_page_if_needed(key).is_none());
    }

    #[test]
    fn out_of_range_request_reports_error() {
        let (mut service, _source, doc) = setup(1, 1);
        service.request_page(RenderKey::new(doc, 5, 20, 20, 1.0));

        let responses = drain(&mut service, 1);
        assert!(matches!(
            &responses[0],
            RenderResponse::Error {
                error: RenderError::PageIndexOutOfRange { page: 5, .. },
                ..
            }
        ));
    }

    #[test]
    fn cancelled_request_is_not_rendered() {
        let (mut service, source, doc) = setup(3, 1);
        let gate = source.hold_pages(&[0]);

        // Occupy the only worker so the next request stays queued
        service.request_page(RenderKey::new(doc, 0, 10, 10, 1.0));
        assert_eq!(gate.wait_started(), Some(0));

        let queued = service.request_page(RenderKey::new(doc, 2, 10, 10, 1.0));
        assert_eq!(service.cancel_outside(doc, 0..=1), 1);
        gate.release_one();

        let responses = drain(&mut service, 2);
        assert!(
            responses
                .iter()
                .any(|r| matches!(r, RenderResponse::Cancelled(id) if *id == queued))
        );
        assert_eq!(source.render_count_for(2), 0);
    }

    #[test]
    fn running_and_already_cancelled_requests_are_not_recounted() {
        let (mut service, source, doc) = setup(4, 1);
        let gate = source.hold_pages(&[0]);

        // Page 0 is running, page 3 is queued behind it; both are offscreen
        let running = service.request_page(RenderKey::new(doc, 0, 10, 10, 1.0));
        assert_eq!(gate.wait_started(), Some(0));
        let queued = service.request_page(RenderKey::new(doc, 3, 10, 10, 1.0));

        assert_eq!(service.cancel_outside(doc, 1..=2), 1);
        assert_eq!(service.cancel_outside(doc, 1..=2), 0);
        assert!(!service.cancel(queued));
        assert!(!service.cancel(running));
        gate.release_one();

        let responses = drain(&mut service, 2);
        assert!(
            responses
                .iter()
                .any(|r| matches!(r, RenderResponse::Page { id, .. } if *id == running))
        );
        assert!(
            responses
                .iter()
                .any(|r| matches!(r, RenderResponse::Cancelled(id) if *id == queued))
        );
        assert_eq!(source.render_count_for(3), 0);
    }

    #[test]
    fn links_arrive_mapped_and_deduplicated() {
        let (mut service, _source, doc) = setup(2, 1);
        let key = LinkKey {
            document: doc,
            page: 1,
            width: 100,
            height: 100,
            rotation: crate::pdf::Rotation::None,
        };

        let id = service.request_links(key.clone()).unwrap();
        assert!(service.links_pending(&key));
        assert!(service.request_links(key.clone()).is_none());

        let responses = drain(&mut service, 1);
        assert!(matches!(
            &responses[0],
            RenderResponse::Links { id: got, key: got_key, links: Ok(_) }
                if *got == id && *got_key == key
        ));
        assert_eq!(service.pending_count(), 0);
    }

    #[test]
    fn links_of_a_closed_document_report_it() {
        let (mut service, _source, doc) = setup(1, 1);
        assert!(service.cache().close_document(doc));

        service.request_links(LinkKey {
            document: doc,
            page: 0,
            width: 10,
            height: 10,
            rotation: crate::pdf::Rotation::None,
        });

        let responses = drain(&mut service, 1);
        assert!(matches!(
            &responses[0],
            RenderResponse::Links {
                links: Err(RenderError::DocumentClosed(_)),
                ..
            }
        ));
    }

    #[test]
    fn prefetch_queues_neighbours_within_bounds() {
        let (mut service, _source, doc) = setup(4, 2);
        let key = RenderKey::new(doc, 0, 10, 10, 1.0);

        let ids = service.prefetch_around(&key, 2, 4);
        assert_eq!(ids.len(), 2);
        assert_eq!(service.pending_prefetch_count(), 2);

        drain(&mut service, 2);
        assert!(service.cache().contains(&key.with_page(1)));
        assert!(service.cache().contains(&key.with_page(2)));
        assert!(!service.cache().contains(&key.with_page(3)));
    }
}
