//! Viewer - ties the engine, page cache, render service and state together
//!
//! A display surface drives the viewer with [`Action`]s and reads pages back
//! either blocking ([`Viewer::fetch_page`]) or through the render service
//! ([`Viewer::poll_pages`]). Effects produced by the state container are run
//! here, so callers never touch the cache directly.
//!
//! Nothing reachable from [`Viewer::dispatch`] or [`Viewer::tap`] calls the
//! engine on the caller's thread. Documents open on a loader thread and
//! links are enumerated by the render workers; both report back through
//! channels drained by [`Viewer::poll_pages`].

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use log::{debug, error, info, warn};

use crate::pdf::{
    Action, DocumentEngine, Effect, LinkIndex, LinkKey, LinkRect, LinkTarget, LoadStatus,
    PageRenderCache, Point, RenderError, RenderResponse, RenderService, RenderSource,
    RenderedPage, RequestId, Rotation, StateStore, ViewerState, hit_test,
};
use crate::settings;

/// Knobs for building a [`Viewer`]
#[derive(Clone, Debug, PartialEq)]
pub struct ViewerConfig {
    pub cache_budget_bytes: usize,
    pub render_workers: usize,
    pub prefetch_radius: usize,
    pub max_zoom: f32,
    pub link_cache_capacity: usize,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        let defaults = settings::Settings::default();
        Self {
            cache_budget_bytes: settings::FALLBACK_CACHE_BUDGET,
            render_workers: defaults.render_workers,
            prefetch_radius: defaults.prefetch_radius,
            max_zoom: defaults.max_zoom,
            link_cache_capacity: defaults.link_cache_capacity,
        }
    }
}

impl ViewerConfig {
    /// Build from the loaded global settings
    #[must_use]
    pub fn from_settings() -> Self {
        Self {
            cache_budget_bytes: settings::get_cache_budget_bytes(),
            render_workers: settings::get_render_workers(),
            prefetch_radius: settings::get_prefetch_radius(),
            max_zoom: settings::get_max_zoom(),
            link_cache_capacity: settings::get_link_cache_capacity(),
        }
    }
}

/// What the host should do after a link was tapped
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkAction {
    /// The viewer already moved to this page
    GoToPage(usize),
    /// Hand the URI to the platform browser
    OpenUri(String),
}

/// Result of a tap on a page
#[derive(Clone, Debug, PartialEq)]
pub enum TapOutcome {
    Hit(LinkRect),
    Miss,
    /// The page's links are still being enumerated; tap again once
    /// [`Viewer::poll_pages`] has delivered them
    Pending,
}

/// A finished open, tagged with the load it belongs to
struct LoadOutcome {
    load: u64,
    path: PathBuf,
    result: Result<Arc<dyn RenderSource>, RenderError>,
}

pub struct Viewer {
    engine: Arc<dyn DocumentEngine>,
    cache: Arc<PageRenderCache>,
    service: RenderService,
    store: StateStore,
    links: LinkIndex,
    failed_links: HashMap<LinkKey, RenderError>,
    loads_tx: Sender<LoadOutcome>,
    loads_rx: Receiver<LoadOutcome>,
    current_load: u64,
    prefetch_radius: usize,
}

impl Viewer {
    #[must_use]
    pub fn new(engine: Arc<dyn DocumentEngine>, config: ViewerConfig) -> Self {
        let cache = Arc::new(PageRenderCache::new(config.cache_budget_bytes));
        let service = RenderService::new(Arc::clone(&cache), config.render_workers);
        debug!(
            "viewer started: budget {} bytes, {} render workers",
            config.cache_budget_bytes, config.render_workers
        );
        let (loads_tx, loads_rx) = flume::unbounded();
        Self {
            engine,
            cache,
            service,
            store: StateStore::new(ViewerState::new(config.max_zoom)),
            links: LinkIndex::new(config.link_cache_capacity),
            failed_links: HashMap::new(),
            loads_tx,
            loads_rx,
            current_load: 0,
            prefetch_radius: config.prefetch_radius,
        }
    }

    /// Apply `action` and every follow-up it triggers
    pub fn dispatch(&mut self, action: Action) {
        let mut queue = VecDeque::from([action]);
        while let Some(action) = queue.pop_front() {
            for effect in self.store.dispatch(action) {
                if let Some(next) = self.run_effect(effect) {
                    queue.push_back(next);
                }
            }
        }
    }

    fn run_effect(&mut self, effect: Effect) -> Option<Action> {
        match effect {
            Effect::OpenDocument(path) => {
                self.current_load += 1;
                let load = self.current_load;
                let engine = Arc::clone(&self.engine);
                let tx = self.loads_tx.clone();
                std::thread::spawn(move || {
                    let result = engine.open_document(&path);
                    let _ = tx.send(LoadOutcome { load, path, result });
                });
                None
            }

            Effect::CloseDocument(document) => {
                self.service.cancel_document(document);
                self.cache.close_document(document);
                self.links.invalidate_document(document);
                self.failed_links.retain(|key, _| key.document != document);
                None
            }

            Effect::RenderCurrentPage => {
                let state = self.store.snapshot();
                if let Some(key) = state.current_key() {
                    let _ = self.service.request_page_if_needed(key);
                }
                if let Ok(key) = link_key(&state, state.current_page) {
                    self.request_links(key);
                }
                None
            }

            Effect::UpdatePrefetch => {
                let state = self.store.snapshot();
                if let Some(key) = state.current_key() {
                    let _ = self
                        .service
                        .prefetch_around(&key, self.prefetch_radius, state.page_count);
                }
                None
            }

            Effect::CancelOffscreen => {
                let state = self.store.snapshot();
                if let Some(document) = state.document {
                    let first = state.current_page.saturating_sub(self.prefetch_radius);
                    let last = state.current_page.saturating_add(self.prefetch_radius);
                    let cancelled = self.service.cancel_outside(document, first..=last);
                    if cancelled > 0 {
                        debug!("cancelled {cancelled} offscreen renders");
                    }
                }
                None
            }
        }
    }

    /// Render (or reuse) `page` at the current viewport, blocking until done
    pub fn fetch_page(&self, page: usize) -> Result<Arc<RenderedPage>, RenderError> {
        let key = self
            .store
            .snapshot()
            .render_key(page)
            .ok_or(RenderError::NotReady)?;
        self.cache.get(&key)
    }

    /// Queue `page` at the current viewport without blocking
    pub fn request_page(&mut self, page: usize) -> Option<RequestId> {
        let key = self.store.snapshot().render_key(page)?;
        Some(self.service.request_page(key))
    }

    /// Finished asynchronous renders. Also completes pending document
    /// loads and stores any page links the workers enumerated.
    pub fn poll_pages(&mut self) -> Vec<RenderResponse> {
        while let Ok(outcome) = self.loads_rx.try_recv() {
            self.finish_load(outcome);
        }

        let responses = self.service.poll_responses();
        for response in &responses {
            self.absorb(response);
        }
        responses
    }

    /// Block until the next asynchronous render finishes or `timeout` passes
    pub fn wait_page(&mut self, timeout: Duration) -> Option<RenderResponse> {
        let response = self.service.wait_response(timeout)?;
        self.absorb(&response);
        Some(response)
    }

    /// Block until the current load settles or `timeout` passes
    pub fn wait_loaded(&mut self, timeout: Duration) -> LoadStatus {
        let deadline = Instant::now() + timeout;
        while self.store.snapshot().load_status == LoadStatus::Loading {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.loads_rx.recv_timeout(remaining) {
                Ok(outcome) => self.finish_load(outcome),
                Err(_) => break,
            }
        }
        self.store.snapshot().load_status
    }

    fn finish_load(&mut self, outcome: LoadOutcome) {
        let LoadOutcome { load, path, result } = outcome;
        if load != self.current_load || self.store.snapshot().load_status != LoadStatus::Loading {
            debug!("discarding superseded load of {}", path.display());
            return;
        }

        match result {
            Ok(source) => {
                let page_count = source.page_count();
                let document = self.cache.register_document(source);
                info!("opened {} as {document}", path.display());
                self.dispatch(Action::DocumentLoaded {
                    document,
                    page_count,
                });
            }
            Err(e) => {
                error!("failed to open {}: {e}", path.display());
                self.dispatch(Action::LoadFailed(e.to_string()));
            }
        }
    }

    fn absorb(&mut self, response: &RenderResponse) {
        let RenderResponse::Links { key, links, .. } = response else {
            return;
        };
        if !self.cache.is_open(key.document) {
            return;
        }
        match links {
            Ok(links) => self.links.insert(key.clone(), Arc::clone(links)),
            Err(e) => {
                warn!("could not read links of page {}: {e}", key.page);
                self.failed_links.insert(key.clone(), e.clone());
            }
        }
    }

    fn request_links(&mut self, key: LinkKey) {
        if !self.links.contains(&key) {
            let _ = self.service.request_links(key);
        }
    }

    /// Link under `point`, given in unzoomed page-raster pixels.
    ///
    /// Links that have not been enumerated yet are queued and
    /// [`TapOutcome::Pending`] is returned. A failed enumeration is reported
    /// once, and the next tap retries it.
    pub fn tap(&mut self, page: usize, point: Point) -> Result<TapOutcome, RenderError> {
        let key = link_key(&self.store.snapshot(), page)?;
        if let Some(e) = self.failed_links.remove(&key) {
            return Err(e);
        }

        match self.links.get(&key) {
            Some(links) => Ok(hit_test(&links, point)
                .cloned()
                .map_or(TapOutcome::Miss, TapOutcome::Hit)),
            None => {
                self.request_links(key);
                Ok(TapOutcome::Pending)
            }
        }
    }

    /// [`Viewer::tap`] that waits up to `timeout` for the page's links, for
    /// callers that are not on a display thread
    pub fn tap_blocking(
        &mut self,
        page: usize,
        point: Point,
        timeout: Duration,
    ) -> Result<Option<LinkRect>, RenderError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.tap(page, point)? {
                TapOutcome::Hit(link) => return Ok(Some(link)),
                TapOutcome::Miss => return Ok(None),
                TapOutcome::Pending => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() || self.wait_page(remaining).is_none() {
                        return Err(RenderError::failure("timed out waiting for page links"));
                    }
                }
            }
        }
    }

    /// Follow a tapped link. Internal targets move the viewer themselves.
    pub fn activate_link(&mut self, link: &LinkRect) -> Option<LinkAction> {
        match link.target()? {
            LinkTarget::Internal { page } => {
                let page_count = self.store.snapshot().page_count;
                if page < page_count {
                    self.dispatch(Action::GoToPage(page));
                    Some(LinkAction::GoToPage(page))
                } else {
                    warn!("link points past the last page: {page} >= {page_count}");
                    None
                }
            }
            LinkTarget::External { uri } => Some(LinkAction::OpenUri(uri)),
        }
    }

    #[must_use]
    pub fn state(&self) -> ViewerState {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> Receiver<ViewerState> {
        self.store.subscribe()
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<PageRenderCache> {
        &self.cache
    }

    #[must_use]
    pub fn pending_renders(&self) -> usize {
        self.service.pending_count()
    }
}

/// Links are mapped at the viewport size, unrotated
fn link_key(state: &ViewerState, page: usize) -> Result<LinkKey, RenderError> {
    let document = state.document.ok_or(RenderError::NotReady)?;
    if !state.viewport.is_laid_out() {
        return Err(RenderError::NotReady);
    }
    if page >= state.page_count {
        return Err(RenderError::PageIndexOutOfRange {
            page,
            page_count: state.page_count,
        });
    }

    Ok(LinkKey {
        document,
        page,
        width: state.viewport.width,
        height: state.viewport.height,
        rotation: Rotation::None,
    })
}
