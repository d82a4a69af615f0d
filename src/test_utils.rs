//! In-memory document engine for tests
//!
//! [`FakeSource`] renders deterministic pixels, counts engine calls and can
//! be told to fail pages or hold renders until a test releases them.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use flume::{Receiver, Sender};

use crate::pdf::{
    Bitmap, DocumentEngine, PageLink, PageSize, PixelFormat, RenderError, RenderSource,
    check_page,
};

/// US Letter in points
pub const FAKE_PAGE_SIZE: PageSize = PageSize::new(612.0, 792.0);

/// Holds renders of selected pages until released
struct Gate {
    pages: HashSet<usize>,
    release: Receiver<()>,
    started: Sender<usize>,
}

impl Gate {
    fn new(pages: HashSet<usize>) -> (Arc<Self>, GateControl) {
        let (release_tx, release_rx) = flume::unbounded();
        let (started_tx, started_rx) = flume::unbounded();
        let gate = Arc::new(Self {
            pages,
            release: release_rx,
            started: started_tx,
        });
        let control = GateControl {
            release: release_tx,
            started: started_rx,
        };
        (gate, control)
    }

    fn hold(&self, tag: usize) {
        let _ = self.started.send(tag);
        let _ = self.release.recv_timeout(Duration::from_secs(5));
    }
}

/// Handle a test uses to watch and release held calls
pub struct GateControl {
    release: Sender<()>,
    started: Receiver<usize>,
}

impl GateControl {
    /// Block until a held call has started, returning its page or open number
    pub fn wait_started(&self) -> Option<usize> {
        self.started.recv_timeout(Duration::from_secs(5)).ok()
    }

    /// Let one held call finish
    pub fn release_one(&self) {
        let _ = self.release.send(());
    }
}

/// Deterministic render source
pub struct FakeSource {
    page_count: usize,
    links: Mutex<HashMap<usize, Vec<PageLink>>>,
    failing: Mutex<HashSet<usize>>,
    size_skew: AtomicUsize,
    renders: AtomicUsize,
    renders_by_page: Mutex<HashMap<usize, usize>>,
    gate: Mutex<Option<Arc<Gate>>>,
}

impl FakeSource {
    #[must_use]
    pub fn new(page_count: usize) -> Self {
        Self {
            page_count,
            links: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            size_skew: AtomicUsize::new(0),
            renders: AtomicUsize::new(0),
            renders_by_page: Mutex::new(HashMap::new()),
            gate: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_links(self, page: usize, links: Vec<PageLink>) -> Self {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(page, links);
        self
    }

    /// Renders of `page` fail from now on
    pub fn fail_page(&self, page: usize) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(page);
    }

    /// Produce bitmaps this many pixels wider than requested
    pub fn set_size_skew(&self, extra: usize) {
        self.size_skew.store(extra, Ordering::SeqCst);
    }

    /// Hold renders of `pages` until [`GateControl::release_one`] is called
    pub fn hold_pages(&self, pages: &[usize]) -> GateControl {
        let (gate, control) = Gate::new(pages.iter().copied().collect());
        *self.gate.lock().unwrap_or_else(PoisonError::into_inner) = Some(gate);
        control
    }

    /// Total engine render calls
    #[must_use]
    pub fn render_count(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn render_count_for(&self, page: usize) -> usize {
        self.renders_by_page
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&page)
            .copied()
            .unwrap_or(0)
    }

    /// Pixel value every byte of a page's raster is filled with
    #[must_use]
    pub fn fill_byte(page: usize, width: u32, height: u32) -> u8 {
        ((page * 31 + width as usize * 7 + height as usize) % 251) as u8
    }
}

impl RenderSource for FakeSource {
    fn page_count(&self) -> usize {
        self.page_count
    }

    fn page_size(&self, page: usize) -> Result<PageSize, RenderError> {
        check_page(page, self.page_count)?;
        Ok(FAKE_PAGE_SIZE)
    }

    fn render_page(
        &self,
        page: usize,
        width: u32,
        height: u32,
        _density: f32,
    ) -> Result<Bitmap, RenderError> {
        check_page(page, self.page_count)?;
        self.renders.fetch_add(1, Ordering::SeqCst);
        *self
            .renders_by_page
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(page)
            .or_insert(0) += 1;

        let gate = self
            .gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(gate) = gate.filter(|g| g.pages.contains(&page)) {
            gate.hold(page);
        }

        if self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&page)
        {
            return Err(RenderError::failure(format!("page {page} is corrupt")));
        }

        let width = width + self.size_skew.load(Ordering::SeqCst) as u32;
        let format = PixelFormat::Rgb8;
        let len = width as usize * height as usize * format.bytes_per_pixel();
        Ok(Bitmap {
            format,
            width,
            height,
            pixels: vec![Self::fill_byte(page, width, height); len],
        })
    }

    fn page_links(&self, page: usize) -> Result<Vec<PageLink>, RenderError> {
        check_page(page, self.page_count)?;
        Ok(self
            .links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&page)
            .cloned()
            .unwrap_or_default())
    }
}

/// Engine serving [`FakeSource`]s registered by path
#[derive(Default)]
pub struct FakeEngine {
    documents: Mutex<HashMap<PathBuf, Arc<FakeSource>>>,
    opens: AtomicUsize,
    open_gate: Mutex<Option<Arc<Gate>>>,
}

impl FakeEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `path` openable, returning the source for inspection
    pub fn add(&self, path: impl Into<PathBuf>, source: FakeSource) -> Arc<FakeSource> {
        let source = Arc::new(source);
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.into(), Arc::clone(&source));
        source
    }

    /// Hold every open until [`GateControl::release_one`] is called
    pub fn hold_opens(&self) -> GateControl {
        let (gate, control) = Gate::new(HashSet::new());
        *self.open_gate.lock().unwrap_or_else(PoisonError::into_inner) = Some(gate);
        control
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl DocumentEngine for FakeEngine {
    fn open_document(&self, path: &Path) -> Result<Arc<dyn RenderSource>, RenderError> {
        let open = self.opens.fetch_add(1, Ordering::SeqCst);
        let gate = self
            .open_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(gate) = gate {
            gate.hold(open);
        }

        let source: Arc<dyn RenderSource> = self
            .documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
            .ok_or_else(|| RenderError::open(path, "no such document"))?;
        Ok(source)
    }
}
