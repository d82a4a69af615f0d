//! Viewer state management

use std::path::PathBuf;

use super::types::{DocumentId, RenderKey};

/// Default upper bound for pinch zoom
pub const DEFAULT_MAX_ZOOM: f32 = 5.0;

/// Where the viewer is in the document lifecycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoadStatus {
    /// Nothing picked yet
    #[default]
    Init,
    Loading,
    Ready,
    /// The document as a whole could not be opened
    Error,
}

/// Size of the display surface
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub density: f32,
}

impl Viewport {
    #[must_use]
    pub const fn new(width: u32, height: u32, density: f32) -> Self {
        Self {
            width,
            height,
            density,
        }
    }

    /// A surface that has not been laid out yet has nothing to render into
    #[must_use]
    pub fn is_laid_out(&self) -> bool {
        self.width > 0 && self.height > 0 && self.density > 0.0
    }
}

/// Current state of the viewer
#[derive(Clone, Debug, PartialEq)]
pub struct ViewerState {
    pub load_status: LoadStatus,

    /// Open document, once loaded
    pub document: Option<DocumentId>,

    /// Path of the open or loading document
    pub document_path: Option<PathBuf>,

    /// Total page count
    pub page_count: usize,

    /// Current page (0-indexed)
    pub current_page: usize,

    pub viewport: Viewport,

    /// Display zoom applied on top of the rendered page
    pub zoom: f32,

    pub max_zoom: f32,

    /// Why the last load failed
    pub error: Option<String>,
}

impl Default for ViewerState {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ZOOM)
    }
}

impl ViewerState {
    #[must_use]
    pub fn new(max_zoom: f32) -> Self {
        Self {
            load_status: LoadStatus::Init,
            document: None,
            document_path: None,
            page_count: 0,
            current_page: 0,
            viewport: Viewport::default(),
            zoom: 1.0,
            max_zoom: max_zoom.max(1.0),
            error: None,
        }
    }

    /// Apply an action and return resulting effects
    #[must_use]
    pub fn apply(&mut self, action: Action) -> Vec<Effect> {
        match action {
            Action::LoadDocument(path) => {
                let mut effects = Vec::new();
                if let Some(old) = self.document.take() {
                    effects.push(Effect::CloseDocument(old));
                }
                self.load_status = LoadStatus::Loading;
                self.document_path = Some(path.clone());
                self.page_count = 0;
                self.current_page = 0;
                self.zoom = 1.0;
                self.error = None;
                effects.push(Effect::OpenDocument(path));
                effects
            }

            Action::DocumentLoaded {
                document,
                page_count,
            } => {
                self.load_status = LoadStatus::Ready;
                self.document = Some(document);
                self.page_count = page_count;
                self.current_page = 0;
                self.render_effects()
            }

            Action::LoadFailed(reason) => {
                self.load_status = LoadStatus::Error;
                self.document = None;
                self.page_count = 0;
                self.current_page = 0;
                self.error = Some(reason);
                vec![]
            }

            Action::CloseDocument => {
                let effects = match self.document.take() {
                    Some(doc) => vec![Effect::CloseDocument(doc)],
                    None => vec![],
                };
                let viewport = self.viewport;
                *self = Self::new(self.max_zoom);
                self.viewport = viewport;
                effects
            }

            Action::GoToPage(page) => self.go_to(page),

            Action::NextPage => self.go_to(self.current_page.saturating_add(1)),

            Action::PrevPage => self.go_to(self.current_page.saturating_sub(1)),

            Action::SetViewport(viewport) => {
                if self.viewport != viewport {
                    self.viewport = viewport;
                    self.render_effects()
                } else {
                    vec![]
                }
            }

            Action::SetZoom(zoom) => {
                self.zoom = self.clamp_zoom(zoom);
                vec![]
            }
        }
    }

    fn go_to(&mut self, page: usize) -> Vec<Effect> {
        let clamped = page.min(self.page_count.saturating_sub(1));
        if self.current_page != clamped {
            self.current_page = clamped;
            // Paging resets the pinch zoom of the page left behind
            self.zoom = 1.0;
            let mut effects = vec![Effect::CancelOffscreen];
            effects.extend(self.render_effects());
            effects
        } else {
            vec![]
        }
    }

    fn render_effects(&self) -> Vec<Effect> {
        if self.load_status == LoadStatus::Ready && self.viewport.is_laid_out() {
            vec![Effect::RenderCurrentPage, Effect::UpdatePrefetch]
        } else {
            vec![]
        }
    }

    fn clamp_zoom(&self, zoom: f32) -> f32 {
        if zoom.is_finite() {
            zoom.clamp(1.0, self.max_zoom)
        } else {
            1.0
        }
    }

    /// Swiping between pages is only allowed while not zoomed in
    #[must_use]
    pub fn scroll_enabled(&self) -> bool {
        self.zoom <= 1.0
    }

    /// Key for `page` at the current viewport, if a document is ready
    #[must_use]
    pub fn render_key(&self, page: usize) -> Option<RenderKey> {
        let document = self.document?;
        if self.load_status != LoadStatus::Ready || !self.viewport.is_laid_out() {
            return None;
        }
        Some(RenderKey::new(
            document,
            page,
            self.viewport.width,
            self.viewport.height,
            self.viewport.density,
        ))
    }

    #[must_use]
    pub fn current_key(&self) -> Option<RenderKey> {
        self.render_key(self.current_page)
    }
}

/// Actions that modify viewer state
#[derive(Clone, Debug)]
pub enum Action {
    /// Open a document picked by the user
    LoadDocument(PathBuf),
    /// The engine opened the document
    DocumentLoaded {
        document: DocumentId,
        page_count: usize,
    },
    /// The engine could not open the document
    LoadFailed(String),
    CloseDocument,
    GoToPage(usize),
    NextPage,
    PrevPage,
    /// The display surface was laid out or resized
    SetViewport(Viewport),
    /// Pinch zoom changed
    SetZoom(f32),
}

/// Effects produced by state changes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    OpenDocument(PathBuf),
    /// Close the document and drop its cached pages
    CloseDocument(DocumentId),
    RenderCurrentPage,
    UpdatePrefetch,
    /// Cancel queued renders of pages no longer near the current one
    CancelOffscreen,
}
