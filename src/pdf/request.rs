//! Render request and response types

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use super::links::LinkKey;
use super::types::{DocumentId, LinkRect, RenderKey, RenderedPage};

/// Unique identifier for render requests
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

impl RequestId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

const QUEUED: u8 = 0;
const STARTED: u8 = 1;
const CANCELLED: u8 = 2;

/// Shared between the service and the worker that picks the request up.
///
/// A request is cancelled or started exactly once; whichever side gets
/// there first wins.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicU8>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel a request that has not started. Returns false if it was
    /// already cancelled or a worker is rendering it.
    pub fn cancel(&self) -> bool {
        self.transition(CANCELLED)
    }

    /// Claim the request for rendering. Returns false if it was cancelled.
    pub fn start(&self) -> bool {
        self.transition(STARTED)
    }

    fn transition(&self, to: u8) -> bool {
        self.0
            .compare_exchange(QUEUED, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire) == CANCELLED
    }
}

/// Request sent to render workers
#[derive(Debug)]
pub enum RenderRequest {
    /// Render a visible page
    Page {
        id: RequestId,
        key: RenderKey,
        cancel: CancelToken,
    },

    /// Render a neighbour page ahead of time
    Prefetch {
        id: RequestId,
        key: RenderKey,
        cancel: CancelToken,
    },

    /// Enumerate a page's links mapped to device pixels
    Links { id: RequestId, key: LinkKey },

    /// Shutdown the worker
    Shutdown,
}

/// Errors from the render pipeline.
///
/// `Clone` so that one in-flight render can hand the same outcome to every
/// caller waiting on it.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum RenderError {
    #[error("cannot open {}: {detail}", path.display())]
    DocumentOpen { path: PathBuf, detail: String },

    #[error("{0} is not open")]
    DocumentClosed(DocumentId),

    #[error("page {page} is out of range (document has {page_count} pages)")]
    PageIndexOutOfRange { page: usize, page_count: usize },

    #[error("invalid render dimensions {width}x{height} at density {density}")]
    InvalidRenderDimensions {
        width: u32,
        height: u32,
        density: f32,
    },

    #[error("render failed: {detail}")]
    RenderFailure { detail: String },

    /// The viewer has no ready document or no laid-out viewport yet
    #[error("no document is ready to render")]
    NotReady,
}

impl RenderError {
    pub fn failure(msg: impl Into<String>) -> Self {
        Self::RenderFailure { detail: msg.into() }
    }

    pub fn open(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::DocumentOpen {
            path: path.into(),
            detail: detail.into(),
        }
    }
}

#[cfg(feature = "pdf")]
impl From<mupdf::error::Error> for RenderError {
    fn from(e: mupdf::error::Error) -> Self {
        Self::failure(format!("PDF engine: {e}"))
    }
}

/// Response from render workers
#[derive(Debug)]
pub enum RenderResponse {
    /// Rendered page
    Page {
        id: RequestId,
        page: Arc<RenderedPage>,
    },

    /// Request was cancelled before rendering started
    Cancelled(RequestId),

    /// Error during rendering
    Error {
        id: RequestId,
        key: RenderKey,
        error: RenderError,
    },

    /// Mapped links of one page, or why they could not be read
    Links {
        id: RequestId,
        key: LinkKey,
        links: Result<Arc<[LinkRect]>, RenderError>,
    },
}

impl RenderResponse {
    #[must_use]
    pub fn id(&self) -> RequestId {
        match self {
            Self::Page { id, .. }
            | Self::Cancelled(id)
            | Self::Error { id, .. }
            | Self::Links { id, .. } => *id,
        }
    }
}
