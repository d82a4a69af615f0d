//! Document engine seam
//!
//! The cache never parses PDF itself. A [`DocumentEngine`] opens files and
//! hands back a [`RenderSource`] for each document; dropping the last handle
//! to a source closes the document.

use std::path::Path;
use std::sync::Arc;

use super::geometry::map_page_rect_to_device;
use super::request::RenderError;
use super::types::{Bitmap, DeviceRect, PageLink, PageRect, PageSize, Rotation};

/// Opens documents
pub trait DocumentEngine: Send + Sync {
    fn open_document(&self, path: &Path) -> Result<Arc<dyn RenderSource>, RenderError>;
}

/// One open document.
///
/// Sources are called from several render workers at once. An engine whose
/// native handle is not thread-safe must serialize calls internally or give
/// each worker its own handle.
pub trait RenderSource: Send + Sync {
    fn page_count(&self) -> usize;

    fn page_size(&self, page: usize) -> Result<PageSize, RenderError>;

    /// Rasterize `page` to exactly `width x height` pixels
    fn render_page(
        &self,
        page: usize,
        width: u32,
        height: u32,
        density: f32,
    ) -> Result<Bitmap, RenderError>;

    /// Link annotations in enumeration order, in page space
    fn page_links(&self, page: usize) -> Result<Vec<PageLink>, RenderError>;

    fn map_rect_to_device(
        &self,
        page: usize,
        rect: PageRect,
        width: u32,
        height: u32,
        rotation: Rotation,
    ) -> Result<DeviceRect, RenderError> {
        let size = self.page_size(page)?;
        Ok(map_page_rect_to_device(size, rect, width, height, rotation))
    }
}

/// Bounds check shared by engine implementations
pub fn check_page(page: usize, page_count: usize) -> Result<(), RenderError> {
    if page < page_count {
        Ok(())
    } else {
        Err(RenderError::PageIndexOutOfRange { page, page_count })
    }
}
