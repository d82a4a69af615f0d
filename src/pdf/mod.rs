//! PDF rendering infrastructure

mod cache;
mod engine;
mod geometry;
mod links;
#[cfg(feature = "pdf")]
mod mupdf_engine;
mod render_cache;
mod request;
mod service;
mod state;
mod store;
mod types;
mod worker;

pub use cache::{CacheEntry, PageCache};
pub use engine::{DocumentEngine, RenderSource, check_page};
pub use geometry::map_page_rect_to_device;
pub use links::{LinkIndex, LinkKey, device_links, hit_test};
#[cfg(feature = "pdf")]
pub use mupdf_engine::{MupdfEngine, MupdfSource};
pub use render_cache::{CacheStats, PageRenderCache};
pub use request::{CancelToken, RenderError, RenderRequest, RenderResponse, RequestId};
pub use service::RenderService;
pub use state::{Action, DEFAULT_MAX_ZOOM, Effect, LoadStatus, ViewerState, Viewport};
pub use store::StateStore;
pub use types::*;
