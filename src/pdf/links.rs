//! Link hit-testing for tapped pages

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use super::engine::RenderSource;
use super::request::RenderError;
use super::types::{DocumentId, LinkRect, Point, Rotation};

/// First link, in the given order, whose bounds strictly contain `point`.
///
/// The order is the engine's enumeration order; no stacking order is
/// inferred and overlapping links are not re-ranked by area.
#[must_use]
pub fn hit_test(links: &[LinkRect], point: Point) -> Option<&LinkRect> {
    links.iter().find(|link| link.bounds.strictly_contains(point))
}

/// Enumerate a page's links mapped onto a `width x height` raster
pub fn device_links(
    source: &dyn RenderSource,
    page: usize,
    width: u32,
    height: u32,
    rotation: Rotation,
) -> Result<Vec<LinkRect>, RenderError> {
    source
        .page_links(page)?
        .into_iter()
        .map(|link| {
            let bounds = source.map_rect_to_device(page, link.bounds, width, height, rotation)?;
            Ok(LinkRect {
                target_uri: link.uri,
                destination_page: link.dest_page,
                bounds,
            })
        })
        .collect()
}

/// Cache key for a page's mapped links
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LinkKey {
    pub document: DocumentId,
    pub page: usize,
    pub width: u32,
    pub height: u32,
    pub rotation: Rotation,
}

/// LRU of mapped link lists, so repeated taps skip re-enumeration
pub struct LinkIndex {
    cache: LruCache<LinkKey, Arc<[LinkRect]>>,
}

impl LinkIndex {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    /// Mapped links for `key` if they were enumerated already
    pub fn get(&mut self, key: &LinkKey) -> Option<Arc<[LinkRect]>> {
        self.cache.get(key).map(Arc::clone)
    }

    #[must_use]
    pub fn contains(&self, key: &LinkKey) -> bool {
        self.cache.contains(key)
    }

    pub fn insert(&mut self, key: LinkKey, links: Arc<[LinkRect]>) {
        self.cache.put(key, links);
    }

    pub fn invalidate_document(&mut self, document: DocumentId) {
        let stale: Vec<_> = self
            .cache
            .iter()
            .filter(|(k, _)| k.document == document)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            self.cache.pop(&key);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
